use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use diesel::prelude::*;

use crate::errors::ServiceError;
use crate::models::{
    self, Campaign, CampaignDetail, CampaignSummary, GameMaster, GameSystem, GameTable, Publisher,
    Registration, RegistrationState, TableCount, TableDetail, TableStatus, TableSummary, User,
};
use crate::registration::RegistrationStore;
use crate::settings::{self, ModuleSettings};

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

/// Escapes LIKE wildcards so `value` only matches itself.
fn like_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// First day of the month and first day of the following one.
pub fn month_bounds(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate), ServiceError> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| ServiceError::Validation(format!("{}-{} is not a valid month", year, month)))?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| ServiceError::Validation(format!("{}-{} is out of range", year, month)))?;

    Ok((first, next))
}

pub fn load_module_settings(conn: &mut PgConnection) -> Result<ModuleSettings, ServiceError> {
    use crate::schema::module_settings::dsl::{key, module, module_settings, value};

    let rows: Vec<(String, String)> = module_settings
        .filter(module.eq(settings::MODULE))
        .select((key, value))
        .load(conn)?;

    Ok(rows.into_iter().collect())
}

pub fn list_tables(
    conn: &mut PgConnection,
    filters: &models::TableFilters,
    now: NaiveDateTime,
) -> Result<Vec<TableSummary>, ServiceError> {
    use crate::schema::{game_masters, game_systems, game_tables};

    let mut query = game_tables::table
        .left_join(game_systems::table)
        .inner_join(game_masters::table)
        .select((GameTable::as_select(), game_systems::name.nullable(), game_masters::name))
        .into_boxed();

    let from = filters.from.map(start_of_day).unwrap_or(now);
    query = query.filter(game_tables::starts_at.ge(from));

    if let Some(to) = filters.to {
        query = query.filter(game_tables::starts_at.lt(start_of_day(to) + Duration::days(1)));
    }
    if let Some(status) = filters.status {
        query = query.filter(game_tables::status.eq(status));
    }
    if let Some(system_id) = filters.game_system {
        query = query.filter(game_tables::game_system_id.eq(system_id));
    }
    if let Some(campaign_id) = filters.campaign {
        query = query.filter(game_tables::campaign_id.eq(campaign_id));
    }
    if let Some(term) = filters.q.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        query = query.filter(game_tables::title.ilike(format!("%{}%", like_literal(term))));
    }
    if filters.available.unwrap_or(false) {
        query = query
            .filter(game_tables::status.eq(TableStatus::Open))
            .filter(game_tables::registered_count.lt(game_tables::capacity));
    }

    let (limit, offset) = filters.page_window();
    let rows: Vec<(GameTable, Option<String>, String)> = query
        .order((game_tables::starts_at.asc(), game_tables::id.asc()))
        .limit(limit)
        .offset(offset)
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(|(table, system, master)| TableSummary::new(table, system, master))
        .collect())
}

fn summaries(
    conn: &mut PgConnection,
    window: Option<(NaiveDateTime, NaiveDateTime)>,
    campaign: Option<i32>,
) -> Result<Vec<TableSummary>, ServiceError> {
    use crate::schema::{game_masters, game_systems, game_tables};

    let mut query = game_tables::table
        .left_join(game_systems::table)
        .inner_join(game_masters::table)
        .select((GameTable::as_select(), game_systems::name.nullable(), game_masters::name))
        .into_boxed();

    if let Some((start, end)) = window {
        query = query
            .filter(game_tables::starts_at.ge(start))
            .filter(game_tables::starts_at.lt(end));
    }
    if let Some(campaign_id) = campaign {
        query = query.filter(game_tables::campaign_id.eq(campaign_id));
    }

    let rows: Vec<(GameTable, Option<String>, String)> = query
        .order((game_tables::starts_at.asc(), game_tables::id.asc()))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(|(table, system, master)| TableSummary::new(table, system, master))
        .collect())
}

pub fn calendar(
    conn: &mut PgConnection,
    year: i32,
    month: u32,
) -> Result<BTreeMap<NaiveDate, Vec<TableSummary>>, ServiceError> {
    let (first, next) = month_bounds(year, month)?;
    let tables = summaries(conn, Some((start_of_day(first), start_of_day(next))), None)?;

    let mut days: BTreeMap<NaiveDate, Vec<TableSummary>> = BTreeMap::new();
    for table in tables {
        days.entry(table.starts_at.date()).or_default().push(table);
    }
    Ok(days)
}

pub fn current_month(now: NaiveDateTime) -> (i32, u32) {
    (now.year(), now.month())
}

pub fn table_detail(conn: &mut PgConnection, table_id: i32) -> Result<TableDetail, ServiceError> {
    use crate::schema::{campaigns, game_masters, game_systems, game_tables, publishers};

    let table = game_tables::table
        .find(table_id)
        .select(GameTable::as_select())
        .first(conn)
        .optional()?
        .ok_or(ServiceError::NotFound("game table"))?;

    let game_system = match table.game_system_id {
        Some(id) => game_systems::table
            .find(id)
            .select(GameSystem::as_select())
            .first(conn)
            .optional()?,
        None => None,
    };

    let publisher = match game_system.as_ref().and_then(|s| s.publisher_id) {
        Some(id) => publishers::table
            .find(id)
            .select(Publisher::as_select())
            .first(conn)
            .optional()?,
        None => None,
    };

    let game_master = game_masters::table
        .find(table.game_master_id)
        .select(GameMaster::as_select())
        .first(conn)?;

    let campaign = match table.campaign_id {
        Some(id) => campaigns::table
            .find(id)
            .select(campaigns::title)
            .first::<String>(conn)
            .optional()?,
        None => None,
    };

    let confirmed = conn.count_in_state(table.id, RegistrationState::Confirmed)?;
    let waiting = conn.count_in_state(table.id, RegistrationState::Waiting)?;

    Ok(TableDetail {
        table,
        game_system,
        publisher,
        game_master,
        campaign,
        confirmed,
        waiting,
    })
}

pub fn list_campaigns(
    conn: &mut PgConnection,
    filters: &models::CampaignFilters,
) -> Result<Vec<CampaignSummary>, ServiceError> {
    use crate::schema::{campaigns, game_tables};

    let mut query = campaigns::table.select(Campaign::as_select()).into_boxed();
    if let Some(status) = filters.status.as_deref() {
        query = query.filter(campaigns::status.eq(status.to_string()));
    }
    let found: Vec<Campaign> = query.order((campaigns::title.asc(), campaigns::id.asc())).load(conn)?;

    let counts: HashMap<i32, i64> = game_tables::table
        .filter(game_tables::campaign_id.is_not_null())
        .group_by(game_tables::campaign_id)
        .select((game_tables::campaign_id, diesel::dsl::count_star()))
        .load::<(Option<i32>, i64)>(conn)?
        .into_iter()
        .filter_map(|(id, count)| id.map(|id| (id, count)))
        .collect();

    Ok(found
        .into_iter()
        .map(|campaign| CampaignSummary {
            tables: counts.get(&campaign.id).copied().unwrap_or(0),
            campaign,
        })
        .collect())
}

pub fn campaign_detail(conn: &mut PgConnection, campaign_id: i32) -> Result<CampaignDetail, ServiceError> {
    use crate::schema::{campaigns, game_masters, game_systems};

    let campaign = campaigns::table
        .find(campaign_id)
        .select(Campaign::as_select())
        .first(conn)
        .optional()?
        .ok_or(ServiceError::NotFound("campaign"))?;

    let game_system = match campaign.game_system_id {
        Some(id) => game_systems::table
            .find(id)
            .select(GameSystem::as_select())
            .first(conn)
            .optional()?,
        None => None,
    };

    let game_master = match campaign.game_master_id {
        Some(id) => game_masters::table
            .find(id)
            .select(GameMaster::as_select())
            .first(conn)
            .optional()?,
        None => None,
    };

    let tables = summaries(conn, None, Some(campaign.id))?;

    Ok(CampaignDetail {
        campaign,
        game_system,
        game_master,
        tables,
    })
}

pub fn table_count(conn: &mut PgConnection, now: NaiveDateTime) -> Result<TableCount, ServiceError> {
    use crate::schema::game_tables::dsl::{capacity, game_tables, registered_count, starts_at, status};

    let upcoming: i64 = game_tables
        .filter(starts_at.ge(now))
        .filter(status.eq(TableStatus::Open).or(status.eq(TableStatus::Full)))
        .count()
        .get_result(conn)?;

    let open: i64 = game_tables
        .filter(starts_at.ge(now))
        .filter(status.eq(TableStatus::Open))
        .filter(registered_count.lt(capacity))
        .count()
        .get_result(conn)?;

    Ok(TableCount { upcoming, open })
}

impl RegistrationStore for PgConnection {
    fn find_table(&mut self, table_id: i32) -> Result<Option<GameTable>, ServiceError> {
        use crate::schema::game_tables::dsl::game_tables;

        Ok(game_tables
            .find(table_id)
            .select(GameTable::as_select())
            .first(self)
            .optional()?)
    }

    fn lock_table(&mut self, table_id: i32) -> Result<Option<GameTable>, ServiceError> {
        use crate::schema::game_tables::dsl::game_tables;

        Ok(game_tables
            .find(table_id)
            .select(GameTable::as_select())
            .for_update()
            .first(self)
            .optional()?)
    }

    fn find_user(&mut self, user_id: i32) -> Result<Option<User>, ServiceError> {
        use crate::schema::users::dsl::users;

        Ok(users.find(user_id).select(User::as_select()).first(self).optional()?)
    }

    fn find_game_master(&mut self, game_master_id: i32) -> Result<Option<GameMaster>, ServiceError> {
        use crate::schema::game_masters::dsl::game_masters;

        Ok(game_masters
            .find(game_master_id)
            .select(GameMaster::as_select())
            .first(self)
            .optional()?)
    }

    fn active_for_user(&mut self, table_id: i32, user_id: i32) -> Result<Option<Registration>, ServiceError> {
        use crate::schema::registrations;

        Ok(registrations::table
            .filter(registrations::game_table_id.eq(table_id))
            .filter(registrations::user_id.eq(user_id))
            .filter(registrations::state.ne(RegistrationState::Cancelled))
            .select(Registration::as_select())
            .first(self)
            .optional()?)
    }

    fn active_for_email(&mut self, table_id: i32, email: &str) -> Result<Option<Registration>, ServiceError> {
        use crate::schema::{registrations, users};

        // Guest emails are stored normalized; account emails are not.
        let as_guest = registrations::table
            .filter(registrations::game_table_id.eq(table_id))
            .filter(registrations::state.ne(RegistrationState::Cancelled))
            .filter(registrations::guest_email.eq(email))
            .select(Registration::as_select())
            .first(self)
            .optional()?;
        if as_guest.is_some() {
            return Ok(as_guest);
        }

        Ok(registrations::table
            .inner_join(users::table)
            .filter(registrations::game_table_id.eq(table_id))
            .filter(registrations::state.ne(RegistrationState::Cancelled))
            .filter(users::email.ilike(like_literal(email)))
            .select(Registration::as_select())
            .first(self)
            .optional()?)
    }

    fn find_by_token(&mut self, token: &str) -> Result<Option<Registration>, ServiceError> {
        use crate::schema::registrations;

        Ok(registrations::table
            .filter(registrations::cancellation_token.eq(token))
            .select(Registration::as_select())
            .first(self)
            .optional()?)
    }

    fn count_in_state(&mut self, table_id: i32, state: RegistrationState) -> Result<i64, ServiceError> {
        use crate::schema::registrations;

        Ok(registrations::table
            .filter(registrations::game_table_id.eq(table_id))
            .filter(registrations::state.eq(state))
            .count()
            .get_result(self)?)
    }

    fn oldest_waiting(&mut self, table_id: i32) -> Result<Option<Registration>, ServiceError> {
        use crate::schema::registrations;

        Ok(registrations::table
            .filter(registrations::game_table_id.eq(table_id))
            .filter(registrations::state.eq(RegistrationState::Waiting))
            .order((registrations::created_at.asc(), registrations::id.asc()))
            .select(Registration::as_select())
            .first(self)
            .optional()?)
    }

    fn waiting_position(&mut self, registration: &Registration) -> Result<i64, ServiceError> {
        use crate::schema::registrations;

        let ahead: i64 = registrations::table
            .filter(registrations::game_table_id.eq(registration.game_table_id))
            .filter(registrations::state.eq(RegistrationState::Waiting))
            .filter(
                registrations::created_at.lt(registration.created_at).or(registrations::created_at
                    .eq(registration.created_at)
                    .and(registrations::id.lt(registration.id))),
            )
            .count()
            .get_result(self)?;

        Ok(ahead + 1)
    }

    fn insert(&mut self, registration: models::NewRegistration) -> Result<Registration, ServiceError> {
        use crate::schema::registrations;

        let new_id: i32 = diesel::insert_into(registrations::table)
            .values(&registration)
            .returning(registrations::id)
            .get_result(self)?;

        Ok(registrations::table
            .find(new_id)
            .select(Registration::as_select())
            .first(self)?)
    }

    fn update_state(
        &mut self,
        registration_id: i32,
        state: RegistrationState,
        at: NaiveDateTime,
    ) -> Result<Registration, ServiceError> {
        use crate::schema::registrations;

        let target = registrations::table.find(registration_id);
        match state {
            RegistrationState::Confirmed => diesel::update(target)
                .set((registrations::state.eq(state), registrations::promoted_at.eq(Some(at))))
                .execute(self)?,
            RegistrationState::Cancelled => diesel::update(target)
                .set((registrations::state.eq(state), registrations::cancelled_at.eq(Some(at))))
                .execute(self)?,
            RegistrationState::Waiting => diesel::update(target)
                .set(registrations::state.eq(state))
                .execute(self)?,
        };

        Ok(registrations::table
            .find(registration_id)
            .select(Registration::as_select())
            .first(self)?)
    }

    fn update_occupancy(
        &mut self,
        table_id: i32,
        count: i32,
        table_status: TableStatus,
    ) -> Result<GameTable, ServiceError> {
        use crate::schema::game_tables::dsl::{game_tables, registered_count, status};

        diesel::update(game_tables.find(table_id))
            .set((registered_count.eq(count), status.eq(table_status)))
            .execute(self)?;

        Ok(game_tables
            .find(table_id)
            .select(GameTable::as_select())
            .first(self)?)
    }
}
