use serde::{Deserialize, Serialize};
use crate::schema::{campaigns, game_masters, game_systems, game_tables, publishers, registrations, users};
use chrono::{NaiveDate, NaiveDateTime};
use diesel::{deserialize::{self, FromSql}, pg::{Pg, PgValue}, serialize::{self, Output, ToSql}, sql_types::Text, Insertable, Queryable, Selectable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = crate::schema::sql_types::TableStatus)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    Open,
    Full,
    Cancelled,
    Completed,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Open => "OPEN",
            TableStatus::Full => "FULL",
            TableStatus::Cancelled => "CANCELLED",
            TableStatus::Completed => "COMPLETED",
        }
    }

    /// Status a table should carry for the given number of confirmed seats.
    /// Cancelled and completed tables keep their status.
    pub fn for_occupancy(self, confirmed: i32, capacity: i32) -> TableStatus {
        match self {
            TableStatus::Cancelled | TableStatus::Completed => self,
            _ if confirmed >= capacity => TableStatus::Full,
            _ => TableStatus::Open,
        }
    }
}

impl ToSql<crate::schema::sql_types::TableStatus, Pg> for TableStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<crate::schema::sql_types::TableStatus, Pg> for TableStatus {
    fn from_sql(bytes: PgValue) -> deserialize::Result<Self> {
        match <String as FromSql<Text, Pg>>::from_sql(bytes)?.as_str() {
            "OPEN" => Ok(TableStatus::Open),
            "FULL" => Ok(TableStatus::Full),
            "CANCELLED" => Ok(TableStatus::Cancelled),
            "COMPLETED" => Ok(TableStatus::Completed),
            s => Err(format!("Unrecognized table status: {}", s).into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = crate::schema::sql_types::RegistrationState)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    Confirmed,
    Waiting,
    Cancelled,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::Confirmed => "CONFIRMED",
            RegistrationState::Waiting => "WAITING",
            RegistrationState::Cancelled => "CANCELLED",
        }
    }

    /// Spelling used in JSON payloads and user-facing messages.
    pub fn label(&self) -> &'static str {
        match self {
            RegistrationState::Confirmed => "confirmed",
            RegistrationState::Waiting => "waiting",
            RegistrationState::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, RegistrationState::Cancelled)
    }

    /// Waiting entries are only confirmed through promotion; cancelled is terminal.
    pub fn can_transition_to(&self, next: RegistrationState) -> bool {
        matches!(
            (self, next),
            (RegistrationState::Waiting, RegistrationState::Confirmed)
                | (RegistrationState::Waiting, RegistrationState::Cancelled)
                | (RegistrationState::Confirmed, RegistrationState::Cancelled)
        )
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl ToSql<crate::schema::sql_types::RegistrationState, Pg> for RegistrationState {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<crate::schema::sql_types::RegistrationState, Pg> for RegistrationState {
    fn from_sql(bytes: PgValue) -> deserialize::Result<Self> {
        match <String as FromSql<Text, Pg>>::from_sql(bytes)?.as_str() {
            "CONFIRMED" => Ok(RegistrationState::Confirmed),
            "WAITING" => Ok(RegistrationState::Waiting),
            "CANCELLED" => Ok(RegistrationState::Cancelled),
            s => Err(format!("Unrecognized registration state: {}", s).into()),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct User {
    pub id: i32,
    pub name: String,
    pub email: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = publishers)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Publisher {
    pub id: i32,
    pub name: String,
    pub website: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = game_systems)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct GameSystem {
    pub id: i32,
    pub publisher_id: Option<i32>,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = game_masters)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct GameMaster {
    pub id: i32,
    pub user_id: Option<i32>,
    pub name: String,
    #[serde(skip_serializing)]
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub notify_on_registration: bool,
    #[serde(skip_serializing)]
    pub notify_on_cancellation: bool,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = campaigns)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Campaign {
    pub id: i32,
    pub title: String,
    pub description: Option<String>,
    pub game_system_id: Option<i32>,
    pub game_master_id: Option<i32>,
    pub status: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = game_tables)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct GameTable {
    pub id: i32,
    pub title: String,
    pub description: Option<String>,
    pub game_system_id: Option<i32>,
    pub campaign_id: Option<i32>,
    pub game_master_id: i32,
    pub starts_at: NaiveDateTime,
    pub duration_minutes: i32,
    pub location: Option<String>,
    pub capacity: i32,
    pub registered_count: i32,
    pub status: TableStatus,
    pub created_at: NaiveDateTime,
}

impl GameTable {
    pub fn seats_left(&self) -> i32 {
        (self.capacity - self.registered_count).max(0)
    }

    pub fn has_started(&self, now: NaiveDateTime) -> bool {
        self.starts_at <= now
    }
}

/// Contact details captured inline for registrations without an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestContact {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = registrations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Registration {
    pub id: i32,
    pub game_table_id: i32,
    pub user_id: Option<i32>,
    pub guest_name: Option<String>,
    pub guest_email: Option<String>,
    pub guest_phone: Option<String>,
    pub state: RegistrationState,
    pub cancellation_token: Option<String>,
    pub created_at: NaiveDateTime,
    pub promoted_at: Option<NaiveDateTime>,
    pub cancelled_at: Option<NaiveDateTime>,
}

impl Registration {
    pub fn guest(&self) -> Option<GuestContact> {
        match (&self.guest_name, &self.guest_email) {
            (Some(name), Some(email)) => Some(GuestContact {
                name: name.clone(),
                email: email.clone(),
                phone: self.guest_phone.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = registrations)]
pub struct NewRegistration {
    pub game_table_id: i32,
    pub user_id: Option<i32>,
    pub guest_name: Option<String>,
    pub guest_email: Option<String>,
    pub guest_phone: Option<String>,
    pub state: RegistrationState,
    pub cancellation_token: Option<String>,
    pub created_at: NaiveDateTime,
}

impl NewRegistration {
    pub fn for_guest(game_table_id: i32, guest: GuestContact, token: String, state: RegistrationState, now: NaiveDateTime) -> Self {
        Self {
            game_table_id,
            user_id: None,
            guest_name: Some(guest.name),
            guest_email: Some(guest.email),
            guest_phone: guest.phone,
            state,
            cancellation_token: Some(token),
            created_at: now,
        }
    }

    pub fn for_user(game_table_id: i32, user_id: i32, state: RegistrationState, now: NaiveDateTime) -> Self {
        Self {
            game_table_id,
            user_id: Some(user_id),
            guest_name: None,
            guest_email: None,
            guest_phone: None,
            state,
            cancellation_token: None,
            created_at: now,
        }
    }
}

/// Who should hear about a registration: the guest contact or the account holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub name: String,
    pub email: String,
}

// Request/Response models for API
#[derive(Debug, Deserialize, Clone)]
pub struct GuestRegistrationRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TableFilters {
    pub status: Option<TableStatus>,
    pub game_system: Option<i32>,
    pub campaign: Option<i32>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub q: Option<String>,
    pub available: Option<bool>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl TableFilters {
    pub const DEFAULT_PER_PAGE: i64 = 20;
    pub const MAX_PER_PAGE: i64 = 100;

    /// (limit, offset) for the requested page; pages are 1-based.
    pub fn page_window(&self) -> (i64, i64) {
        let per_page = self.per_page.unwrap_or(Self::DEFAULT_PER_PAGE).clamp(1, Self::MAX_PER_PAGE);
        let page = self.page.unwrap_or(1).max(1);
        (per_page, (page - 1).saturating_mul(per_page))
    }
}

#[derive(Debug, Deserialize)]
pub struct CalendarQuery {
    pub year: Option<i32>,
    pub month: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CampaignFilters {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TableSummary {
    pub id: i32,
    pub title: String,
    pub starts_at: NaiveDateTime,
    pub duration_minutes: i32,
    pub location: Option<String>,
    pub status: TableStatus,
    pub capacity: i32,
    pub seats_taken: i32,
    pub seats_left: i32,
    pub game_system: Option<String>,
    pub game_master: String,
    pub campaign_id: Option<i32>,
}

impl TableSummary {
    pub fn new(table: GameTable, game_system: Option<String>, game_master: String) -> Self {
        Self {
            seats_left: table.seats_left(),
            seats_taken: table.registered_count,
            id: table.id,
            title: table.title,
            starts_at: table.starts_at,
            duration_minutes: table.duration_minutes,
            location: table.location,
            status: table.status,
            capacity: table.capacity,
            game_system,
            game_master,
            campaign_id: table.campaign_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TableDetail {
    #[serde(flatten)]
    pub table: GameTable,
    pub game_system: Option<GameSystem>,
    pub publisher: Option<Publisher>,
    pub game_master: GameMaster,
    pub campaign: Option<String>,
    pub confirmed: i64,
    pub waiting: i64,
}

#[derive(Debug, Serialize)]
pub struct RegistrationResponse {
    pub registration_id: i32,
    pub state: RegistrationState,
    pub message: String,
    pub waiting_position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancellationPreview {
    pub registration_id: i32,
    pub state: RegistrationState,
    pub guest_name: Option<String>,
    pub table_id: i32,
    pub table_title: String,
    pub starts_at: NaiveDateTime,
}

#[derive(Debug, Serialize)]
pub struct CampaignSummary {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub tables: i64,
}

#[derive(Debug, Serialize)]
pub struct CampaignDetail {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub game_system: Option<GameSystem>,
    pub game_master: Option<GameMaster>,
    pub tables: Vec<TableSummary>,
}

#[derive(Debug, Serialize)]
pub struct TableCount {
    pub upcoming: i64,
    pub open: i64,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_terminal() {
        use RegistrationState::*;

        assert!(Waiting.can_transition_to(Confirmed));
        assert!(Waiting.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Cancelled));

        assert!(!Confirmed.can_transition_to(Waiting));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!Cancelled.can_transition_to(Waiting));
        assert!(!Cancelled.is_active());
    }

    #[test]
    fn occupancy_drives_open_and_full() {
        assert_eq!(TableStatus::Open.for_occupancy(4, 4), TableStatus::Full);
        assert_eq!(TableStatus::Full.for_occupancy(3, 4), TableStatus::Open);
        assert_eq!(TableStatus::Cancelled.for_occupancy(0, 4), TableStatus::Cancelled);
        assert_eq!(TableStatus::Completed.for_occupancy(4, 4), TableStatus::Completed);
    }

    #[test]
    fn display_matches_json_spelling() {
        for state in [RegistrationState::Confirmed, RegistrationState::Waiting, RegistrationState::Cancelled] {
            assert_eq!(serde_json::to_value(state).unwrap(), state.to_string());
        }
        assert_eq!(RegistrationState::Waiting.to_string(), "waiting");
        assert_eq!(RegistrationState::Waiting.as_str(), "WAITING");
    }
}
