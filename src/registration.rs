//! Seat allocation rules for game tables.
//!
//! Every operation runs against a [`RegistrationStore`]. The Postgres store is
//! driven inside a single transaction with the game table row locked, so the
//! capacity check and the write that depends on it cannot interleave with
//! another request for the same table.

use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::{
    GameMaster, GameTable, GuestContact, NewRegistration, Recipient, Registration, RegistrationState,
    TableStatus, User,
};
use crate::validation::normalize_email;

pub trait RegistrationStore {
    fn find_table(&mut self, table_id: i32) -> Result<Option<GameTable>, ServiceError>;

    /// Like `find_table`, but holds the row until the surrounding transaction ends.
    fn lock_table(&mut self, table_id: i32) -> Result<Option<GameTable>, ServiceError>;

    fn find_user(&mut self, user_id: i32) -> Result<Option<User>, ServiceError>;

    fn find_game_master(&mut self, game_master_id: i32) -> Result<Option<GameMaster>, ServiceError>;

    fn active_for_user(&mut self, table_id: i32, user_id: i32) -> Result<Option<Registration>, ServiceError>;

    /// Active registration whose guest email, or whose account email, matches `email`.
    fn active_for_email(&mut self, table_id: i32, email: &str) -> Result<Option<Registration>, ServiceError>;

    fn find_by_token(&mut self, token: &str) -> Result<Option<Registration>, ServiceError>;

    fn count_in_state(&mut self, table_id: i32, state: RegistrationState) -> Result<i64, ServiceError>;

    /// Earliest waiting registration, by creation time then id.
    fn oldest_waiting(&mut self, table_id: i32) -> Result<Option<Registration>, ServiceError>;

    /// 1-based position of a waiting registration in its table's queue.
    fn waiting_position(&mut self, registration: &Registration) -> Result<i64, ServiceError>;

    fn insert(&mut self, registration: NewRegistration) -> Result<Registration, ServiceError>;

    /// Stores the new state, stamping `promoted_at` or `cancelled_at` with `at`.
    fn update_state(
        &mut self,
        registration_id: i32,
        state: RegistrationState,
        at: NaiveDateTime,
    ) -> Result<Registration, ServiceError>;

    fn update_occupancy(
        &mut self,
        table_id: i32,
        registered_count: i32,
        status: TableStatus,
    ) -> Result<GameTable, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub registration: Registration,
    pub recipient: Option<Recipient>,
}

#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    pub table: GameTable,
    pub game_master: Option<GameMaster>,
    pub registrant: Participant,
    pub waiting_position: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CancellationOutcome {
    pub table: GameTable,
    pub game_master: Option<GameMaster>,
    pub cancelled: Participant,
    pub promoted: Vec<Participant>,
}

pub fn register_guest<S: RegistrationStore + ?Sized>(
    store: &mut S,
    table_id: i32,
    guest: GuestContact,
    now: NaiveDateTime,
) -> Result<RegistrationOutcome, ServiceError> {
    let table = store.lock_table(table_id)?.ok_or(ServiceError::NotFound("game table"))?;
    ensure_accepting(&table, now)?;

    let email = normalize_email(&guest.email);
    if store.active_for_email(table.id, &email)?.is_some() {
        return Err(ServiceError::DuplicateRegistration);
    }

    let token = Uuid::new_v4().simple().to_string();
    let guest = GuestContact { email, ..guest };
    place(store, table, |state| NewRegistration::for_guest(table_id, guest, token, state, now))
}

pub fn register_user<S: RegistrationStore + ?Sized>(
    store: &mut S,
    table_id: i32,
    user_id: i32,
    now: NaiveDateTime,
) -> Result<RegistrationOutcome, ServiceError> {
    let table = store.lock_table(table_id)?.ok_or(ServiceError::NotFound("game table"))?;
    ensure_accepting(&table, now)?;

    let user = store.find_user(user_id)?.ok_or(ServiceError::Unauthorized)?;
    if store.active_for_user(table.id, user.id)?.is_some()
        || store.active_for_email(table.id, &normalize_email(&user.email))?.is_some()
    {
        return Err(ServiceError::DuplicateRegistration);
    }

    place(store, table, |state| NewRegistration::for_user(table_id, user_id, state, now))
}

pub fn cancel_for_user<S: RegistrationStore + ?Sized>(
    store: &mut S,
    table_id: i32,
    user_id: i32,
    now: NaiveDateTime,
) -> Result<CancellationOutcome, ServiceError> {
    let table = store.lock_table(table_id)?.ok_or(ServiceError::NotFound("game table"))?;
    let registration = store
        .active_for_user(table.id, user_id)?
        .ok_or(ServiceError::NotFound("registration"))?;
    ensure_accepting(&table, now)?;

    cancel(store, table, registration, now)
}

pub fn cancel_by_token<S: RegistrationStore + ?Sized>(
    store: &mut S,
    token: &str,
    now: NaiveDateTime,
) -> Result<CancellationOutcome, ServiceError> {
    let table_id = store
        .find_by_token(token)?
        .ok_or(ServiceError::NotFound("registration"))?
        .game_table_id;
    let table = store.lock_table(table_id)?.ok_or(ServiceError::NotFound("game table"))?;

    // Re-read under the table lock; a concurrent request may have used the token.
    let registration = store.find_by_token(token)?.ok_or(ServiceError::NotFound("registration"))?;
    ensure_token_usable(&table, &registration, now)?;

    cancel(store, table, registration, now)
}

/// Read-only lookup behind the public cancellation page.
pub fn cancellation_preview<S: RegistrationStore + ?Sized>(
    store: &mut S,
    token: &str,
    now: NaiveDateTime,
) -> Result<(Registration, GameTable), ServiceError> {
    let registration = store.find_by_token(token)?.ok_or(ServiceError::NotFound("registration"))?;
    let table = store
        .find_table(registration.game_table_id)?
        .ok_or(ServiceError::NotFound("game table"))?;
    ensure_token_usable(&table, &registration, now)?;

    Ok((registration, table))
}

fn ensure_accepting(table: &GameTable, now: NaiveDateTime) -> Result<(), ServiceError> {
    match table.status {
        TableStatus::Cancelled => Err(ServiceError::TableClosed("the session was cancelled")),
        TableStatus::Completed => Err(ServiceError::TableClosed("the session is over")),
        _ if table.has_started(now) => Err(ServiceError::TableClosed("the session has already started")),
        _ => Ok(()),
    }
}

fn ensure_token_usable(table: &GameTable, registration: &Registration, now: NaiveDateTime) -> Result<(), ServiceError> {
    if !registration.state.is_active() || ensure_accepting(table, now).is_err() {
        return Err(ServiceError::TokenExpiredOrUsed);
    }
    Ok(())
}

/// Inserts a registration as confirmed when a seat is free and nobody is
/// queued ahead, otherwise at the back of the waiting list.
fn place<S, F>(store: &mut S, table: GameTable, build: F) -> Result<RegistrationOutcome, ServiceError>
where
    S: RegistrationStore + ?Sized,
    F: FnOnce(RegistrationState) -> NewRegistration,
{
    let confirmed = store.count_in_state(table.id, RegistrationState::Confirmed)?;
    let waiting = store.count_in_state(table.id, RegistrationState::Waiting)?;

    let state = if confirmed < i64::from(table.capacity) && waiting == 0 {
        RegistrationState::Confirmed
    } else {
        RegistrationState::Waiting
    };

    let registration = store.insert(build(state))?;
    let confirmed = match state {
        RegistrationState::Confirmed => confirmed + 1,
        _ => confirmed,
    };
    let table = sync_occupancy(store, &table, confirmed)?;

    let waiting_position = match registration.state {
        RegistrationState::Waiting => Some(store.waiting_position(&registration)?),
        _ => None,
    };
    log::info!(
        "registration {} on table {} is {} ({}/{} seats)",
        registration.id,
        table.id,
        registration.state,
        table.registered_count,
        table.capacity
    );

    let game_master = store.find_game_master(table.game_master_id)?;
    let registrant = participant(store, registration)?;

    Ok(RegistrationOutcome {
        table,
        game_master,
        registrant,
        waiting_position,
    })
}

fn cancel<S: RegistrationStore + ?Sized>(
    store: &mut S,
    table: GameTable,
    registration: Registration,
    now: NaiveDateTime,
) -> Result<CancellationOutcome, ServiceError> {
    let was_confirmed = registration.state == RegistrationState::Confirmed;
    let cancelled = transition(store, &registration, RegistrationState::Cancelled, now)?;

    let mut promoted = Vec::new();
    let mut confirmed = store.count_in_state(table.id, RegistrationState::Confirmed)?;
    if was_confirmed {
        while confirmed < i64::from(table.capacity) {
            let Some(next) = store.oldest_waiting(table.id)? else {
                break;
            };
            let next = transition(store, &next, RegistrationState::Confirmed, now)?;
            log::info!("registration {} promoted from the waiting list of table {}", next.id, table.id);
            promoted.push(next);
            confirmed += 1;
        }
    }

    let table = sync_occupancy(store, &table, confirmed)?;
    log::info!(
        "registration {} on table {} cancelled ({}/{} seats)",
        cancelled.id,
        table.id,
        table.registered_count,
        table.capacity
    );

    let game_master = store.find_game_master(table.game_master_id)?;
    let cancelled = participant(store, cancelled)?;
    let promoted = promoted
        .into_iter()
        .map(|registration| participant(store, registration))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CancellationOutcome {
        table,
        game_master,
        cancelled,
        promoted,
    })
}

fn transition<S: RegistrationStore + ?Sized>(
    store: &mut S,
    registration: &Registration,
    to: RegistrationState,
    now: NaiveDateTime,
) -> Result<Registration, ServiceError> {
    if !registration.state.can_transition_to(to) {
        return Err(ServiceError::InvalidTransition {
            from: registration.state,
            to,
        });
    }
    store.update_state(registration.id, to, now)
}

fn sync_occupancy<S: RegistrationStore + ?Sized>(
    store: &mut S,
    table: &GameTable,
    confirmed: i64,
) -> Result<GameTable, ServiceError> {
    let confirmed = i32::try_from(confirmed).unwrap_or(i32::MAX);
    let status = table.status.for_occupancy(confirmed, table.capacity);
    store.update_occupancy(table.id, confirmed, status)
}

fn participant<S: RegistrationStore + ?Sized>(
    store: &mut S,
    registration: Registration,
) -> Result<Participant, ServiceError> {
    let recipient = match (registration.guest(), registration.user_id) {
        (Some(guest), _) => Some(Recipient {
            name: guest.name,
            email: guest.email,
        }),
        (None, Some(user_id)) => store.find_user(user_id)?.map(|user| Recipient {
            name: user.name,
            email: user.email,
        }),
        (None, None) => None,
    };

    Ok(Participant {
        registration,
        recipient,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Condvar, Mutex};
    use std::thread;

    use chrono::{Duration, NaiveDate, NaiveDateTime};

    use super::*;

    pub fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 18)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap()
    }

    pub fn table(id: i32, capacity: i32) -> GameTable {
        GameTable {
            id,
            title: format!("Mesa {}", id),
            description: None,
            game_system_id: None,
            campaign_id: None,
            game_master_id: 1,
            starts_at: now() + Duration::days(3),
            duration_minutes: 240,
            location: Some("Local del club".to_string()),
            capacity,
            registered_count: 0,
            status: TableStatus::Open,
            created_at: now() - Duration::days(10),
        }
    }

    pub fn guest(name: &str) -> GuestContact {
        GuestContact {
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            phone: None,
        }
    }

    /// In-memory stand-in for the Postgres store.
    #[derive(Debug, Default)]
    pub struct MemoryStore {
        pub tables: HashMap<i32, GameTable>,
        pub users: HashMap<i32, User>,
        pub game_masters: HashMap<i32, GameMaster>,
        pub registrations: Vec<Registration>,
    }

    impl MemoryStore {
        pub fn with_table(table: GameTable) -> Self {
            let mut store = MemoryStore::default();
            store.game_masters.insert(
                1,
                GameMaster {
                    id: 1,
                    user_id: None,
                    name: "Marta".to_string(),
                    email: Some("marta@example.com".to_string()),
                    notify_on_registration: true,
                    notify_on_cancellation: false,
                },
            );
            store.tables.insert(table.id, table);
            store
        }

        pub fn add_user(&mut self, id: i32, name: &str) {
            self.users.insert(
                id,
                User {
                    id,
                    name: name.to_string(),
                    email: format!("{}@example.com", name.to_lowercase()),
                    created_at: now(),
                },
            );
        }

        pub fn states(&self, table_id: i32) -> Vec<(i32, RegistrationState)> {
            self.registrations
                .iter()
                .filter(|r| r.game_table_id == table_id)
                .map(|r| (r.id, r.state))
                .collect()
        }

        pub fn count(&self, table_id: i32, state: RegistrationState) -> usize {
            self.registrations
                .iter()
                .filter(|r| r.game_table_id == table_id && r.state == state)
                .count()
        }

        fn email_of(&self, registration: &Registration) -> Option<String> {
            registration
                .guest_email
                .clone()
                .or_else(|| registration.user_id.and_then(|id| self.users.get(&id)).map(|u| u.email.clone()))
                .map(|e| e.to_lowercase())
        }
    }

    impl RegistrationStore for MemoryStore {
        fn find_table(&mut self, table_id: i32) -> Result<Option<GameTable>, ServiceError> {
            Ok(self.tables.get(&table_id).cloned())
        }

        fn lock_table(&mut self, table_id: i32) -> Result<Option<GameTable>, ServiceError> {
            self.find_table(table_id)
        }

        fn find_user(&mut self, user_id: i32) -> Result<Option<User>, ServiceError> {
            Ok(self.users.get(&user_id).cloned())
        }

        fn find_game_master(&mut self, game_master_id: i32) -> Result<Option<GameMaster>, ServiceError> {
            Ok(self.game_masters.get(&game_master_id).cloned())
        }

        fn active_for_user(&mut self, table_id: i32, user_id: i32) -> Result<Option<Registration>, ServiceError> {
            Ok(self
                .registrations
                .iter()
                .find(|r| r.game_table_id == table_id && r.user_id == Some(user_id) && r.state.is_active())
                .cloned())
        }

        fn active_for_email(&mut self, table_id: i32, email: &str) -> Result<Option<Registration>, ServiceError> {
            Ok(self
                .registrations
                .iter()
                .find(|r| {
                    r.game_table_id == table_id
                        && r.state.is_active()
                        && self.email_of(r).as_deref() == Some(email)
                })
                .cloned())
        }

        fn find_by_token(&mut self, token: &str) -> Result<Option<Registration>, ServiceError> {
            Ok(self
                .registrations
                .iter()
                .find(|r| r.cancellation_token.as_deref() == Some(token))
                .cloned())
        }

        fn count_in_state(&mut self, table_id: i32, state: RegistrationState) -> Result<i64, ServiceError> {
            Ok(self.count(table_id, state) as i64)
        }

        fn oldest_waiting(&mut self, table_id: i32) -> Result<Option<Registration>, ServiceError> {
            Ok(self
                .registrations
                .iter()
                .filter(|r| r.game_table_id == table_id && r.state == RegistrationState::Waiting)
                .min_by_key(|r| (r.created_at, r.id))
                .cloned())
        }

        fn waiting_position(&mut self, registration: &Registration) -> Result<i64, ServiceError> {
            let ahead = self
                .registrations
                .iter()
                .filter(|r| {
                    r.game_table_id == registration.game_table_id
                        && r.state == RegistrationState::Waiting
                        && (r.created_at, r.id) < (registration.created_at, registration.id)
                })
                .count();
            Ok(ahead as i64 + 1)
        }

        fn insert(&mut self, new: NewRegistration) -> Result<Registration, ServiceError> {
            let registration = Registration {
                id: self.registrations.len() as i32 + 1,
                game_table_id: new.game_table_id,
                user_id: new.user_id,
                guest_name: new.guest_name,
                guest_email: new.guest_email,
                guest_phone: new.guest_phone,
                state: new.state,
                cancellation_token: new.cancellation_token,
                created_at: new.created_at,
                promoted_at: None,
                cancelled_at: None,
            };
            self.registrations.push(registration.clone());
            Ok(registration)
        }

        fn update_state(
            &mut self,
            registration_id: i32,
            state: RegistrationState,
            at: NaiveDateTime,
        ) -> Result<Registration, ServiceError> {
            let registration = self
                .registrations
                .iter_mut()
                .find(|r| r.id == registration_id)
                .ok_or(ServiceError::NotFound("registration"))?;
            registration.state = state;
            match state {
                RegistrationState::Confirmed => registration.promoted_at = Some(at),
                RegistrationState::Cancelled => registration.cancelled_at = Some(at),
                RegistrationState::Waiting => {}
            }
            Ok(registration.clone())
        }

        fn update_occupancy(
            &mut self,
            table_id: i32,
            registered_count: i32,
            status: TableStatus,
        ) -> Result<GameTable, ServiceError> {
            let table = self.tables.get_mut(&table_id).ok_or(ServiceError::NotFound("game table"))?;
            table.registered_count = registered_count;
            table.status = status;
            Ok(table.clone())
        }
    }

    /// Table locks held until the owning [`Session`] ends, like row locks held
    /// until commit.
    #[derive(Debug, Default)]
    pub struct TableLocks {
        held: Mutex<HashSet<i32>>,
        released: Condvar,
    }

    /// One transaction against a shared [`MemoryStore`]. Each call takes the
    /// store only briefly, so calls from different sessions interleave unless
    /// a table lock keeps them apart.
    pub struct Session<'a> {
        store: &'a Mutex<MemoryStore>,
        locks: &'a TableLocks,
        held: Vec<i32>,
    }

    impl<'a> Session<'a> {
        pub fn begin(store: &'a Mutex<MemoryStore>, locks: &'a TableLocks) -> Self {
            Session {
                store,
                locks,
                held: Vec::new(),
            }
        }

        fn with_store<T>(&self, f: impl FnOnce(&mut MemoryStore) -> T) -> T {
            let mut store = self.store.lock().unwrap();
            f(&mut store)
        }

        /// Reads that decide a later write leave a gap for other sessions.
        fn read_then_yield<T>(&self, f: impl FnOnce(&mut MemoryStore) -> T) -> T {
            let value = self.with_store(f);
            thread::sleep(std::time::Duration::from_millis(2));
            value
        }
    }

    impl Drop for Session<'_> {
        fn drop(&mut self) {
            if self.held.is_empty() {
                return;
            }
            let mut held = self.locks.held.lock().unwrap();
            for table_id in self.held.drain(..) {
                held.remove(&table_id);
            }
            self.locks.released.notify_all();
        }
    }

    impl RegistrationStore for Session<'_> {
        fn find_table(&mut self, table_id: i32) -> Result<Option<GameTable>, ServiceError> {
            self.with_store(|store| store.find_table(table_id))
        }

        fn lock_table(&mut self, table_id: i32) -> Result<Option<GameTable>, ServiceError> {
            if !self.held.contains(&table_id) {
                let mut held = self.locks.held.lock().unwrap();
                while held.contains(&table_id) {
                    held = self.locks.released.wait(held).unwrap();
                }
                held.insert(table_id);
                self.held.push(table_id);
            }
            self.with_store(|store| store.lock_table(table_id))
        }

        fn find_user(&mut self, user_id: i32) -> Result<Option<User>, ServiceError> {
            self.with_store(|store| store.find_user(user_id))
        }

        fn find_game_master(&mut self, game_master_id: i32) -> Result<Option<GameMaster>, ServiceError> {
            self.with_store(|store| store.find_game_master(game_master_id))
        }

        fn active_for_user(&mut self, table_id: i32, user_id: i32) -> Result<Option<Registration>, ServiceError> {
            self.read_then_yield(|store| store.active_for_user(table_id, user_id))
        }

        fn active_for_email(&mut self, table_id: i32, email: &str) -> Result<Option<Registration>, ServiceError> {
            self.read_then_yield(|store| store.active_for_email(table_id, email))
        }

        fn find_by_token(&mut self, token: &str) -> Result<Option<Registration>, ServiceError> {
            self.read_then_yield(|store| store.find_by_token(token))
        }

        fn count_in_state(&mut self, table_id: i32, state: RegistrationState) -> Result<i64, ServiceError> {
            self.read_then_yield(|store| store.count_in_state(table_id, state))
        }

        fn oldest_waiting(&mut self, table_id: i32) -> Result<Option<Registration>, ServiceError> {
            self.read_then_yield(|store| store.oldest_waiting(table_id))
        }

        fn waiting_position(&mut self, registration: &Registration) -> Result<i64, ServiceError> {
            self.with_store(|store| store.waiting_position(registration))
        }

        fn insert(&mut self, registration: NewRegistration) -> Result<Registration, ServiceError> {
            self.with_store(|store| store.insert(registration))
        }

        fn update_state(
            &mut self,
            registration_id: i32,
            state: RegistrationState,
            at: NaiveDateTime,
        ) -> Result<Registration, ServiceError> {
            self.with_store(|store| store.update_state(registration_id, state, at))
        }

        fn update_occupancy(
            &mut self,
            table_id: i32,
            registered_count: i32,
            status: TableStatus,
        ) -> Result<GameTable, ServiceError> {
            self.with_store(|store| store.update_occupancy(table_id, registered_count, status))
        }
    }
}
