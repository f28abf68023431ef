use actix_web::{delete, get, post, web, HttpResponse};
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;

use crate::actions;
use crate::auth::AuthenticatedUser;
use crate::config::NotificationDefaults;
use crate::errors::ServiceError;
use crate::models::{self, RegistrationState};
use crate::notifications::{self, Notifier};
use crate::registration::{self, RegistrationOutcome};
use crate::settings::SettingsReader;
use crate::validation;
use crate::DbPool;

type Response = Result<HttpResponse, ServiceError>;

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Module overrides are read on every write so admin changes apply immediately.
/// Runs after commit, so a failed read must not turn a stored write into an error.
fn settings_reader(conn: &mut PgConnection, base: NotificationDefaults) -> SettingsReader {
    SettingsReader::with_fallback(actions::load_module_settings(conn), base)
}

fn registration_response(outcome: &RegistrationOutcome) -> models::RegistrationResponse {
    let registration = &outcome.registrant.registration;
    models::RegistrationResponse {
        registration_id: registration.id,
        state: registration.state,
        message: match registration.state {
            RegistrationState::Confirmed => "Registration confirmed".to_string(),
            _ => "The table is full, you have been added to the waiting list".to_string(),
        },
        waiting_position: outcome.waiting_position,
        cancellation_token: registration.cancellation_token.clone(),
    }
}

#[get("/mesas")]
async fn list_tables(pool: web::Data<DbPool>, filters: web::Query<models::TableFilters>) -> Response {
    let tables = web::block(move || {
        let mut conn = pool.get()?;
        actions::list_tables(&mut conn, &filters, now())
    })
    .await??;

    Ok(HttpResponse::Ok().json(tables))
}

#[get("/mesas/calendario")]
async fn calendar(pool: web::Data<DbPool>, query: web::Query<models::CalendarQuery>) -> Response {
    let (current_year, current_month) = actions::current_month(now());
    let year = query.year.unwrap_or(current_year);
    let month = query.month.unwrap_or(current_month);

    let days = web::block(move || {
        let mut conn = pool.get()?;
        actions::calendar(&mut conn, year, month)
    })
    .await??;

    Ok(HttpResponse::Ok().json(days))
}

#[get("/mesas/{id:\\d+}")]
async fn table_detail(pool: web::Data<DbPool>, path: web::Path<i32>) -> Response {
    let table_id = path.into_inner();

    let detail = web::block(move || {
        let mut conn = pool.get()?;
        actions::table_detail(&mut conn, table_id)
    })
    .await??;

    Ok(HttpResponse::Ok().json(detail))
}

#[post("/mesas/{id:\\d+}/inscripcion-invitado")]
async fn register_guest(
    pool: web::Data<DbPool>,
    notifier: web::Data<Notifier>,
    defaults: web::Data<NotificationDefaults>,
    path: web::Path<i32>,
    form: web::Json<models::GuestRegistrationRequest>,
) -> Response {
    let table_id = path.into_inner();
    let guest = validation::guest_contact(&form)?;
    let base = defaults.get_ref().clone();

    let (outcome, settings) = web::block(move || {
        let mut pooled = pool.get()?;
        let conn: &mut PgConnection = &mut pooled;
        let outcome = conn.transaction(|conn| registration::register_guest(conn, table_id, guest, now()))?;
        let settings = settings_reader(conn, base);
        Ok::<_, ServiceError>((outcome, settings))
    })
    .await??;

    notifier.spawn(notifications::for_registration(&outcome, &settings));

    Ok(HttpResponse::Created().json(registration_response(&outcome)))
}

#[post("/mesas/{id:\\d+}/inscripcion")]
async fn register_user(
    pool: web::Data<DbPool>,
    notifier: web::Data<Notifier>,
    defaults: web::Data<NotificationDefaults>,
    user: AuthenticatedUser,
    path: web::Path<i32>,
) -> Response {
    let table_id = path.into_inner();
    let base = defaults.get_ref().clone();

    let (outcome, settings) = web::block(move || {
        let mut pooled = pool.get()?;
        let conn: &mut PgConnection = &mut pooled;
        let outcome = conn.transaction(|conn| registration::register_user(conn, table_id, user.0, now()))?;
        let settings = settings_reader(conn, base);
        Ok::<_, ServiceError>((outcome, settings))
    })
    .await??;

    notifier.spawn(notifications::for_registration(&outcome, &settings));

    Ok(HttpResponse::Created().json(registration_response(&outcome)))
}

#[delete("/mesas/{id:\\d+}/inscripcion")]
async fn cancel_registration(
    pool: web::Data<DbPool>,
    notifier: web::Data<Notifier>,
    defaults: web::Data<NotificationDefaults>,
    user: AuthenticatedUser,
    path: web::Path<i32>,
) -> Response {
    let table_id = path.into_inner();
    let base = defaults.get_ref().clone();

    let (outcome, settings) = web::block(move || {
        let mut pooled = pool.get()?;
        let conn: &mut PgConnection = &mut pooled;
        let outcome = conn.transaction(|conn| registration::cancel_for_user(conn, table_id, user.0, now()))?;
        let settings = settings_reader(conn, base);
        Ok::<_, ServiceError>((outcome, settings))
    })
    .await??;

    notifier.spawn(notifications::for_cancellation(&outcome, &settings));

    Ok(HttpResponse::Ok().json(models::ApiResponse {
        message: "Registration cancelled".to_string(),
    }))
}

#[get("/mesas/cancelar/{token}")]
async fn cancel_confirmation(pool: web::Data<DbPool>, path: web::Path<String>) -> Response {
    let token = path.into_inner();

    let (registration, table) = web::block(move || {
        let mut conn = pool.get()?;
        registration::cancellation_preview(&mut *conn, &token, now())
    })
    .await??;

    Ok(HttpResponse::Ok().json(models::CancellationPreview {
        registration_id: registration.id,
        state: registration.state,
        guest_name: registration.guest_name,
        table_id: table.id,
        table_title: table.title,
        starts_at: table.starts_at,
    }))
}

#[delete("/mesas/cancelar/{token}")]
async fn cancel_by_token(
    pool: web::Data<DbPool>,
    notifier: web::Data<Notifier>,
    defaults: web::Data<NotificationDefaults>,
    path: web::Path<String>,
) -> Response {
    let token = path.into_inner();
    let base = defaults.get_ref().clone();

    let (outcome, settings) = web::block(move || {
        let mut pooled = pool.get()?;
        let conn: &mut PgConnection = &mut pooled;
        let outcome = conn.transaction(|conn| registration::cancel_by_token(conn, &token, now()))?;
        let settings = settings_reader(conn, base);
        Ok::<_, ServiceError>((outcome, settings))
    })
    .await??;

    notifier.spawn(notifications::for_cancellation(&outcome, &settings));

    Ok(HttpResponse::Ok().json(models::ApiResponse {
        message: "Registration cancelled".to_string(),
    }))
}

#[get("/campanas")]
async fn list_campaigns(pool: web::Data<DbPool>, filters: web::Query<models::CampaignFilters>) -> Response {
    let campaigns = web::block(move || {
        let mut conn = pool.get()?;
        actions::list_campaigns(&mut conn, &filters)
    })
    .await??;

    Ok(HttpResponse::Ok().json(campaigns))
}

#[get("/campanas/{id:\\d+}")]
async fn campaign_detail(pool: web::Data<DbPool>, path: web::Path<i32>) -> Response {
    let campaign_id = path.into_inner();

    let detail = web::block(move || {
        let mut conn = pool.get()?;
        actions::campaign_detail(&mut conn, campaign_id)
    })
    .await??;

    Ok(HttpResponse::Ok().json(detail))
}

#[get("/api/mesas/count")]
async fn table_count(pool: web::Data<DbPool>) -> Response {
    let count = web::block(move || {
        let mut conn = pool.get()?;
        actions::table_count(&mut conn, now())
    })
    .await??;

    Ok(HttpResponse::Ok().json(count))
}

pub fn register(cfg: &mut web::ServiceConfig) {
    cfg.service(list_tables)
        .service(calendar)
        .service(cancel_confirmation)
        .service(cancel_by_token)
        .service(table_detail)
        .service(register_guest)
        .service(register_user)
        .service(cancel_registration)
        .service(list_campaigns)
        .service(campaign_detail)
        .service(table_count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::testing::{guest, now as fixed_now, table, MemoryStore};

    #[test]
    fn waiting_response_carries_position_and_token() {
        let mut store = MemoryStore::with_table(table(1, 1));
        registration::register_guest(&mut store, 1, guest("Ana"), fixed_now()).unwrap();
        let outcome = registration::register_guest(&mut store, 1, guest("Bea"), fixed_now()).unwrap();

        let response = registration_response(&outcome);

        assert_eq!(response.state, RegistrationState::Waiting);
        assert_eq!(response.waiting_position, Some(1));
        assert!(response.cancellation_token.is_some());
        assert!(response.message.contains("waiting list"));
    }

    #[test]
    fn user_response_omits_token() {
        let mut store = MemoryStore::with_table(table(1, 1));
        store.add_user(3, "Iker");
        let outcome = registration::register_user(&mut store, 1, 3, fixed_now()).unwrap();

        let json = serde_json::to_value(registration_response(&outcome)).unwrap();

        assert_eq!(json["state"], "confirmed");
        assert!(json.get("cancellation_token").is_none());
        assert_eq!(json["waiting_position"], serde_json::Value::Null);
    }
}
