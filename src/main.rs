#[macro_use]
extern crate diesel;

use std::sync::Arc;

use actix_web::{error, middleware, web, App, HttpResponse, HttpServer};
use diesel::{prelude::*, r2d2};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

mod actions;
mod auth;
mod config;
mod errors;
mod models;
mod notifications;
mod registration;
mod routes;
mod schema;
mod settings;
mod validation;

type DbPool = r2d2::Pool<r2d2::ConnectionManager<PgConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = config::Config::from_env().map_err(std::io::Error::other)?;
    let notification_defaults = config::NotificationDefaults::from_env().map_err(std::io::Error::other)?;

    // initialize DB pool outside of `HttpServer::new` so that it is shared across all workers
    let pool = initialize_db_pool(&config)?;
    if config.run_migrations {
        run_migrations(&pool)?;
    }

    let notifier = web::Data::new(initialize_notifier(&config).await);
    let notification_defaults = web::Data::new(notification_defaults);

    log::info!("starting HTTP server at http://{}:{}", config.api_host, config.api_port);

    HttpServer::new(move || {
        App::new()
            // add DB pool handle to app data; enables use of `web::Data<DbPool>` extractor
            .app_data(web::Data::new(pool.clone()))
            .app_data(notifier.clone())
            .app_data(notification_defaults.clone())
            .wrap(middleware::Logger::default())
            .app_data(web::JsonConfig::default().error_handler(|err, _req| {
                let detail = err.to_string();
                let response = match err {
                    error::JsonPayloadError::ContentType => {
                        HttpResponse::UnsupportedMediaType().json(models::ApiResponse { message: "Unsupported Media Type".to_string() })
                    }
                    error::JsonPayloadError::Deserialize(ref err) => {
                        HttpResponse::BadRequest().json(models::ApiResponse { message: err.to_string() })
                    }
                    _ => HttpResponse::BadRequest().json(models::ApiResponse { message: detail }),
                };
                error::InternalError::from_response(err, response).into()
            }))
            .app_data(web::QueryConfig::default().error_handler(|err, _req| {
                let response = HttpResponse::BadRequest().json(models::ApiResponse { message: err.to_string() });
                error::InternalError::from_response(err, response).into()
            }))
            .configure(routes::register)
    })
    .bind((config.api_host.as_str(), config.api_port))?
    .run()
    .await
}

fn initialize_db_pool(config: &config::Config) -> std::io::Result<DbPool> {
    let manager = r2d2::ConnectionManager::<PgConnection>::new(&config.database_url);
    r2d2::Pool::builder()
        .max_size(config.database_pool_size)
        .build(manager)
        .map_err(std::io::Error::other)
}

fn run_migrations(pool: &DbPool) -> std::io::Result<()> {
    let mut pooled = pool.get().map_err(std::io::Error::other)?;
    let conn: &mut PgConnection = &mut pooled;
    let applied = conn.run_pending_migrations(MIGRATIONS).map_err(std::io::Error::other)?;
    for migration in applied {
        log::info!("applied migration {}", migration);
    }
    Ok(())
}

async fn initialize_notifier(config: &config::Config) -> notifications::Notifier {
    let sink: Arc<dyn notifications::NotificationSink> = match config.amqp_host.as_deref() {
        Some(host) => match notifications::AmqpSink::connect(config, host).await {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                log::error!("RabbitMQ unavailable, notifications will only be logged: {:?}", e);
                Arc::new(notifications::LogSink)
            }
        },
        None => {
            log::warn!("AMQP_HOST not set, notifications will only be logged");
            Arc::new(notifications::LogSink)
        }
    };

    notifications::Notifier::new(sink)
}
