use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use diesel::result::{DatabaseErrorKind, Error as DBError};
use thiserror::Error;

use crate::models::{ApiResponse, RegistrationState};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("an active registration already exists for this game table")]
    DuplicateRegistration,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("this cancellation link has already been used or has expired")]
    TokenExpiredOrUsed,

    #[error("game table is not accepting changes: {0}")]
    TableClosed(&'static str),

    #[error("cannot move a registration from {from} to {to}")]
    InvalidTransition {
        from: RegistrationState,
        to: RegistrationState,
    },

    #[error("unauthorized")]
    Unauthorized,

    #[error("database error: {0}")]
    Database(#[from] DBError),

    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("blocking task failed: {0}")]
    Blocking(#[from] actix_web::error::BlockingError),
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::DuplicateRegistration => StatusCode::CONFLICT,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::TokenExpiredOrUsed => StatusCode::GONE,
            ServiceError::TableClosed(_) => StatusCode::CONFLICT,
            ServiceError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::Database(DBError::NotFound) => StatusCode::NOT_FOUND,
            ServiceError::Database(DBError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => StatusCode::CONFLICT,
            ServiceError::Database(_) | ServiceError::Pool(_) | ServiceError::Blocking(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = match self {
            ServiceError::Database(DBError::NotFound) => "Not found".to_string(),
            ServiceError::Database(DBError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                ServiceError::DuplicateRegistration.to_string()
            }
            ServiceError::Database(_) | ServiceError::Pool(_) | ServiceError::Blocking(_) => {
                log::error!("internal error: {}", self);
                "Internal Server Error, Please try later".to_string()
            }
            other => other.to_string(),
        };

        HttpResponse::build(status).json(ApiResponse { message })
    }
}
