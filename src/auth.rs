use std::future::{ready, Ready};

use actix_web::{dev::Payload, FromRequest, HttpRequest};

use crate::errors::ServiceError;

/// Header set by the gateway once it has authenticated the caller.
pub const USER_HEADER: &str = "X-User-Id";

/// Id of the authenticated platform user.
/// Rejects the request with 401 when the header is missing or malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub i32);

impl FromRequest for AuthenticatedUser {
    type Error = ServiceError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let user_id = req
            .headers()
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i32>().ok())
            .filter(|id| *id > 0);

        ready(user_id.map(AuthenticatedUser).ok_or(ServiceError::Unauthorized))
    }
}
