use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::ServiceError;
use crate::models::{GuestContact, GuestRegistrationRequest};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern"));
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9 ()\-]{6,20}$").expect("phone pattern"));

const MAX_NAME_LEN: usize = 255;
const MAX_EMAIL_LEN: usize = 255;

/// Lower-cased, trimmed email used for duplicate checks.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Checks the guest form and returns the normalized contact.
pub fn guest_contact(form: &GuestRegistrationRequest) -> Result<GuestContact, ServiceError> {
    let mut problems = Vec::new();

    let name = form.name.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        problems.push("name is required");
    } else if name.chars().count() > MAX_NAME_LEN {
        problems.push("name is too long");
    }

    let email = form.email.as_deref().map(normalize_email).unwrap_or_default();
    if email.is_empty() {
        problems.push("email is required");
    } else if email.len() > MAX_EMAIL_LEN || !EMAIL_RE.is_match(&email) {
        problems.push("email is not a valid address");
    }

    let phone = form
        .phone
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);
    if let Some(phone) = &phone {
        if !PHONE_RE.is_match(phone) {
            problems.push("phone is not a valid number");
        }
    }

    if !problems.is_empty() {
        return Err(ServiceError::Validation(problems.join(", ")));
    }

    Ok(GuestContact {
        name: name.to_string(),
        email,
        phone,
    })
}
