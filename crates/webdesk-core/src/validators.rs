//! Input checks run before foreground record API calls.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

pub const USERNAME_MIN_LENGTH: usize = 3;
pub const USERNAME_MAX_LENGTH: usize = 32;
pub const PASSWORD_MIN_LENGTH: usize = 6;
pub const PASSWORD_MAX_LENGTH: usize = 128;
pub const FILENAME_MAX_LENGTH: usize = 255;
pub const APP_NAME_MAX_LENGTH: usize = 64;

const FILENAME_FORBIDDEN_CHARS: [char; 10] = ['/', '\\', '\0', ':', '*', '?', '"', '<', '>', '|'];
const RESERVED_DEVICE_NAMES: [&str; 4] = ["con", "prn", "aux", "nul"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: &'static str },
    #[error("{field} must be at least {min} characters")]
    TooShort { field: &'static str, min: usize },
    #[error("{field} must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("{field} can only contain letters, numbers, underscores, and hyphens")]
    InvalidCharacters { field: &'static str },
    #[error("Name cannot contain '{0}'")]
    ForbiddenChar(char),
    #[error("Name cannot contain '..'")]
    PathTraversal,
    #[error("'{0}' is a reserved name")]
    Reserved(String),
    #[error("Name cannot have leading or trailing whitespace")]
    SurroundingWhitespace,
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("static pattern compiles"))
}

fn check_length(
    field: &'static str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len == 0 {
        return Err(ValidationError::Required { field });
    }
    if len < min {
        return Err(ValidationError::TooShort { field, min });
    }
    if len > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    check_length("Username", username, USERNAME_MIN_LENGTH, USERNAME_MAX_LENGTH)?;
    if !identifier_pattern().is_match(username) {
        return Err(ValidationError::InvalidCharacters { field: "Username" });
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    check_length("Password", password, PASSWORD_MIN_LENGTH, PASSWORD_MAX_LENGTH)
}

pub fn validate_filename(name: &str) -> Result<(), ValidationError> {
    check_length("Name", name, 1, FILENAME_MAX_LENGTH)?;
    if let Some(ch) = FILENAME_FORBIDDEN_CHARS.iter().find(|ch| name.contains(**ch)) {
        return Err(ValidationError::ForbiddenChar(*ch));
    }
    if name.contains("..") {
        return Err(ValidationError::PathTraversal);
    }
    let base = name.split('.').next().unwrap_or_default().to_lowercase();
    if is_reserved(&base) || name == "." {
        return Err(ValidationError::Reserved(name.to_string()));
    }
    if name != name.trim() {
        return Err(ValidationError::SurroundingWhitespace);
    }
    Ok(())
}

fn is_reserved(base: &str) -> bool {
    if RESERVED_DEVICE_NAMES.contains(&base) {
        return true;
    }
    ["com", "lpt"].iter().any(|prefix| {
        base.strip_prefix(prefix)
            .map(|digit| matches!(digit, "1" | "2" | "3" | "4" | "5" | "6" | "7" | "8" | "9"))
            .unwrap_or(false)
    })
}

pub fn validate_app_name(app: &str) -> Result<(), ValidationError> {
    check_length("App name", app, 1, APP_NAME_MAX_LENGTH)?;
    if !identifier_pattern().is_match(app) {
        return Err(ValidationError::InvalidCharacters { field: "App name" });
    }
    Ok(())
}

/// Normalizes a path to an absolute form without `.`/`..` components.
pub fn sanitize_path(path: &str) -> String {
    let cleaned = path.replace('\0', "");
    let parts: Vec<&str> = cleaned
        .split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect();
    if parts.is_empty() {
        return "/".to_string();
    }
    format!("/{}", parts.join("/"))
}
