use once_cell::sync::Lazy;
use regex::Regex;

use super::{ValidationError, ValidationResult};

pub const MAX_NAME_LEN: usize = 64;
pub const MAX_ID_LEN: usize = 64;
pub const MAX_HOST_LEN: usize = 253;
pub const MAX_PATH_LEN: usize = 1024;
pub const MAX_MESSAGE_LEN: usize = 100_000;
pub const MAX_PUBLIC_KEY_LEN: usize = 16_384;

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\p{L}\p{N}][\p{L}\p{N} ._@()-]*$").expect("valid name regex"));

static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("valid id regex"));

static HOSTNAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*$")
        .expect("valid hostname regex")
});

static IPV6_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Fa-f:.]+$").expect("valid ipv6 regex"));

static USERNAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]{0,31}$").expect("valid username regex"));

pub fn not_blank(field: &str, value: &str) -> ValidationResult {
    ValidationResult::check(!value.trim().is_empty(), || {
        ValidationError::field(field, format!("{field} must not be blank"))
    })
}

/// Length in characters, inclusive on both ends.
pub fn length(field: &str, value: &str, min: usize, max: usize) -> ValidationResult {
    let len = value.chars().count();
    ValidationResult::check(len >= min && len <= max, || {
        ValidationError::field(
            field,
            format!("{field} must be between {min} and {max} characters (got {len})"),
        )
    })
}

pub fn matches(field: &str, value: &str, pattern: &Regex, description: &str) -> ValidationResult {
    ValidationResult::check(pattern.is_match(value), || {
        ValidationError::field(field, format!("{field} must be {description}"))
    })
}

pub fn range<N>(field: &str, value: N, min: N, max: N) -> ValidationResult
where
    N: PartialOrd + std::fmt::Display + Copy,
{
    ValidationResult::check(value >= min && value <= max, || {
        ValidationError::field(
            field,
            format!("{field} must be between {min} and {max} (got {value})"),
        )
    })
}

pub fn entity_id(field: &str, value: &str) -> ValidationResult {
    if value.is_empty() {
        return ValidationResult::fail(ValidationError::field(field, format!("{field} is required")));
    }
    length(field, value, 1, MAX_ID_LEN).and(matches(
        field,
        value,
        &ID_PATTERN,
        "alphanumeric with '-', '_' or '.'",
    ))
}

pub fn display_name(field: &str, value: &str) -> ValidationResult {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return not_blank(field, value);
    }
    let edges = ValidationResult::check(trimmed.len() == value.len(), || {
        ValidationError::field(field, format!("{field} must not start or end with whitespace"))
    });
    length(field, value, 1, MAX_NAME_LEN)
        .and(matches(
            field,
            value,
            &NAME_PATTERN,
            "letters, digits, spaces and ._@()-",
        ))
        .and(edges)
}

pub fn hostname(field: &str, value: &str) -> ValidationResult {
    if value.is_empty() {
        return ValidationResult::fail(ValidationError::field(field, format!("{field} is required")));
    }
    let well_formed = HOSTNAME_PATTERN.is_match(value)
        || (value.contains(':') && IPV6_PATTERN.is_match(value));
    length(field, value, 1, MAX_HOST_LEN).and(ValidationResult::check(well_formed, || {
        ValidationError::field(field, format!("{field} must be a hostname or IP address"))
    }))
}

pub fn username(field: &str, value: &str) -> ValidationResult {
    matches(
        field,
        value,
        &USERNAME_PATTERN,
        "a POSIX user name (letters, digits, '_', '.', '-'; at most 32 characters)",
    )
}

pub fn remote_path(field: &str, value: &str) -> ValidationResult {
    if value.is_empty() {
        return ValidationResult::fail(ValidationError::field(field, format!("{field} is required")));
    }
    let absolute = value.starts_with('/') || value == "~" || value.starts_with("~/");
    length(field, value, 1, MAX_PATH_LEN)
        .and(ValidationResult::check(absolute, || {
            ValidationError::field(field, format!("{field} must be absolute or start with ~/"))
        }))
        .and(ValidationResult::check(!value.contains('\0'), || {
            ValidationError::field(field, format!("{field} cannot contain null bytes"))
        }))
}
