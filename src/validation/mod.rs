//! Validation engine
//!
//! Rules are plain functions from a value to a [`ValidationResult`]. A
//! [`Validator`] runs every rule it holds and merges the failures, so callers
//! see every problem at once instead of the first one. Validation never
//! panics or returns `Err` for invalid input; failures are data.
//!
//! - `rules`: reusable field checks (length, pattern, range)
//! - `entity`: per-entity field validators
//! - `business`: cross-field consistency and state-transition tables
//! - `document`: aggregate checks (relationships, uniqueness, ceilings)
//! - `async_rules`: combinators for rules that need to await a lookup

pub mod async_rules;
pub mod business;
pub mod document;
pub mod entity;
pub mod rules;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use async_rules::{AsyncRule, MemoCache};
pub use business::TransitionTable;
pub use document::{validate_document, validate_migration_step};

/// Code attached to failures produced by the timeout combinator.
pub const VALIDATION_TIMEOUT: &str = "VALIDATION_TIMEOUT";
pub const DUPLICATE_NAME: &str = "DUPLICATE_NAME";
pub const DUPLICATE_ID: &str = "DUPLICATE_ID";
pub const MISSING_REFERENCE: &str = "MISSING_REFERENCE";
pub const CAPACITY_EXCEEDED: &str = "CAPACITY_EXCEEDED";
pub const INVALID_STATE_TRANSITION: &str = "INVALID_STATE_TRANSITION";
pub const MIGRATION_DATA_LOSS: &str = "MIGRATION_DATA_LOSS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Field,
    Business,
    Relationship,
    Database,
    Custom,
    Internal,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            ErrorType::Field => "field",
            ErrorType::Business => "business",
            ErrorType::Relationship => "relationship",
            ErrorType::Database => "database",
            ErrorType::Custom => "custom",
            ErrorType::Internal => "internal",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ValidationError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
            error_type,
            code: None,
        }
    }

    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorType::Field, message).on(field)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Business, message)
    }

    pub fn relationship(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorType::Relationship, message)
            .on(field)
            .with_code(MISSING_REFERENCE)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Internal, message)
    }

    pub fn on(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "[{}] {}: {}", self.error_type, field, self.message),
            None => write!(f, "[{}] {}", self.error_type, self.message),
        }
    }
}

#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Success,
    Failure(Vec<ValidationError>),
}

impl ValidationResult {
    pub fn from_errors(errors: Vec<ValidationError>) -> Self {
        if errors.is_empty() {
            ValidationResult::Success
        } else {
            ValidationResult::Failure(errors)
        }
    }

    pub fn fail(error: ValidationError) -> Self {
        ValidationResult::Failure(vec![error])
    }

    /// `Success` when `condition` holds, otherwise a single-error failure.
    pub fn check(condition: bool, error: impl FnOnce() -> ValidationError) -> Self {
        if condition {
            ValidationResult::Success
        } else {
            ValidationResult::fail(error())
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ValidationResult::Success)
    }

    pub fn errors(&self) -> &[ValidationError] {
        match self {
            ValidationResult::Success => &[],
            ValidationResult::Failure(errors) => errors,
        }
    }

    pub fn into_errors(self) -> Vec<ValidationError> {
        match self {
            ValidationResult::Success => Vec::new(),
            ValidationResult::Failure(errors) => errors,
        }
    }

    /// Merges two results; failures from both sides are kept.
    pub fn and(self, other: ValidationResult) -> ValidationResult {
        match (self, other) {
            (ValidationResult::Success, other) => other,
            (this, ValidationResult::Success) => this,
            (ValidationResult::Failure(mut left), ValidationResult::Failure(right)) => {
                left.extend(right);
                ValidationResult::Failure(left)
            }
        }
    }

    pub fn into_result(self) -> Result<(), Vec<ValidationError>> {
        match self {
            ValidationResult::Success => Ok(()),
            ValidationResult::Failure(errors) => Err(errors),
        }
    }
}

impl FromIterator<ValidationResult> for ValidationResult {
    fn from_iter<I: IntoIterator<Item = ValidationResult>>(iter: I) -> Self {
        iter.into_iter()
            .fold(ValidationResult::Success, ValidationResult::and)
    }
}

type RuleFn<T> = dyn Fn(&T) -> ValidationResult + Send + Sync;

/// A single pure check over `T`.
pub struct Rule<T: ?Sized> {
    check: Arc<RuleFn<T>>,
}

impl<T: ?Sized> Clone for Rule<T> {
    fn clone(&self) -> Self {
        Self {
            check: Arc::clone(&self.check),
        }
    }
}

impl<T: ?Sized + 'static> Rule<T> {
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&T) -> ValidationResult + Send + Sync + 'static,
    {
        Self {
            check: Arc::new(check),
        }
    }

    pub fn check(&self, value: &T) -> ValidationResult {
        (self.check)(value)
    }

    /// Only runs when `guard` holds; otherwise the rule is skipped.
    pub fn when<G>(self, guard: G) -> Self
    where
        G: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Rule::new(move |value: &T| {
            if guard(value) {
                self.check(value)
            } else {
                ValidationResult::Success
            }
        })
    }

    /// Both rules run; failures from both are collected.
    pub fn and(self, other: Rule<T>) -> Self {
        Rule::new(move |value: &T| self.check(value).and(other.check(value)))
    }
}

/// Accumulates rules with "and" semantics: every rule runs.
pub struct Validator<T: ?Sized> {
    rules: Vec<Rule<T>>,
}

impl<T: ?Sized> Clone for Validator<T> {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules.clone(),
        }
    }
}

impl<T: ?Sized + 'static> Default for Validator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + 'static> Validator<T> {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn rule<F>(mut self, check: F) -> Self
    where
        F: Fn(&T) -> ValidationResult + Send + Sync + 'static,
    {
        self.rules.push(Rule::new(check));
        self
    }

    pub fn rule_if<G, F>(mut self, guard: G, check: F) -> Self
    where
        G: Fn(&T) -> bool + Send + Sync + 'static,
        F: Fn(&T) -> ValidationResult + Send + Sync + 'static,
    {
        self.rules.push(Rule::new(check).when(guard));
        self
    }

    pub fn with(mut self, rule: Rule<T>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Folds in every rule of another validator over the same type.
    pub fn extend(mut self, other: Validator<T>) -> Self {
        self.rules.extend(other.rules);
        self
    }

    pub fn validate(&self, value: &T) -> ValidationResult {
        self.rules.iter().map(|rule| rule.check(value)).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn into_rule(self) -> Rule<T> {
        Rule::new(move |value: &T| self.validate(value))
    }
}
