use regex::Regex;
use serde::Serialize;

use crate::{actions::ActionCatalog, domain::Role, errors::Error, Result};

/// Runs of the same character at or above this length count as spam.
const SPAM_RUN_LEN: usize = 11;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationReason {
    Valid,
    InvalidType,
    Empty,
    TooLong,
    SuspiciousContent,
    SpamDetected,
    InsufficientPermissions,
    MissingArguments,
}

impl ValidationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationReason::Valid => "valid",
            ValidationReason::InvalidType => "invalid_type",
            ValidationReason::Empty => "empty",
            ValidationReason::TooLong => "too_long",
            ValidationReason::SuspiciousContent => "suspicious_content",
            ValidationReason::SpamDetected => "spam_detected",
            ValidationReason::InsufficientPermissions => "insufficient_permissions",
            ValidationReason::MissingArguments => "missing_arguments",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub reason: ValidationReason,
    pub details: Option<String>,
}

impl Validation {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: ValidationReason::Valid,
            details: None,
        }
    }

    fn reject(reason: ValidationReason, details: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason,
            details: Some(details.into()),
        }
    }
}

/// Stateless message and command checks.
#[derive(Clone, Debug)]
pub struct Validator {
    max_message_len: usize,
    suspicious: Vec<Regex>,
    catalog: ActionCatalog,
}

impl Validator {
    pub fn new(max_message_len: usize, catalog: ActionCatalog) -> Result<Self> {
        let suspicious = [
            r"(?is)<script\b.*?</script\s*>",
            r"(?i)javascript:",
            r"(?i)\bon\w+\s*=",
            r"(?i)data:text/html",
        ]
        .iter()
        .map(|p| Regex::new(p).map_err(|e| Error::Config(format!("bad pattern {p}: {e}"))))
        .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            max_message_len,
            suspicious,
            catalog,
        })
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    /// `None` stands for a message without a text body.
    pub fn validate_message(&self, text: Option<&str>) -> Validation {
        let Some(text) = text else {
            return Validation::reject(ValidationReason::InvalidType, "message must be text");
        };

        let len = text.chars().count();
        if len > self.max_message_len {
            return Validation::reject(
                ValidationReason::TooLong,
                format!("{len} characters, maximum is {}", self.max_message_len),
            );
        }
        if len == 0 {
            return Validation::reject(ValidationReason::Empty, "message is empty");
        }

        if let Some(pat) = self.suspicious.iter().find(|re| re.is_match(text)) {
            return Validation::reject(
                ValidationReason::SuspiciousContent,
                format!("matched {}", pat.as_str()),
            );
        }

        if let Some(ch) = longest_run_at_least(text, SPAM_RUN_LEN) {
            return Validation::reject(
                ValidationReason::SpamDetected,
                format!("character {ch:?} repeated {SPAM_RUN_LEN}+ times"),
            );
        }

        Validation::ok()
    }

    pub fn validate_command(&self, action: &str, args: &[String], role: Role) -> Validation {
        let policy = self.catalog.get(action);

        if !policy.allows_role(role) {
            return Validation::reject(
                ValidationReason::InsufficientPermissions,
                format!("command {action} is not available to role {role}"),
            );
        }

        if policy.requires_args && args.iter().all(|a| a.trim().is_empty()) {
            return Validation::reject(
                ValidationReason::MissingArguments,
                format!("command {action} needs an argument"),
            );
        }

        Validation::ok()
    }
}

/// First character that repeats `min` times in a row. Line terminators never count.
fn longest_run_at_least(text: &str, min: usize) -> Option<char> {
    let mut prev: Option<char> = None;
    let mut run = 0usize;

    for ch in text.chars() {
        if matches!(ch, '\n' | '\r' | '\u{2028}' | '\u{2029}') {
            prev = None;
            run = 0;
            continue;
        }
        if prev == Some(ch) {
            run += 1;
        } else {
            prev = Some(ch);
            run = 1;
        }
        if run >= min {
            return Some(ch);
        }
    }
    None
}
