//! Broker-level error taxonomy.
//!
//! Every variant maps to exactly one failure mode of a single broker's
//! pipeline. Errors are caught at the pipeline boundary and folded into a
//! `SubmissionResult`; none of them abort the overall run. Process-level
//! fatals (unreadable config directory, duplicate broker names, absent
//! credentials) are reported as `anyhow::Error` before any broker runs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed or incomplete broker configuration. The broker is skipped,
    /// not failed — the run continues.
    #[error("broker config invalid: {0}")]
    Config(String),

    /// A `{key}` placeholder had no value. A payload cannot be partially
    /// rendered, so this fails the broker.
    #[error("template placeholder '{{{key}}}' has no value")]
    Template { key: String },

    /// State could not be resolved against the code/name table.
    #[error("unknown state '{state}': expected a 2-letter code or full name")]
    UnknownState { state: String },

    /// A required auth token was absent from the captured page artifacts.
    #[error("token extraction failed: {0}")]
    TokenExtraction(String),

    /// CAPTCHA challenge present but not solved (solver failure, timeout,
    /// or undiscoverable site key).
    #[error("captcha unsolved: {0}")]
    CaptchaUnsolved(String),

    /// The AI field-mapping proposal violated a guardrail after the bounded
    /// retry was exhausted.
    #[error("invalid field mapping: {0}")]
    InvalidMapping(String),

    /// Submission endpoint returned non-2xx, or the transport failed.
    #[error("submission failed: {detail}")]
    Submission { status: Option<u16>, detail: String },

    /// The manual-review checkpoint was declined; the form was never
    /// force-submitted.
    #[error("manual review declined for '{0}'")]
    ReviewDeclined(String),

    /// A collaborator call (browser, LLM, CAPTCHA, mailbox) timed out or
    /// failed at a stage boundary.
    #[error("collaborator failure during {stage}: {detail}")]
    Collaborator { stage: &'static str, detail: String },
}

impl BrokerError {
    /// Short machine-readable reason tag, used in run reports.
    pub fn reason(&self) -> &'static str {
        match self {
            BrokerError::Config(_) => "ConfigError",
            BrokerError::Template { .. } => "TemplateError",
            BrokerError::UnknownState { .. } => "UnknownStateError",
            BrokerError::TokenExtraction(_) => "TokenExtractionError",
            BrokerError::CaptchaUnsolved(_) => "CaptchaUnsolved",
            BrokerError::InvalidMapping(_) => "InvalidMappingError",
            BrokerError::Submission { .. } => "SubmissionError",
            BrokerError::ReviewDeclined(_) => "ReviewDeclined",
            BrokerError::Collaborator { .. } => "CollaboratorError",
        }
    }

    /// Whether this error should mark the broker `skipped` rather than
    /// `failed`. Only malformed configs qualify.
    pub fn is_skip(&self) -> bool {
        matches!(self, BrokerError::Config(_))
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_tags_are_stable() {
        let e = BrokerError::Template {
            key: "first_name".into(),
        };
        assert_eq!(e.reason(), "TemplateError");
        assert!(!e.is_skip());

        let e = BrokerError::Config("missing url".into());
        assert_eq!(e.reason(), "ConfigError");
        assert!(e.is_skip());
    }

    #[test]
    fn template_error_names_the_key() {
        let e = BrokerError::Template { key: "zip".into() };
        assert!(format!("{e}").contains("{zip}"));
    }
}
