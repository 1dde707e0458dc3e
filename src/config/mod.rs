//! Broker configuration model, directory loading, and plan selection.
//!
//! One JSON document per broker. A config is **full** when its
//! `form_config.submission` block is present with a non-empty method and
//! endpoint — that predicate alone routes a broker to the deterministic
//! pipeline; anything else goes to the AI fallback. No other heuristic
//! participates in routing.

pub mod store;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::TokenRule;
use crate::error::{BrokerError, BrokerResult};

/// How a broker wants the state rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateFormat {
    /// Full state name, e.g. "California".
    #[default]
    Full,
    /// 2-letter code, e.g. "CA". Accepts the legacy `"code"` spelling.
    #[serde(alias = "code")]
    Abbreviation,
}

/// CAPTCHA details recorded for a broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptchaConfig {
    /// reCAPTCHA site key, if known ahead of time. When absent, the
    /// submitter tries to discover it from the captured page HTML.
    #[serde(default)]
    pub site_key: Option<String>,
}

/// Recorded submission protocol for the deterministic pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionSpec {
    /// HTTP method, e.g. "POST".
    #[serde(default)]
    pub method: String,
    /// Submission endpoint URL.
    #[serde(default)]
    pub endpoint: String,
    /// Whether the broker requires a JWT extracted from its page.
    #[serde(default)]
    pub requires_jwt: bool,
    /// Whether the broker gates submission behind a CAPTCHA.
    #[serde(default)]
    pub requires_captcha: bool,
    /// JSON payload template with `{key}` placeholders.
    #[serde(default)]
    pub payload_template: Value,
    /// Request headers, values may contain `{key}` placeholders.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl SubmissionSpec {
    /// Non-empty method and endpoint — the routing predicate.
    pub fn is_complete(&self) -> bool {
        !self.method.trim().is_empty() && !self.endpoint.trim().is_empty()
    }
}

/// Form-related configuration; presence alone does not make a config full.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormConfig {
    #[serde(default)]
    pub state_format: StateFormat,
    /// Broker-side field name → canonical user-data key.
    #[serde(default)]
    pub field_mappings: BTreeMap<String, String>,
    #[serde(default)]
    pub submission: Option<SubmissionSpec>,
    /// Ordered token-extraction rules; first match per token kind wins.
    /// Empty means the built-in default scan chain.
    #[serde(default)]
    pub token_rules: Vec<TokenRule>,
    #[serde(default)]
    pub captcha: Option<CaptchaConfig>,
}

/// Metadata attached to configs produced by promotion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedMeta {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub ai_generated: bool,
    pub note: String,
}

/// One broker's configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub name: String,
    /// Submission modality tag; currently only `web_form`.
    #[serde(rename = "type", default = "default_type")]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub email_domains: Vec<String>,
    #[serde(default)]
    pub form_config: Option<FormConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<GeneratedMeta>,
}

fn default_type() -> String {
    "web_form".to_string()
}

impl BrokerConfig {
    /// Full iff `form_config.submission` is present and complete.
    pub fn is_full(&self) -> bool {
        self.form_config
            .as_ref()
            .and_then(|fc| fc.submission.as_ref())
            .map(|s| s.is_complete())
            .unwrap_or(false)
    }
}

/// Everything the deterministic pipeline needs for one broker.
#[derive(Debug, Clone)]
pub struct DeterministicPlan {
    pub name: String,
    pub url: String,
    pub email_domains: Vec<String>,
    pub state_format: StateFormat,
    pub field_mappings: BTreeMap<String, String>,
    pub submission: SubmissionSpec,
    pub token_rules: Vec<TokenRule>,
    pub captcha: Option<CaptchaConfig>,
}

/// Everything the AI fallback pipeline needs for one broker.
#[derive(Debug, Clone)]
pub struct AiFallbackPlan {
    pub name: String,
    pub url: String,
    pub email_domains: Vec<String>,
    pub state_format: StateFormat,
}

/// Closed routing decision produced by the selector.
#[derive(Debug, Clone)]
pub enum SubmissionPlan {
    Deterministic(DeterministicPlan),
    AiFallback(AiFallbackPlan),
}

impl SubmissionPlan {
    pub fn broker_name(&self) -> &str {
        match self {
            SubmissionPlan::Deterministic(p) => &p.name,
            SubmissionPlan::AiFallback(p) => &p.name,
        }
    }
}

/// Route a broker config to its pipeline.
///
/// Missing `name` or `url` is a local config failure (the broker is skipped);
/// a minimal config is never skipped just for being minimal.
pub fn select(config: &BrokerConfig) -> BrokerResult<SubmissionPlan> {
    if config.name.trim().is_empty() {
        return Err(BrokerError::Config("missing 'name' field".into()));
    }
    if config.url.trim().is_empty() {
        return Err(BrokerError::Config(format!(
            "broker '{}' is missing 'url'",
            config.name
        )));
    }
    if let Err(e) = url::Url::parse(&config.url) {
        return Err(BrokerError::Config(format!(
            "broker '{}' has an invalid url '{}': {e}",
            config.name, config.url
        )));
    }

    if config.is_full() {
        let fc = config.form_config.clone().unwrap_or_default();
        let submission = fc.submission.clone().unwrap_or_default();
        Ok(SubmissionPlan::Deterministic(DeterministicPlan {
            name: config.name.clone(),
            url: config.url.clone(),
            email_domains: config.email_domains.clone(),
            state_format: fc.state_format,
            field_mappings: fc.field_mappings,
            submission,
            token_rules: fc.token_rules,
            captcha: fc.captcha,
        }))
    } else {
        let state_format = config
            .form_config
            .as_ref()
            .map(|fc| fc.state_format)
            .unwrap_or_default();
        Ok(SubmissionPlan::AiFallback(AiFallbackPlan {
            name: config.name.clone(),
            url: config.url.clone(),
            email_domains: config.email_domains.clone(),
            state_format,
        }))
    }
}

/// Load every broker config from a directory of `*.json` files.
///
/// Duplicate broker names and unreadable directories are process-fatal;
/// they abort before any broker is attempted.
pub fn load_dir(dir: &Path) -> Result<Vec<BrokerConfig>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read broker config directory {}", dir.display()))?;

    let mut configs: Vec<BrokerConfig> = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let config: BrokerConfig = serde_json::from_str(&raw)
            .with_context(|| format!("invalid broker config {}", path.display()))?;

        if !config.name.trim().is_empty() {
            if let Some(dup) = configs.iter().find(|c| c.name == config.name) {
                bail!(
                    "duplicate broker name '{}' in {} (already defined elsewhere)",
                    dup.name,
                    path.display()
                );
            }
        }
        configs.push(config);
    }
    configs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(configs)
}
