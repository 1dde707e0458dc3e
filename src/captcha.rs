//! CAPTCHA collaborator: challenge discovery and solving.
//!
//! Challenge discovery is pure over captured page artifacts (config-declared
//! site key first, then a `data-sitekey` scan of the HTML). Solving goes
//! through the anti-captcha HTTP API: create a recaptcha-v2 proxyless task,
//! then poll until it is ready or the deadline passes.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use crate::browser::PageArtifacts;
use crate::config::CaptchaConfig;

fn sitekey_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"data-sitekey\s*=\s*["']([^"']+)["']"#).unwrap())
}

/// A CAPTCHA challenge to be solved.
#[derive(Debug, Clone)]
pub struct CaptchaChallenge {
    /// URL of the page carrying the challenge.
    pub page_url: String,
    /// reCAPTCHA site key.
    pub site_key: String,
}

/// Discover a challenge from config + artifacts.
///
/// Returns `None` when the page shows no challenge indication. A broker whose
/// config says `requires_captcha` but whose site key cannot be discovered is
/// the caller's problem to fail — this function only reports what it sees.
pub fn detect_challenge(
    artifacts: &PageArtifacts,
    captcha: Option<&CaptchaConfig>,
) -> Option<CaptchaChallenge> {
    if let Some(key) = captcha.and_then(|c| c.site_key.as_deref()) {
        return Some(CaptchaChallenge {
            page_url: artifacts.url.clone(),
            site_key: key.to_string(),
        });
    }
    sitekey_re()
        .captures(&artifacts.html)
        .map(|caps| CaptchaChallenge {
            page_url: artifacts.url.clone(),
            site_key: caps[1].to_string(),
        })
}

/// A solver that turns a challenge into a response token, or fails.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self, challenge: &CaptchaChallenge) -> Result<String>;
}

/// anti-captcha.com backend (recaptcha v2 proxyless).
pub struct AntiCaptcha {
    client: reqwest::Client,
    api_key: String,
    poll_interval: Duration,
    deadline: Duration,
}

impl AntiCaptcha {
    pub fn from_env(deadline_ms: u64) -> Result<Self> {
        let api_key = std::env::var("ANTICAPTCHA_API_KEY")
            .context("ANTICAPTCHA_API_KEY is required for CAPTCHA-gated brokers")?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            poll_interval: Duration::from_secs(5),
            deadline: Duration::from_millis(deadline_ms),
        })
    }
}

#[async_trait]
impl CaptchaSolver for AntiCaptcha {
    async fn solve(&self, challenge: &CaptchaChallenge) -> Result<String> {
        let create = self
            .client
            .post("https://api.anti-captcha.com/createTask")
            .json(&json!({
                "clientKey": self.api_key,
                "task": {
                    "type": "RecaptchaV2TaskProxyless",
                    "websiteURL": challenge.page_url,
                    "websiteKey": challenge.site_key,
                }
            }))
            .send()
            .await
            .context("anti-captcha createTask failed")?;

        let created: serde_json::Value = create.json().await?;
        if created["errorId"].as_i64().unwrap_or(0) != 0 {
            bail!(
                "anti-captcha rejected task: {}",
                created["errorCode"].as_str().unwrap_or("unknown")
            );
        }
        let task_id = created["taskId"]
            .as_i64()
            .context("anti-captcha response missing taskId")?;

        let started = std::time::Instant::now();
        loop {
            if started.elapsed() > self.deadline {
                bail!("anti-captcha task {task_id} timed out");
            }
            tokio::time::sleep(self.poll_interval).await;

            let poll = self
                .client
                .post("https://api.anti-captcha.com/getTaskResult")
                .json(&json!({"clientKey": self.api_key, "taskId": task_id}))
                .send()
                .await
                .context("anti-captcha getTaskResult failed")?;
            let result: serde_json::Value = poll.json().await?;

            if result["errorId"].as_i64().unwrap_or(0) != 0 {
                bail!(
                    "anti-captcha task failed: {}",
                    result["errorCode"].as_str().unwrap_or("unknown")
                );
            }
            if result["status"].as_str() == Some("ready") {
                return result["solution"]["gRecaptchaResponse"]
                    .as_str()
                    .map(|s| s.to_string())
                    .context("anti-captcha solution missing gRecaptchaResponse");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_site_key_takes_priority() {
        let artifacts = PageArtifacts {
            url: "https://broker.example.com/form".into(),
            html: r#"<div class="g-recaptcha" data-sitekey="from-page"></div>"#.into(),
            ..PageArtifacts::default()
        };
        let config = CaptchaConfig {
            site_key: Some("from-config".into()),
        };
        let challenge = detect_challenge(&artifacts, Some(&config)).unwrap();
        assert_eq!(challenge.site_key, "from-config");
    }

    #[test]
    fn site_key_discovered_from_html() {
        let artifacts = PageArtifacts {
            url: "https://broker.example.com/form".into(),
            html: r#"<div class="g-recaptcha" data-sitekey="6LeIxAcTAAAAAJcZ"></div>"#.into(),
            ..PageArtifacts::default()
        };
        let challenge = detect_challenge(&artifacts, None).unwrap();
        assert_eq!(challenge.site_key, "6LeIxAcTAAAAAJcZ");
        assert_eq!(challenge.page_url, "https://broker.example.com/form");
    }

    #[test]
    fn no_indication_means_no_challenge() {
        let artifacts = PageArtifacts {
            url: "https://broker.example.com/form".into(),
            html: "<form></form>".into(),
            ..PageArtifacts::default()
        };
        assert!(detect_challenge(&artifacts, None).is_none());
    }
}
