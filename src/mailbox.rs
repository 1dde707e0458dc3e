//! Mailbox collaborator: post-submission confirmation monitoring.
//!
//! After a submission, the orchestrator watches for a confirmation reply from
//! the broker's known sender domains inside a bounded time window. Absence of
//! a confirmation within the window is a `not-confirmed` observation, not an
//! error, and never changes the submission status.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// One message matched by the watcher.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub id: String,
    pub from: String,
    pub subject: String,
}

/// Finds messages from the given sender domains received after `since`.
#[async_trait]
pub trait MailboxWatcher: Send + Sync {
    async fn find_messages(
        &self,
        sender_domains: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<MailMessage>>;
}

/// Confirmation monitoring only works against a Gmail mailbox; surface that
/// constraint before anyone waits five minutes for nothing.
pub fn require_gmail_address(email: &str) -> Result<()> {
    let domain = email.rsplit('@').next().unwrap_or("");
    if domain.eq_ignore_ascii_case("gmail.com") || domain.eq_ignore_ascii_case("googlemail.com") {
        Ok(())
    } else {
        bail!(
            "confirmation monitoring requires a Gmail address; '{email}' cannot be watched"
        )
    }
}

/// Poll the watcher until a matching message arrives or the window closes.
///
/// Returns `Ok(true)` on confirmation, `Ok(false)` when the window elapses
/// without one. Watcher errors are logged and treated as not-confirmed so
/// the rest of the run is never blocked on mailbox trouble.
pub async fn await_confirmation(
    watcher: &dyn MailboxWatcher,
    sender_domains: &[String],
    since: DateTime<Utc>,
    window: Duration,
    poll_interval: Duration,
) -> bool {
    if sender_domains.is_empty() {
        warn!("no email domains configured; skipping confirmation check");
        return false;
    }

    let deadline = std::time::Instant::now() + window;
    loop {
        match watcher.find_messages(sender_domains, since).await {
            Ok(messages) if !messages.is_empty() => {
                debug!(
                    from = %messages[0].from,
                    subject = %messages[0].subject,
                    "confirmation message found"
                );
                return true;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mailbox check failed: {e:#}");
                return false;
            }
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Gmail REST backend. Expects an OAuth access token in `GMAIL_ACCESS_TOKEN`;
/// the token-refresh dance is outside this crate.
pub struct GmailWatcher {
    client: reqwest::Client,
    access_token: String,
}

impl GmailWatcher {
    pub fn from_env() -> Result<Self> {
        let access_token = std::env::var("GMAIL_ACCESS_TOKEN")
            .context("GMAIL_ACCESS_TOKEN is required for confirmation monitoring")?;
        Ok(Self {
            client: reqwest::Client::new(),
            access_token,
        })
    }
}

#[async_trait]
impl MailboxWatcher for GmailWatcher {
    async fn find_messages(
        &self,
        sender_domains: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<MailMessage>> {
        // Gmail search grammar: from:(a.com OR b.com) after:<unix-ts>
        let from = sender_domains.join(" OR ");
        let query = format!("from:({from}) after:{}", since.timestamp());

        let resp = self
            .client
            .get("https://gmail.googleapis.com/gmail/v1/users/me/messages")
            .bearer_auth(&self.access_token)
            .query(&[("q", query.as_str()), ("maxResults", "10")])
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .context("Gmail list request failed")?;

        let status = resp.status();
        if !status.is_success() {
            bail!("Gmail API returned {status}");
        }
        let listing: serde_json::Value = resp.json().await?;
        let ids: Vec<String> = listing["messages"]
            .as_array()
            .map(|msgs| {
                msgs.iter()
                    .filter_map(|m| m["id"].as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let detail: serde_json::Value = self
                .client
                .get(format!(
                    "https://gmail.googleapis.com/gmail/v1/users/me/messages/{id}"
                ))
                .bearer_auth(&self.access_token)
                .query(&[
                    ("format", "metadata"),
                    ("metadataHeaders", "From"),
                    ("metadataHeaders", "Subject"),
                ])
                .timeout(Duration::from_secs(15))
                .send()
                .await?
                .json()
                .await?;

            let mut from = String::new();
            let mut subject = String::new();
            if let Some(headers) = detail["payload"]["headers"].as_array() {
                for h in headers {
                    match h["name"].as_str() {
                        Some("From") => from = h["value"].as_str().unwrap_or("").to_string(),
                        Some("Subject") => subject = h["value"].as_str().unwrap_or("").to_string(),
                        _ => {}
                    }
                }
            }
            out.push(MailMessage { id, from, subject });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedWatcher {
        calls: AtomicUsize,
        hit_on_call: usize,
    }

    #[async_trait]
    impl MailboxWatcher for ScriptedWatcher {
        async fn find_messages(
            &self,
            _domains: &[String],
            _since: DateTime<Utc>,
        ) -> Result<Vec<MailMessage>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.hit_on_call {
                Ok(vec![MailMessage {
                    id: "m1".into(),
                    from: "privacy@acxiom.com".into(),
                    subject: "Your request was received".into(),
                }])
            } else {
                Ok(vec![])
            }
        }
    }

    #[test]
    fn gmail_address_constraint() {
        assert!(require_gmail_address("ada@gmail.com").is_ok());
        assert!(require_gmail_address("ada@googlemail.com").is_ok());
        assert!(require_gmail_address("ada@example.com").is_err());
    }

    #[tokio::test]
    async fn confirmation_found_within_window() {
        let watcher = ScriptedWatcher {
            calls: AtomicUsize::new(0),
            hit_on_call: 2,
        };
        let confirmed = await_confirmation(
            &watcher,
            &["acxiom.com".to_string()],
            Utc::now(),
            Duration::from_millis(500),
            Duration::from_millis(10),
        )
        .await;
        assert!(confirmed);
    }

    #[tokio::test]
    async fn window_elapses_without_confirmation() {
        let watcher = ScriptedWatcher {
            calls: AtomicUsize::new(0),
            hit_on_call: usize::MAX,
        };
        let confirmed = await_confirmation(
            &watcher,
            &["acxiom.com".to_string()],
            Utc::now(),
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await;
        assert!(!confirmed);
    }

    #[tokio::test]
    async fn empty_domain_list_short_circuits() {
        let watcher = ScriptedWatcher {
            calls: AtomicUsize::new(0),
            hit_on_call: 1,
        };
        let confirmed =
            await_confirmation(&watcher, &[], Utc::now(), Duration::ZERO, Duration::ZERO).await;
        assert!(!confirmed);
        assert_eq!(watcher.calls.load(Ordering::SeqCst), 0);
    }
}
