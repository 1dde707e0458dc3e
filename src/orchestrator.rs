//! Run orchestration: route every broker to its pipeline and aggregate results.
//!
//! Brokers are independent tasks — bounded concurrent fan-out, no ordering
//! guarantee, and no broker's outcome may affect another's. Every pipeline
//! error is folded into that broker's `SubmissionResult` at the boundary;
//! only pre-run fatals (config directory, duplicate names, filter misses)
//! abort the run.

use std::time::Duration;

use anyhow::{bail, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::browser::Browser;
use crate::captcha::CaptchaSolver;
use crate::config::store::ConfigStore;
use crate::config::{select, BrokerConfig, SubmissionPlan};
use crate::error::BrokerError;
use crate::fallback::{self, FallbackDeps, ReviewGate, SerialReviewGate};
use crate::llm::LlmClient;
use crate::mailbox::{self, MailboxWatcher};
use crate::mapper::MapperPolicy;
use crate::submit::{self, SubmitDeps};
use crate::userdata::UserData;

/// Which pipeline handled the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Deterministic,
    AiFallback,
}

/// Terminal status of one broker's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Failed,
    /// Reserved for reports of runs suspended at the review checkpoint.
    NeedsReview,
    Skipped,
}

/// Opaque artifacts captured along the way, surfaced in the report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CapturedArtifacts {
    pub jwt_source: Option<String>,
    pub screenshot_refs: Vec<String>,
}

/// One broker, one result. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionResult {
    pub broker: String,
    pub mode: Option<Mode>,
    pub status: Status,
    /// Machine-readable reason tag for failures.
    pub reason: Option<String>,
    pub detail: String,
    pub artifacts: CapturedArtifacts,
    /// Outcome of confirmation monitoring; `None` = not checked.
    pub confirmation: Option<bool>,
}

/// Aggregated run report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub results: Vec<SubmissionResult>,
}

impl RunReport {
    pub fn count(&self, status: Status) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn any_failed(&self) -> bool {
        self.results.iter().any(|r| r.status == Status::Failed)
    }

    /// Exit-code policy: non-zero iff at least one broker failed.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.any_failed())
    }

    /// Human-readable per-broker status lines.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Processed {} broker(s): {} succeeded, {} failed, {} skipped\n",
            self.results.len(),
            self.count(Status::Success),
            self.count(Status::Failed),
            self.count(Status::Skipped),
        ));
        for r in &self.results {
            let mode = match r.mode {
                Some(Mode::Deterministic) => "deterministic",
                Some(Mode::AiFallback) => "ai_fallback",
                None => "-",
            };
            let confirmation = match r.confirmation {
                Some(true) => " (confirmed by email)",
                Some(false) => " (no confirmation email)",
                None => "",
            };
            out.push_str(&format!(
                "  {:<24} {:?} [{mode}]{confirmation} {}\n",
                r.broker, r.status, r.detail
            ));
        }
        out
    }
}

/// All collaborators and budgets for one run, injected by the caller.
pub struct Orchestrator<'a> {
    pub browser: &'a dyn Browser,
    pub llm: Option<&'a dyn LlmClient>,
    pub captcha: Option<&'a dyn CaptchaSolver>,
    pub review: &'a dyn ReviewGate,
    pub store: &'a dyn ConfigStore,
    pub mailbox: Option<&'a dyn MailboxWatcher>,
    pub http: reqwest::Client,
    pub mapper_policy: MapperPolicy,
    /// Per-collaborator-call timeout.
    pub timeout_ms: u64,
    /// Max brokers in flight at once.
    pub concurrency: usize,
    /// Confirmation-mail window; `None` disables monitoring.
    pub confirmation_window: Option<Duration>,
}

impl<'a> Orchestrator<'a> {
    /// Run every config (or just the filtered one) and aggregate results.
    pub async fn run(
        &self,
        configs: &[BrokerConfig],
        user: &UserData,
        broker_filter: Option<&str>,
    ) -> Result<RunReport> {
        let selected: Vec<&BrokerConfig> = match broker_filter {
            Some(name) => {
                let matched: Vec<&BrokerConfig> = configs
                    .iter()
                    .filter(|c| c.name.eq_ignore_ascii_case(name))
                    .collect();
                if matched.is_empty() {
                    let available: Vec<&str> =
                        configs.iter().map(|c| c.name.as_str()).collect();
                    bail!(
                        "no configuration for broker '{name}'; available: {}",
                        available.join(", ")
                    );
                }
                matched
            }
            None => configs.iter().collect(),
        };

        if selected.is_empty() {
            bail!("no broker configurations to process");
        }

        info!(brokers = selected.len(), "starting run");
        // Brokers fan out concurrently, but review prompts must not
        // interleave: one answer, one broker.
        let review = SerialReviewGate::new(self.review);
        let results: Vec<SubmissionResult> = stream::iter(selected)
            .map(|config| self.process_broker(config, user, &review))
            .buffer_unordered(self.concurrency.max(1))
            .collect()
            .await;

        Ok(RunReport { results })
    }

    async fn process_broker(
        &self,
        config: &BrokerConfig,
        user: &UserData,
        review: &dyn ReviewGate,
    ) -> SubmissionResult {
        let broker = if config.name.trim().is_empty() {
            "<unnamed>".to_string()
        } else {
            config.name.clone()
        };

        let plan = match select(config) {
            Ok(plan) => plan,
            Err(e) => return self.result_from_error(broker, None, e),
        };

        match plan {
            SubmissionPlan::Deterministic(ref det) => {
                info!(broker = %det.name, "deterministic pipeline");
                let deps = SubmitDeps {
                    browser: self.browser,
                    captcha: self.captcha,
                    http: &self.http,
                    timeout_ms: self.timeout_ms,
                };
                match submit::run(det, user, &deps).await {
                    Ok(outcome) => {
                        let confirmation = self
                            .check_confirmation(&det.email_domains, user, outcome.submitted_at)
                            .await;
                        SubmissionResult {
                            broker,
                            mode: Some(Mode::Deterministic),
                            status: Status::Success,
                            reason: None,
                            detail: format!("submitted (status {})", outcome.status),
                            artifacts: CapturedArtifacts {
                                jwt_source: outcome.jwt_source,
                                screenshot_refs: outcome.screenshot_refs,
                            },
                            confirmation,
                        }
                    }
                    Err(e) => self.result_from_error(broker, Some(Mode::Deterministic), e),
                }
            }
            SubmissionPlan::AiFallback(ref ai) => {
                info!(broker = %ai.name, "AI fallback pipeline");
                let Some(llm) = self.llm else {
                    return self.result_from_error(
                        broker,
                        Some(Mode::AiFallback),
                        BrokerError::Collaborator {
                            stage: "field mapping",
                            detail: "no language-model collaborator configured".to_string(),
                        },
                    );
                };
                let deps = FallbackDeps {
                    browser: self.browser,
                    llm,
                    review,
                    store: self.store,
                    mapper_policy: self.mapper_policy.clone(),
                    timeout_ms: self.timeout_ms,
                };
                match fallback::run(ai, user, &deps).await {
                    Ok(outcome) => {
                        let confirmation = self
                            .check_confirmation(&ai.email_domains, user, outcome.submitted_at)
                            .await;
                        SubmissionResult {
                            broker,
                            mode: Some(Mode::AiFallback),
                            status: Status::Success,
                            reason: None,
                            detail: match outcome.promotion {
                                Some(p) => format!(
                                    "submitted (status {}); promotion: {p:?}",
                                    outcome.status
                                ),
                                None => format!("submitted (status {})", outcome.status),
                            },
                            artifacts: CapturedArtifacts {
                                jwt_source: None,
                                screenshot_refs: outcome.screenshot_refs,
                            },
                            confirmation,
                        }
                    }
                    Err(e) => self.result_from_error(broker, Some(Mode::AiFallback), e),
                }
            }
        }
    }

    async fn check_confirmation(
        &self,
        domains: &[String],
        user: &UserData,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Option<bool> {
        let window = self.confirmation_window?;
        let watcher = self.mailbox?;
        if let Err(e) = mailbox::require_gmail_address(&user.email) {
            warn!("{e:#}");
            return None;
        }
        Some(
            mailbox::await_confirmation(
                watcher,
                domains,
                since,
                window,
                Duration::from_secs(15).min(window),
            )
            .await,
        )
    }

    fn result_from_error(
        &self,
        broker: String,
        mode: Option<Mode>,
        error: BrokerError,
    ) -> SubmissionResult {
        let status = if error.is_skip() {
            Status::Skipped
        } else {
            Status::Failed
        };
        warn!(%broker, reason = error.reason(), "{error}");
        SubmissionResult {
            broker,
            mode,
            status,
            reason: Some(error.reason().to_string()),
            detail: format!("{error}"),
            artifacts: CapturedArtifacts::default(),
            confirmation: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(broker: &str, status: Status) -> SubmissionResult {
        SubmissionResult {
            broker: broker.to_string(),
            mode: Some(Mode::Deterministic),
            status,
            reason: None,
            detail: String::new(),
            artifacts: CapturedArtifacts::default(),
            confirmation: None,
        }
    }

    #[test]
    fn exit_code_is_nonzero_iff_any_failed() {
        let ok = RunReport {
            results: vec![result("A", Status::Success), result("B", Status::Skipped)],
        };
        assert_eq!(ok.exit_code(), 0);

        let bad = RunReport {
            results: vec![result("A", Status::Success), result("B", Status::Failed)],
        };
        assert_eq!(bad.exit_code(), 1);
    }

    #[test]
    fn report_counts_by_status() {
        let report = RunReport {
            results: vec![
                result("A", Status::Success),
                result("B", Status::Failed),
                result("C", Status::Success),
            ],
        };
        assert_eq!(report.count(Status::Success), 2);
        assert_eq!(report.count(Status::Failed), 1);
        assert!(report.render().contains("2 succeeded"));
    }
}
