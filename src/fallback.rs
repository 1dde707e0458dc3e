//! AI fallback pipeline for minimally-configured brokers.
//!
//! Sequence: analyze the form → propose a validated field mapping → fill the
//! form → **mandatory manual-review checkpoint** → submit on confirmation →
//! classify → promote a full config on success. The pipeline never submits
//! without the review gate's approval; a declined review fails the broker
//! with `ReviewDeclined`.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::browser::{Browser, BrowserSession};
use crate::config::store::{promote, ConfigStore, PromotionOutcome};
use crate::config::{
    AiFallbackPlan, BrokerConfig, FormConfig, GeneratedMeta, StateFormat, SubmissionSpec,
};
use crate::error::{BrokerError, BrokerResult};
use crate::llm::LlmClient;
use crate::mapper::{ConstrainedMapper, FieldMappingProposal, MapperPolicy};
use crate::submit::BROWSER_SUBMIT;
use crate::userdata::UserData;

/// What the reviewer sees before deciding whether to submit.
#[derive(Debug, Clone, Default)]
pub struct ReviewSummary {
    pub fields_found: usize,
    pub fields_filled: usize,
    pub fill_errors: Vec<String>,
    pub missing_targets: Vec<String>,
    pub screenshot_refs: Vec<String>,
}

/// The manual-review checkpoint. The pipeline suspends on `confirm` and
/// only proceeds on an explicit yes.
#[async_trait]
pub trait ReviewGate: Send + Sync {
    async fn confirm(&self, broker: &str, review: &ReviewSummary) -> Result<bool>;
}

/// Interactive gate: prints the review summary and asks on stdin.
pub struct CliReviewGate;

#[async_trait]
impl ReviewGate for CliReviewGate {
    async fn confirm(&self, broker: &str, review: &ReviewSummary) -> Result<bool> {
        println!("\n=== Review: {broker} ===");
        println!(
            "Filled {}/{} fields",
            review.fields_filled, review.fields_found
        );
        for err in &review.fill_errors {
            println!("  fill error: {err}");
        }
        for missing in &review.missing_targets {
            println!("  not mapped: {missing}");
        }
        for shot in &review.screenshot_refs {
            println!("  screenshot: {shot}");
        }
        print!("Submit the form? (y/N): ");

        let answer = tokio::task::spawn_blocking(|| {
            use std::io::{BufRead, Write};
            std::io::stdout().flush().ok();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await??;
        Ok(answer.trim().eq_ignore_ascii_case("y"))
    }
}

/// Pre-approved gate for non-interactive runs (`--approve`) and tests.
pub struct PreApprovedGate;

#[async_trait]
impl ReviewGate for PreApprovedGate {
    async fn confirm(&self, _broker: &str, _review: &ReviewSummary) -> Result<bool> {
        Ok(true)
    }
}

/// Serializes confirms from concurrently-running brokers onto one gate. An
/// answer typed for one broker's prompt must never be consumed by another's.
pub struct SerialReviewGate<'a> {
    inner: &'a dyn ReviewGate,
    lock: tokio::sync::Mutex<()>,
}

impl<'a> SerialReviewGate<'a> {
    pub fn new(inner: &'a dyn ReviewGate) -> Self {
        Self {
            inner,
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl ReviewGate for SerialReviewGate<'_> {
    async fn confirm(&self, broker: &str, review: &ReviewSummary) -> Result<bool> {
        let _guard = self.lock.lock().await;
        self.inner.confirm(broker, review).await
    }
}

/// Collaborators the pipeline needs.
pub struct FallbackDeps<'a> {
    pub browser: &'a dyn Browser,
    pub llm: &'a dyn LlmClient,
    pub review: &'a dyn ReviewGate,
    pub store: &'a dyn ConfigStore,
    pub mapper_policy: MapperPolicy,
    pub timeout_ms: u64,
}

/// Successful terminal state.
#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    pub status: u16,
    pub promotion: Option<PromotionOutcome>,
    pub screenshot_refs: Vec<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Run the pipeline for one minimally-configured broker.
pub async fn run(
    plan: &AiFallbackPlan,
    user: &UserData,
    deps: &FallbackDeps<'_>,
) -> BrokerResult<FallbackOutcome> {
    let mut session =
        deps.browser
            .new_session()
            .await
            .map_err(|e| BrokerError::Collaborator {
                stage: "browser session",
                detail: format!("{e:#}"),
            })?;

    // The tab is closed whichever way the pipeline exits.
    let result = drive(session.as_mut(), plan, user, deps).await;
    if let Err(e) = session.close().await {
        debug!(broker = %plan.name, "session close failed: {e:#}");
    }
    result
}

async fn drive(
    session: &mut (dyn BrowserSession + 'static),
    plan: &AiFallbackPlan,
    user: &UserData,
    deps: &FallbackDeps<'_>,
) -> BrokerResult<FallbackOutcome> {
    let prepared = user.prepare(plan.state_format)?;

    session
        .navigate(&plan.url, deps.timeout_ms)
        .await
        .map_err(|e| BrokerError::Collaborator {
            stage: "navigation",
            detail: format!("{e:#}"),
        })?;

    // Analyze the form.
    let descriptors =
        session
            .extract_form_fields()
            .await
            .map_err(|e| BrokerError::Collaborator {
                stage: "form analysis",
                detail: format!("{e:#}"),
            })?;
    if descriptors.is_empty() {
        return Err(BrokerError::Collaborator {
            stage: "form analysis",
            detail: format!("no form fields found at {}", plan.url),
        });
    }
    debug!(broker = %plan.name, fields = descriptors.len(), "form analyzed");

    // Propose and validate the mapping.
    let mapper = ConstrainedMapper::new(deps.llm);
    let proposal = mapper
        .propose(&plan.name, &descriptors, &prepared, &deps.mapper_policy)
        .await?;

    // Fill without submitting.
    let fill_values = proposal.fill_values(&prepared);
    let report = session
        .fill_form(&fill_values)
        .await
        .map_err(|e| BrokerError::Collaborator {
            stage: "form fill",
            detail: format!("{e:#}"),
        })?;

    let mut screenshot_refs = report.artifacts.screenshot_refs.clone();
    if let Ok(shot) = session.screenshot("filled_form").await {
        screenshot_refs.push(shot);
    }

    // Mandatory checkpoint. Never auto-submit.
    let review = ReviewSummary {
        fields_found: descriptors.len(),
        fields_filled: report.filled,
        fill_errors: report.errors.clone(),
        missing_targets: proposal.missing_targets.clone(),
        screenshot_refs: screenshot_refs.clone(),
    };
    if report.filled == 0 {
        return Err(BrokerError::Submission {
            status: None,
            detail: format!("{}: no fields could be filled", plan.name),
        });
    }
    let confirmed = deps
        .review
        .confirm(&plan.name, &review)
        .await
        .map_err(|e| BrokerError::Collaborator {
            stage: "manual review",
            detail: format!("{e:#}"),
        })?;
    if !confirmed {
        return Err(BrokerError::ReviewDeclined(plan.name.clone()));
    }

    // Confirmed submission.
    let submitted_at = Utc::now();
    let outcome = session
        .submit_form(deps.timeout_ms)
        .await
        .map_err(|e| BrokerError::Submission {
            status: None,
            detail: format!("{}: browser submission failed: {e:#}", plan.name),
        })?;
    screenshot_refs.extend(outcome.artifacts.screenshot_refs.iter().cloned());

    let status = outcome.status.unwrap_or(200);
    if !(200..300).contains(&status) {
        return Err(BrokerError::Submission {
            status: Some(status),
            detail: format!("{}: submission returned {status}", plan.name),
        });
    }

    // Promote the discovered protocol into a full config.
    let discovered = build_discovered_config(plan, &proposal, &prepared, &outcome);
    let promotion = promote(deps.store, &discovered).map_err(|e| BrokerError::Collaborator {
        stage: "config promotion",
        detail: format!("{e:#}"),
    })?;
    info!(broker = %plan.name, ?promotion, "AI fallback completed");

    Ok(FallbackOutcome {
        status,
        promotion: Some(promotion),
        screenshot_refs,
        submitted_at,
    })
}

/// Turn a successful AI run into a full config.
///
/// When a submission request was observed, its endpoint and method become the
/// recorded protocol; otherwise the config records `browser_submit` against
/// the form URL so the broker still routes deterministically next run.
fn build_discovered_config(
    plan: &AiFallbackPlan,
    proposal: &FieldMappingProposal,
    prepared: &BTreeMap<String, String>,
    outcome: &crate::browser::SubmitOutcome,
) -> BrokerConfig {
    let state_format = match prepared.get("state") {
        // A two-character rendered state means the broker took a code.
        Some(s) if s.len() == 2 => StateFormat::Abbreviation,
        _ => StateFormat::Full,
    };

    let (method, endpoint) = match &outcome.observed_endpoint {
        Some(endpoint) => (
            outcome
                .observed_method
                .clone()
                .unwrap_or_else(|| "POST".to_string()),
            endpoint.clone(),
        ),
        None => (BROWSER_SUBMIT.to_string(), plan.url.clone()),
    };

    let email_domains = if plan.email_domains.is_empty() {
        vec![format!("{}.com", plan.name.to_lowercase())]
    } else {
        plan.email_domains.clone()
    };

    BrokerConfig {
        name: plan.name.clone(),
        kind: "web_form".to_string(),
        url: plan.url.clone(),
        email_domains,
        form_config: Some(FormConfig {
            state_format,
            field_mappings: proposal.as_config_mappings(),
            submission: Some(SubmissionSpec {
                method,
                endpoint,
                requires_jwt: false,
                requires_captcha: false,
                payload_template: Value::Null,
                headers: BTreeMap::new(),
            }),
            token_rules: vec![],
            captcha: None,
        }),
        generated: Some(GeneratedMeta {
            timestamp: Utc::now(),
            ai_generated: true,
            note: "Auto-generated from a confirmed AI fallback run; review before relying on it."
                .to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{
        BrowserSession, FieldDescriptor, FillReport, PageArtifacts, SubmitOutcome,
    };
    use crate::config::store::MemoryConfigStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct FakeBrowser {
        descriptors: Vec<FieldDescriptor>,
        submit_status: Option<u16>,
        observed_endpoint: Option<String>,
        closed: Arc<AtomicUsize>,
    }

    impl FakeBrowser {
        fn new(
            descriptors: Vec<FieldDescriptor>,
            submit_status: Option<u16>,
            observed_endpoint: Option<String>,
        ) -> Self {
            Self {
                descriptors,
                submit_status,
                observed_endpoint,
                closed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct FakeSession {
        descriptors: Vec<FieldDescriptor>,
        submit_status: Option<u16>,
        observed_endpoint: Option<String>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Browser for FakeBrowser {
        async fn new_session(&self) -> Result<Box<dyn BrowserSession>> {
            Ok(Box::new(FakeSession {
                descriptors: self.descriptors.clone(),
                submit_status: self.submit_status,
                observed_endpoint: self.observed_endpoint.clone(),
                closed: self.closed.clone(),
            }))
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl BrowserSession for FakeSession {
        async fn navigate(&mut self, url: &str, _timeout_ms: u64) -> Result<PageArtifacts> {
            Ok(PageArtifacts {
                url: url.to_string(),
                ..PageArtifacts::default()
            })
        }
        async fn extract_form_fields(&mut self) -> Result<Vec<FieldDescriptor>> {
            Ok(self.descriptors.clone())
        }
        async fn fill_form(
            &mut self,
            values: &BTreeMap<String, String>,
        ) -> Result<FillReport> {
            Ok(FillReport {
                filled: values.len(),
                ..FillReport::default()
            })
        }
        async fn submit_form(&mut self, _timeout_ms: u64) -> Result<SubmitOutcome> {
            Ok(SubmitOutcome {
                status: self.submit_status,
                observed_endpoint: self.observed_endpoint.clone(),
                observed_method: self.observed_endpoint.as_ref().map(|_| "POST".to_string()),
                ..SubmitOutcome::default()
            })
        }
        async fn screenshot(&mut self, name: &str) -> Result<String> {
            Ok(format!("{name}.png"))
        }
        async fn close(self: Box<Self>) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FixedLlm {
        response: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            let mut responses = self.response.lock().unwrap();
            Ok(if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses[0].clone()
            })
        }
    }

    struct DecliningGate;

    #[async_trait]
    impl ReviewGate for DecliningGate {
        async fn confirm(&self, _broker: &str, _review: &ReviewSummary) -> Result<bool> {
            Ok(false)
        }
    }

    fn plan() -> AiFallbackPlan {
        AiFallbackPlan {
            name: "NewBroker".into(),
            url: "https://newbroker.example.com/privacy".into(),
            email_domains: vec!["newbroker.com".into()],
            state_format: StateFormat::Full,
        }
    }

    fn user() -> UserData {
        UserData {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@gmail.com".into(),
            date_of_birth: None,
            address: None,
            city: None,
            state: Some("CA".into()),
            zip: None,
        }
    }

    fn descriptors() -> Vec<FieldDescriptor> {
        ["fname", "lname", "email_field"]
            .iter()
            .map(|id| FieldDescriptor {
                id: id.to_string(),
                ..FieldDescriptor::default()
            })
            .collect()
    }

    fn good_mapping() -> String {
        json!({
            "fname": {"user_data_key": "first_name", "field_type": "text"},
            "lname": {"user_data_key": "last_name", "field_type": "text"},
            "email_field": {"user_data_key": "email", "field_type": "text"},
        })
        .to_string()
    }

    #[tokio::test]
    async fn confirmed_run_submits_and_promotes() {
        let browser = FakeBrowser::new(
            descriptors(),
            Some(200),
            Some("https://newbroker.example.com/api/privacy".into()),
        );
        let llm = FixedLlm {
            response: Mutex::new(vec![good_mapping()]),
        };
        let store = MemoryConfigStore::new();
        let deps = FallbackDeps {
            browser: &browser,
            llm: &llm,
            review: &PreApprovedGate,
            store: &store,
            mapper_policy: MapperPolicy::default(),
            timeout_ms: 5_000,
        };

        let outcome = run(&plan(), &user(), &deps).await.unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.promotion, Some(PromotionOutcome::Created));

        let promoted = store.get("NewBroker").unwrap().unwrap();
        assert!(promoted.is_full());
        let fc = promoted.form_config.unwrap();
        assert_eq!(fc.field_mappings["fname"], "first_name");
        let sub = fc.submission.unwrap();
        assert_eq!(sub.endpoint, "https://newbroker.example.com/api/privacy");
        assert_eq!(sub.method, "POST");
        assert!(promoted.generated.unwrap().ai_generated);
    }

    #[tokio::test]
    async fn no_observed_endpoint_promotes_browser_submit() {
        let browser = FakeBrowser::new(descriptors(), None, None);
        let llm = FixedLlm {
            response: Mutex::new(vec![good_mapping()]),
        };
        let store = MemoryConfigStore::new();
        let deps = FallbackDeps {
            browser: &browser,
            llm: &llm,
            review: &PreApprovedGate,
            store: &store,
            mapper_policy: MapperPolicy::default(),
            timeout_ms: 5_000,
        };

        run(&plan(), &user(), &deps).await.unwrap();
        let promoted = store.get("NewBroker").unwrap().unwrap();
        let sub = promoted.form_config.unwrap().submission.unwrap();
        assert_eq!(sub.method, BROWSER_SUBMIT);
        assert_eq!(sub.endpoint, "https://newbroker.example.com/privacy");
        // Promoted config now routes deterministically.
        let reloaded = store.get("NewBroker").unwrap().unwrap();
        assert!(matches!(
            crate::config::select(&reloaded).unwrap(),
            crate::config::SubmissionPlan::Deterministic(_)
        ));
    }

    #[tokio::test]
    async fn declined_review_never_submits_or_promotes() {
        let browser = FakeBrowser::new(descriptors(), Some(200), None);
        let llm = FixedLlm {
            response: Mutex::new(vec![good_mapping()]),
        };
        let store = MemoryConfigStore::new();
        let deps = FallbackDeps {
            browser: &browser,
            llm: &llm,
            review: &DecliningGate,
            store: &store,
            mapper_policy: MapperPolicy::default(),
            timeout_ms: 5_000,
        };

        let err = run(&plan(), &user(), &deps).await.unwrap_err();
        assert!(matches!(err, BrokerError::ReviewDeclined(_)));
        assert!(store.get("NewBroker").unwrap().is_none());
        // The declined run must not leave its tab open.
        assert_eq!(browser.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_mapping_fails_without_promotion() {
        let bad = json!({
            "fname": {"user_data_key": "email", "field_type": "text"},
            "email_field": {"user_data_key": "email", "field_type": "text"},
        })
        .to_string();
        let browser = FakeBrowser::new(descriptors(), Some(200), None);
        let llm = FixedLlm {
            response: Mutex::new(vec![bad]),
        };
        let store = MemoryConfigStore::new();
        let deps = FallbackDeps {
            browser: &browser,
            llm: &llm,
            review: &PreApprovedGate,
            store: &store,
            mapper_policy: MapperPolicy::default(),
            timeout_ms: 5_000,
        };

        let err = run(&plan(), &user(), &deps).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidMapping(_)));
        assert!(store.get("NewBroker").unwrap().is_none());
        assert_eq!(browser.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn page_without_fields_fails_the_broker() {
        let browser = FakeBrowser::new(vec![], Some(200), None);
        let llm = FixedLlm {
            response: Mutex::new(vec![good_mapping()]),
        };
        let store = MemoryConfigStore::new();
        let deps = FallbackDeps {
            browser: &browser,
            llm: &llm,
            review: &PreApprovedGate,
            store: &store,
            mapper_policy: MapperPolicy::default(),
            timeout_ms: 5_000,
        };
        let err = run(&plan(), &user(), &deps).await.unwrap_err();
        assert!(matches!(err, BrokerError::Collaborator { stage: "form analysis", .. }));
    }

    #[tokio::test]
    async fn serial_gate_never_overlaps_confirms() {
        struct SlowGate {
            in_flight: AtomicUsize,
            max_in_flight: AtomicUsize,
        }

        #[async_trait]
        impl ReviewGate for SlowGate {
            async fn confirm(&self, _broker: &str, _review: &ReviewSummary) -> Result<bool> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(true)
            }
        }

        let slow = SlowGate {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        };
        let gate = SerialReviewGate::new(&slow);
        let review = ReviewSummary::default();
        let (a, b) = futures::join!(gate.confirm("A", &review), gate.confirm("B", &review));
        assert!(a.unwrap() && b.unwrap());
        assert_eq!(slow.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
