//! Browser collaborator abstraction.
//!
//! The orchestrator never talks to a browser engine directly. It consumes the
//! `Browser`/`BrowserSession` traits, which a Chromium implementation backs in
//! production (`chromium.rs`) and fakes back in tests. Sessions capture page
//! state into `PageArtifacts`; token extraction and CAPTCHA discovery operate
//! purely on those artifacts, never on a live page.

pub mod chromium;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One network request observed while a page was loaded or submitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
    /// Response status, when the response was observed.
    #[serde(default)]
    pub status: Option<u16>,
}

/// Everything captured from a rendered page — the only surface the core
/// inspects. Hidden inputs, meta tags, and storage entries are pre-split so
/// token rules can address them by name without re-parsing HTML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageArtifacts {
    /// Final URL after redirects.
    pub url: String,
    pub html: String,
    /// `document.cookie` snapshot.
    #[serde(default)]
    pub cookies: String,
    /// Hidden `<input>` name → value.
    #[serde(default)]
    pub hidden_inputs: BTreeMap<String, String>,
    /// `<meta>` name/property → content.
    #[serde(default)]
    pub meta_tags: BTreeMap<String, String>,
    /// localStorage/sessionStorage key → value.
    #[serde(default)]
    pub storage: BTreeMap<String, String>,
    /// Network requests observed during the session.
    #[serde(default)]
    pub network: Vec<NetworkRequest>,
    /// Opaque screenshot references (paths or identifiers).
    #[serde(default)]
    pub screenshot_refs: Vec<String>,
}

/// One form field discovered on a page, as handed to the AI mapper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Stable identifier (element id, falling back to name).
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// text | select | autocomplete | textarea | option | …
    #[serde(default)]
    pub field_type: String,
    /// aria-label or adjacent label text, when available.
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub required: bool,
}

/// Outcome of filling a form (no submission yet).
#[derive(Debug, Clone, Default)]
pub struct FillReport {
    pub filled: usize,
    pub errors: Vec<String>,
    pub artifacts: PageArtifacts,
}

/// Outcome of clicking through a form submission in the browser.
#[derive(Debug, Clone, Default)]
pub struct SubmitOutcome {
    /// Status of the submission request, when one was observed.
    pub status: Option<u16>,
    /// Endpoint the form posted to, when a submission request was observed.
    pub observed_endpoint: Option<String>,
    pub observed_method: Option<String>,
    pub artifacts: PageArtifacts,
}

/// A browser engine that can open isolated sessions (tabs).
#[async_trait]
pub trait Browser: Send + Sync {
    /// Open a new session.
    async fn new_session(&self) -> Result<Box<dyn BrowserSession>>;
    /// Shut down the engine.
    async fn shutdown(&self) -> Result<()>;
}

/// A single browser session driving one broker's page.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Navigate and capture page artifacts.
    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<PageArtifacts>;
    /// Discover form field descriptors on the current page.
    async fn extract_form_fields(&mut self) -> Result<Vec<FieldDescriptor>>;
    /// Fill fields (`field id → value`) without submitting.
    async fn fill_form(&mut self, values: &BTreeMap<String, String>) -> Result<FillReport>;
    /// Click the form's submit control and report the observed outcome.
    async fn submit_form(&mut self, timeout_ms: u64) -> Result<SubmitOutcome>;
    /// Capture a screenshot and return an opaque reference to it.
    async fn screenshot(&mut self, name: &str) -> Result<String>;
    /// Close the session.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// A no-op browser used when Chromium is unavailable.
///
/// Deterministic brokers whose protocol does not need page tokens can still
/// submit over plain HTTP; anything needing a real page fails cleanly.
pub struct NoopBrowser;

#[async_trait]
impl Browser for NoopBrowser {
    async fn new_session(&self) -> Result<Box<dyn BrowserSession>> {
        Err(anyhow::anyhow!("browser not available"))
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
