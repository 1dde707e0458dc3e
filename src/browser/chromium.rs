//! Chromium-backed browser collaborator using chromiumoxide.
//!
//! Artifact capture (hidden inputs, meta tags, storage, cookies) and form
//! analysis run as in-page JavaScript, so the rest of the crate only ever
//! sees `PageArtifacts` and `FieldDescriptor` values.
//!
//! CDP network events are not wired up: `PageArtifacts::network` stays empty
//! with this engine, so token rules reading network bodies never match and
//! browser submissions report no observed endpoint, which makes newly
//! discovered brokers promote with the `browser_submit` method.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser as CdpBrowser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;

use super::{
    Browser, BrowserSession, FieldDescriptor, FillReport, NetworkRequest, PageArtifacts,
    SubmitOutcome,
};

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. OPTOUT_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("OPTOUT_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. System PATH
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 3. Common macOS location
    if cfg!(target_os = "macos") {
        let common =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Chromium-backed browser engine.
pub struct ChromiumBrowser {
    browser: CdpBrowser,
    screenshot_dir: PathBuf,
}

impl ChromiumBrowser {
    /// Launch a headless Chromium instance.
    pub async fn new() -> Result<Self> {
        let chrome_path = find_chromium()
            .context("Chromium not found; set OPTOUT_CHROMIUM_PATH or install google-chrome")?;

        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = CdpBrowser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        let screenshot_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".optout")
            .join("screenshots");
        std::fs::create_dir_all(&screenshot_dir)?;

        Ok(Self {
            browser,
            screenshot_dir,
        })
    }
}

#[async_trait]
impl Browser for ChromiumBrowser {
    async fn new_session(&self) -> Result<Box<dyn BrowserSession>> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .context("failed to create new page")?;
        Ok(Box::new(ChromiumSession {
            page,
            screenshot_dir: self.screenshot_dir.clone(),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        // Browser is dropped with the engine.
        Ok(())
    }
}

/// One Chromium page.
pub struct ChromiumSession {
    page: Page,
    screenshot_dir: PathBuf,
}

impl ChromiumSession {
    async fn eval_value(&self, script: &str) -> Result<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .context("JS execution failed")?;
        result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert JS result: {e:?}"))
    }

    /// Capture the artifact surface token rules operate on.
    async fn capture_artifacts(&self) -> Result<PageArtifacts> {
        let url = self
            .page
            .url()
            .await
            .context("failed to get URL")?
            .map(|u| u.to_string())
            .unwrap_or_default();

        let captured = self
            .eval_value(
                r#"(() => {
                const hidden = {};
                document.querySelectorAll('input[type="hidden"]').forEach(i => {
                    if (i.name) hidden[i.name] = i.value || '';
                });
                const meta = {};
                document.querySelectorAll('meta').forEach(m => {
                    const name = m.getAttribute('name') || m.getAttribute('property');
                    if (name) meta[name] = m.getAttribute('content') || '';
                });
                const storage = {};
                try {
                    for (let i = 0; i < localStorage.length; i++) {
                        const k = localStorage.key(i);
                        storage[k] = localStorage.getItem(k);
                    }
                    for (let i = 0; i < sessionStorage.length; i++) {
                        const k = sessionStorage.key(i);
                        storage[k] = sessionStorage.getItem(k);
                    }
                } catch (e) {}
                return {
                    html: document.documentElement.outerHTML,
                    cookies: document.cookie,
                    hidden, meta, storage,
                };
            })()"#,
            )
            .await?;

        let to_map = |v: &serde_json::Value| -> BTreeMap<String, String> {
            v.as_object()
                .map(|o| {
                    o.iter()
                        .map(|(k, v)| (k.clone(), v.as_str().unwrap_or("").to_string()))
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(PageArtifacts {
            url,
            html: captured["html"].as_str().unwrap_or("").to_string(),
            cookies: captured["cookies"].as_str().unwrap_or("").to_string(),
            hidden_inputs: to_map(&captured["hidden"]),
            meta_tags: to_map(&captured["meta"]),
            storage: to_map(&captured["storage"]),
            network: Vec::new(),
            screenshot_refs: Vec::new(),
        })
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<PageArtifacts> {
        let start = Instant::now();
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            self.page.goto(url),
        )
        .await;

        match result {
            Ok(Ok(_)) => {
                let _ = self.page.wait_for_navigation().await;
                tracing::debug!(url, elapsed_ms = start.elapsed().as_millis() as u64, "navigated");
                self.capture_artifacts().await
            }
            Ok(Err(e)) => bail!("navigation failed: {e}"),
            Err(_) => bail!("navigation timed out after {timeout_ms}ms"),
        }
    }

    async fn extract_form_fields(&mut self) -> Result<Vec<FieldDescriptor>> {
        let raw = self
            .eval_value(
                r#"(() => {
                return Array.from(document.querySelectorAll(
                    'input, select, textarea, [role="combobox"], [role="listbox"]'
                )).map(f => {
                    let fieldType = f.type || 'text';
                    if (f.getAttribute('role') === 'listbox') fieldType = 'option';
                    else if (f.getAttribute('role') === 'combobox') fieldType = 'autocomplete';
                    else if (f.tagName === 'SELECT') fieldType = 'option';
                    return {
                        id: f.id || f.name || '',
                        name: f.name || '',
                        field_type: fieldType,
                        label: f.getAttribute('aria-label') || '',
                        required: f.hasAttribute('required'),
                    };
                }).filter(f => f.id && f.field_type !== 'hidden');
            })()"#,
            )
            .await?;
        let fields: Vec<FieldDescriptor> =
            serde_json::from_value(raw).context("unexpected form-analysis shape")?;
        Ok(fields)
    }

    async fn fill_form(&mut self, values: &BTreeMap<String, String>) -> Result<FillReport> {
        let mut filled = 0;
        let mut errors = Vec::new();

        for (field_id, value) in values {
            // Try id, then name, then partial matches — the selector ladder
            // that covers most broker forms.
            let script = format!(
                r#"(() => {{
                    const id = {id};
                    const value = {value};
                    const el = document.getElementById(id)
                        || document.querySelector(`[name="${{id}}"]`)
                        || document.querySelector(`[id*="${{id}}"]`)
                        || document.querySelector(`[name*="${{id}}"]`);
                    if (!el) return 'not found';
                    el.focus();
                    if (el.tagName === 'SELECT') {{
                        const opt = Array.from(el.options)
                            .find(o => o.text.trim() === value || o.value === value);
                        if (!opt) return 'no matching option';
                        el.value = opt.value;
                    }} else {{
                        el.value = value;
                    }}
                    el.dispatchEvent(new Event('input', {{bubbles: true}}));
                    el.dispatchEvent(new Event('change', {{bubbles: true}}));
                    return 'ok';
                }})()"#,
                id = serde_json::to_string(field_id)?,
                value = serde_json::to_string(value)?,
            );
            match self.eval_value(&script).await {
                Ok(v) if v.as_str() == Some("ok") => filled += 1,
                Ok(v) => errors.push(format!(
                    "{field_id}: {}",
                    v.as_str().unwrap_or("fill failed")
                )),
                Err(e) => errors.push(format!("{field_id}: {e:#}")),
            }
        }

        let artifacts = self.capture_artifacts().await?;
        Ok(FillReport {
            filled,
            errors,
            artifacts,
        })
    }

    async fn submit_form(&mut self, timeout_ms: u64) -> Result<SubmitOutcome> {
        // Standard submit controls first, then text/primary-button fallbacks.
        let clicked = self
            .eval_value(
                r#"(() => {
                const selectors = [
                    'button[type="submit"], input[type="submit"]',
                    'button.primary, button[class*="primary"]',
                    'button[class*="submit"], button[class*="action"]',
                ];
                for (const sel of selectors) {
                    const btn = document.querySelector(sel);
                    if (btn) { btn.click(); return true; }
                }
                const byText = Array.from(document.querySelectorAll('button'))
                    .find(b => /submit|send|continue/i.test(b.textContent));
                if (byText) { byText.click(); return true; }
                return false;
            })()"#,
            )
            .await?;
        if clicked.as_bool() != Some(true) {
            bail!("no submit control found");
        }

        let _ = tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            self.page.wait_for_navigation(),
        )
        .await;

        let artifacts = self.capture_artifacts().await?;
        let observed = artifacts
            .network
            .iter()
            .find(|r: &&NetworkRequest| r.method.eq_ignore_ascii_case("POST"));
        Ok(SubmitOutcome {
            status: observed.and_then(|r| r.status),
            observed_endpoint: observed.map(|r| r.url.clone()),
            observed_method: observed.map(|r| r.method.clone()),
            artifacts,
        })
    }

    async fn screenshot(&mut self, name: &str) -> Result<String> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = self.screenshot_dir.join(format!("{name}_{stamp}.png"));
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        self.page
            .save_screenshot(params, &path)
            .await
            .context("screenshot capture failed")?;
        Ok(path.display().to_string())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let _ = self.page.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn navigate_and_analyze_a_form() {
        let browser = ChromiumBrowser::new().await.expect("launch failed");
        let mut session = browser.new_session().await.expect("session failed");

        let artifacts = session
            .navigate(
                "data:text/html,<form><input id='fname' name='first'>\
                 <input type='hidden' name='csrf' value='tok'>\
                 <button type='submit'>Submit</button></form>",
                10_000,
            )
            .await
            .expect("navigation failed");
        assert_eq!(artifacts.hidden_inputs.get("csrf").map(String::as_str), Some("tok"));

        let fields = session.extract_form_fields().await.expect("analysis failed");
        assert!(fields.iter().any(|f| f.id == "fname"));

        session.close().await.expect("close failed");
        browser.shutdown().await.expect("shutdown failed");
    }
}
