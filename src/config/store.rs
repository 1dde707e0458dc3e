//! Config-store capability: durable, append-only broker configs.
//!
//! Promotion is the only writer. Writes are staged to a temp file in the
//! same directory and atomically renamed into place, so a crash mid-write
//! can never leave a corrupt config. A stored *full* config is never
//! overwritten; a stored *minimal* config may be upgraded (it carries no
//! submission protocol to lose).
//!
//! The store is an injected dependency, not a module-level singleton, so
//! tests substitute `MemoryConfigStore`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::info;

use super::BrokerConfig;

/// Outcome of a promotion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// A brand-new config was written.
    Created,
    /// An existing minimal config was upgraded to full.
    Upgraded,
    /// A full config already existed; nothing was written.
    SkippedExistingFull,
}

/// Read/append access to broker-config storage.
pub trait ConfigStore: Send + Sync {
    /// Look up a stored config by broker name.
    fn get(&self, name: &str) -> Result<Option<BrokerConfig>>;
    /// Write `config` unless a full config already exists for that name.
    fn create_if_absent(&self, config: &BrokerConfig) -> Result<PromotionOutcome>;
}

/// Promote a discovered full config into the store.
///
/// Idempotent per broker name: once promoted, the broker routes through the
/// deterministic path on every later run, and re-promotion is a logged no-op.
pub fn promote(store: &dyn ConfigStore, config: &BrokerConfig) -> Result<PromotionOutcome> {
    let outcome = store.create_if_absent(config)?;
    match outcome {
        PromotionOutcome::Created => {
            info!(broker = %config.name, "promoted discovered config");
        }
        PromotionOutcome::Upgraded => {
            info!(broker = %config.name, "upgraded minimal config to full");
        }
        PromotionOutcome::SkippedExistingFull => {
            info!(broker = %config.name, "full config already exists; promotion skipped");
        }
    }
    Ok(outcome)
}

/// Filesystem store: one `<name>.json` per broker under a directory.
pub struct FsConfigStore {
    dir: PathBuf,
}

impl FsConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Default store at `~/.optout/broker_configs`.
    pub fn default_store() -> Result<Self> {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".optout")
            .join("broker_configs");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create config store at {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let slug: String = name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("{slug}.json"))
    }
}

impl ConfigStore for FsConfigStore {
    fn get(&self, name: &str) -> Result<Option<BrokerConfig>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt stored config {}", path.display()))?;
        Ok(Some(config))
    }

    fn create_if_absent(&self, config: &BrokerConfig) -> Result<PromotionOutcome> {
        std::fs::create_dir_all(&self.dir)?;
        let existing = self.get(&config.name)?;
        let outcome = match &existing {
            Some(stored) if stored.is_full() => return Ok(PromotionOutcome::SkippedExistingFull),
            Some(_) => PromotionOutcome::Upgraded,
            None => PromotionOutcome::Created,
        };

        let path = self.path_for(&config.name);
        let staged = self
            .dir
            .join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let body = serde_json::to_string_pretty(config)?;
        std::fs::write(&staged, body)
            .with_context(|| format!("cannot stage config write {}", staged.display()))?;
        std::fs::rename(&staged, &path)
            .with_context(|| format!("cannot install config at {}", path.display()))?;
        Ok(outcome)
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryConfigStore {
    configs: Mutex<BTreeMap<String, BrokerConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an existing config.
    pub fn with(config: BrokerConfig) -> Self {
        let store = Self::new();
        store
            .configs
            .lock()
            .unwrap()
            .insert(config.name.clone(), config);
        store
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, name: &str) -> Result<Option<BrokerConfig>> {
        Ok(self.configs.lock().unwrap().get(name).cloned())
    }

    fn create_if_absent(&self, config: &BrokerConfig) -> Result<PromotionOutcome> {
        let mut map = self.configs.lock().unwrap();
        let outcome = match map.get(&config.name) {
            Some(stored) if stored.is_full() => return Ok(PromotionOutcome::SkippedExistingFull),
            Some(_) => PromotionOutcome::Upgraded,
            None => PromotionOutcome::Created,
        };
        map.insert(config.name.clone(), config.clone());
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FormConfig, SubmissionSpec};
    use serde_json::json;

    fn full_config(name: &str) -> BrokerConfig {
        BrokerConfig {
            name: name.to_string(),
            kind: "web_form".into(),
            url: format!("https://{}.example.com/privacy", name.to_lowercase()),
            email_domains: vec![format!("{}.com", name.to_lowercase())],
            form_config: Some(FormConfig {
                submission: Some(SubmissionSpec {
                    method: "POST".into(),
                    endpoint: "https://api.example.com/request".into(),
                    payload_template: json!({"email": "{email}"}),
                    ..SubmissionSpec::default()
                }),
                ..FormConfig::default()
            }),
            generated: None,
        }
    }

    fn minimal_config(name: &str) -> BrokerConfig {
        BrokerConfig {
            name: name.to_string(),
            kind: "web_form".into(),
            url: format!("https://{}.example.com/privacy", name.to_lowercase()),
            email_domains: vec![],
            form_config: None,
            generated: None,
        }
    }

    #[test]
    fn fs_store_round_trips_a_new_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());
        let outcome = store.create_if_absent(&full_config("NewBroker")).unwrap();
        assert_eq!(outcome, PromotionOutcome::Created);

        let loaded = store.get("NewBroker").unwrap().unwrap();
        assert!(loaded.is_full());
        // Reloaded config routes deterministic from now on.
        assert!(matches!(
            crate::config::select(&loaded).unwrap(),
            crate::config::SubmissionPlan::Deterministic(_)
        ));
    }

    #[test]
    fn promotion_is_a_noop_on_existing_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());
        let original = full_config("Acxiom");
        store.create_if_absent(&original).unwrap();

        let mut replacement = full_config("Acxiom");
        replacement.url = "https://changed.example.com".into();
        let outcome = promote(&store, &replacement).unwrap();
        assert_eq!(outcome, PromotionOutcome::SkippedExistingFull);

        // Store content unchanged.
        let stored = store.get("Acxiom").unwrap().unwrap();
        assert_eq!(stored.url, original.url);
    }

    #[test]
    fn minimal_stored_config_is_upgraded() {
        let store = MemoryConfigStore::with(minimal_config("NewBroker"));
        let outcome = promote(&store, &full_config("NewBroker")).unwrap();
        assert_eq!(outcome, PromotionOutcome::Upgraded);
        assert!(store.get("NewBroker").unwrap().unwrap().is_full());
    }

    #[test]
    fn fs_store_leaves_no_staging_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());
        store.create_if_absent(&full_config("NewBroker")).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn broker_names_are_slugged_for_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());
        store
            .create_if_absent(&full_config("Whitepages Inc."))
            .unwrap();
        assert!(dir.path().join("whitepages_inc_.json").exists());
    }
}
