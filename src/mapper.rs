//! Constrained AI field mapper with a guardrail layer.
//!
//! The model proposes a mapping from discovered form fields to canonical
//! user-data keys. Its output is untrusted external input: source keys must
//! come from the supplied descriptor list, target keys from the canonical
//! set, mapped values must pass basic format checks, and no two sources may
//! share a target unless explicitly allow-listed. Any violation is rejected,
//! not coerced. Policy: at most one corrective retry, then the broker fails
//! with `InvalidMappingError`.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, warn};

use crate::browser::FieldDescriptor;
use crate::error::{BrokerError, BrokerResult};
use crate::llm::LlmClient;
use crate::userdata::{normalize_dob, normalize_state, CANONICAL_KEYS};

const VALID_FIELD_TYPES: &[&str] = &["text", "select", "autocomplete", "textarea", "option"];

/// Targets a broker form is expected to collect; absence from a proposal is
/// flagged (logged and recorded), never silently dropped.
const EXPECTED_TARGETS: &[&str] = &["first_name", "last_name", "email"];

/// One validated mapping entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedField {
    /// Canonical user-data key this field receives.
    pub target: String,
    /// text | select | autocomplete | textarea | option.
    pub field_type: String,
}

/// A validated field-mapping proposal. Transient: only persisted through
/// config promotion after the review checkpoint.
#[derive(Debug, Clone, Default)]
pub struct FieldMappingProposal {
    /// Discovered field id → mapping.
    pub fields: BTreeMap<String, MappedField>,
    /// Expected canonical targets the proposal did not cover.
    pub missing_targets: Vec<String>,
}

impl FieldMappingProposal {
    /// Field id → concrete value, ready for the browser fill.
    pub fn fill_values(
        &self,
        prepared: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .filter_map(|(id, m)| {
                prepared
                    .get(&m.target)
                    .map(|v| (id.clone(), v.clone()))
            })
            .collect()
    }

    /// Field id → canonical key, the shape promotion persists.
    pub fn as_config_mappings(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .map(|(id, m)| (id.clone(), m.target.clone()))
            .collect()
    }
}

/// Guardrail policy for one proposal.
#[derive(Debug, Clone, Default)]
pub struct MapperPolicy {
    /// Canonical targets allowed to appear more than once (e.g. `email`
    /// when the form has a confirm-email field).
    pub allow_duplicate_targets: BTreeSet<String>,
}

/// Mapper over an injected LLM collaborator.
pub struct ConstrainedMapper<'a> {
    llm: &'a dyn LlmClient,
}

impl<'a> ConstrainedMapper<'a> {
    pub fn new(llm: &'a dyn LlmClient) -> Self {
        Self { llm }
    }

    /// Propose and validate a mapping for one broker form.
    ///
    /// Actual user values never reach the model; the prompt carries the
    /// canonical key names only. One corrective retry on a guardrail
    /// violation, then `InvalidMappingError`.
    pub async fn propose(
        &self,
        broker: &str,
        descriptors: &[FieldDescriptor],
        prepared: &BTreeMap<String, String>,
        policy: &MapperPolicy,
    ) -> BrokerResult<FieldMappingProposal> {
        let prompt = build_prompt(broker, descriptors, prepared);
        let mut last_violation = String::new();

        for attempt in 0..2 {
            let full_prompt = if attempt == 0 {
                prompt.clone()
            } else {
                format!(
                    "{prompt}\n\nYour previous answer was rejected: {last_violation}. \
                     Correct it and return ONLY valid JSON."
                )
            };

            let raw = self.llm.complete(&full_prompt).await.map_err(|e| {
                BrokerError::Collaborator {
                    stage: "field mapping",
                    detail: format!("{e:#}"),
                }
            })?;

            match parse_response(&raw)
                .and_then(|v| validate_proposal(&v, descriptors, prepared, policy))
            {
                Ok(proposal) => {
                    debug!(
                        broker,
                        fields = proposal.fields.len(),
                        "field mapping validated"
                    );
                    return Ok(proposal);
                }
                Err(violation) => {
                    warn!(broker, attempt, %violation, "mapping proposal rejected");
                    last_violation = violation;
                }
            }
        }

        Err(BrokerError::InvalidMapping(format!(
            "{broker}: {last_violation}"
        )))
    }
}

fn build_prompt(
    broker: &str,
    descriptors: &[FieldDescriptor],
    prepared: &BTreeMap<String, String>,
) -> String {
    let fields_json = serde_json::to_string_pretty(descriptors).unwrap_or_default();
    // Placeholder names only; never the values.
    let keys: Vec<&str> = prepared.keys().map(|k| k.as_str()).collect();
    format!(
        "You are a form analysis expert. Map form fields to user data keys for {broker}.\n\
         \n\
         STRICT RULES:\n\
         1. Return ONLY valid JSON, no explanations, no markdown.\n\
         2. Use exact field ids from the form analysis.\n\
         3. Map only to user data keys that exist.\n\
         4. Include the field type (text/select/autocomplete/textarea).\n\
         5. Only include confident mappings; return {{}} if none.\n\
         \n\
         Form fields:\n{fields_json}\n\
         \n\
         User data keys:\n{}\n\
         \n\
         Return exactly this JSON shape:\n\
         {{\"<field_id>\": {{\"user_data_key\": \"first_name\", \"field_type\": \"text\"}}}}",
        serde_json::to_string(&keys).unwrap_or_default()
    )
}

/// Strip markdown code fences and parse the model output as JSON.
fn parse_response(raw: &str) -> Result<Value, String> {
    let mut text = raw.trim();
    if text.starts_with("```") {
        text = text.trim_start_matches("```json").trim_start_matches("```");
        if let Some(end) = text.rfind("```") {
            text = &text[..end];
        }
        text = text.trim();
    }
    serde_json::from_str(text).map_err(|e| format!("response is not valid JSON: {e}"))
}

/// Apply every guardrail to a raw proposal. Returns the violation text on
/// the first failure so the corrective prompt can quote it.
pub fn validate_proposal(
    raw: &Value,
    descriptors: &[FieldDescriptor],
    prepared: &BTreeMap<String, String>,
    policy: &MapperPolicy,
) -> Result<FieldMappingProposal, String> {
    let map = raw
        .as_object()
        .ok_or_else(|| "proposal must be a JSON object".to_string())?;

    let known_ids: BTreeSet<&str> = descriptors.iter().map(|d| d.id.as_str()).collect();
    let canonical: BTreeSet<&str> = CANONICAL_KEYS.iter().copied().collect();

    let mut fields: BTreeMap<String, MappedField> = BTreeMap::new();
    let mut seen_targets: BTreeMap<String, String> = BTreeMap::new();

    for (field_id, entry) in map {
        // Closed source set: the field must exist on the form.
        if !known_ids.contains(field_id.as_str()) {
            return Err(format!("field '{field_id}' does not exist on the form"));
        }
        let target = entry["user_data_key"]
            .as_str()
            .ok_or_else(|| format!("field '{field_id}' is missing user_data_key"))?;

        // Closed target set: canonical keys only, and only ones we hold data for.
        if !canonical.contains(target) {
            return Err(format!(
                "'{target}' is not a canonical user-data key (field '{field_id}')"
            ));
        }
        let value = prepared.get(target).ok_or_else(|| {
            format!("no user data available for '{target}' (field '{field_id}')")
        })?;

        let field_type = entry["field_type"].as_str().unwrap_or("text");
        if !VALID_FIELD_TYPES.contains(&field_type) {
            return Err(format!(
                "invalid field type '{field_type}' for field '{field_id}'"
            ));
        }

        // Duplicate targets need an explicit allowance (confirm-email etc.).
        if let Some(prior) = seen_targets.get(target) {
            if !policy.allow_duplicate_targets.contains(target) {
                return Err(format!(
                    "fields '{prior}' and '{field_id}' both map to '{target}'"
                ));
            }
        }
        seen_targets.insert(target.to_string(), field_id.clone());

        // Basic format check on the value the field would receive.
        check_format(target, value)?;

        fields.insert(
            field_id.clone(),
            MappedField {
                target: target.to_string(),
                field_type: field_type.to_string(),
            },
        );
    }

    let mapped_targets: BTreeSet<&str> = fields.values().map(|m| m.target.as_str()).collect();
    let missing_targets: Vec<String> = EXPECTED_TARGETS
        .iter()
        .filter(|t| prepared.contains_key(**t) && !mapped_targets.contains(**t))
        .map(|t| t.to_string())
        .collect();
    for t in &missing_targets {
        warn!(target = %t, "expected canonical field missing from proposal");
    }

    Ok(FieldMappingProposal {
        fields,
        missing_targets,
    })
}

fn check_format(target: &str, value: &str) -> Result<(), String> {
    match target {
        "email" => {
            if !value.contains('@') {
                return Err(format!("email value '{value}' has no '@'"));
            }
        }
        "zip" => {
            let digits = value.chars().filter(|c| c.is_ascii_digit()).count();
            if !(5..=9).contains(&digits) {
                return Err(format!("zip value '{value}' is not a plausible ZIP code"));
            }
        }
        "state" => {
            if normalize_state(value).is_err() {
                return Err(format!("state value '{value}' is not a known state"));
            }
        }
        "date_of_birth" => {
            if normalize_dob(value).is_err() {
                return Err(format!("date of birth '{value}' is not MM/DD/YYYY"));
            }
        }
        _ => {}
    }
    Ok(())
}
