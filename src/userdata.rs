//! Canonical user record and per-broker data preparation.
//!
//! The canonical `UserData` record is never mutated. `prepare()` produces a
//! broker-specific string view with the state rendered the way the broker's
//! config declares (2-letter abbreviation or full name) and the date of birth
//! normalized to `MM/DD/YYYY`.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::StateFormat;
use crate::error::{BrokerError, BrokerResult};

/// Canonical user-data keys that templates and AI mappings may target.
pub const CANONICAL_KEYS: &[&str] = &[
    "first_name",
    "last_name",
    "email",
    "date_of_birth",
    "address",
    "city",
    "state",
    "zip",
];

/// US state code → full name table (50 states + DC).
const STATES: &[(&str, &str)] = &[
    ("AL", "Alabama"),
    ("AK", "Alaska"),
    ("AZ", "Arizona"),
    ("AR", "Arkansas"),
    ("CA", "California"),
    ("CO", "Colorado"),
    ("CT", "Connecticut"),
    ("DE", "Delaware"),
    ("FL", "Florida"),
    ("GA", "Georgia"),
    ("HI", "Hawaii"),
    ("ID", "Idaho"),
    ("IL", "Illinois"),
    ("IN", "Indiana"),
    ("IA", "Iowa"),
    ("KS", "Kansas"),
    ("KY", "Kentucky"),
    ("LA", "Louisiana"),
    ("ME", "Maine"),
    ("MD", "Maryland"),
    ("MA", "Massachusetts"),
    ("MI", "Michigan"),
    ("MN", "Minnesota"),
    ("MS", "Mississippi"),
    ("MO", "Missouri"),
    ("MT", "Montana"),
    ("NE", "Nebraska"),
    ("NV", "Nevada"),
    ("NH", "New Hampshire"),
    ("NJ", "New Jersey"),
    ("NM", "New Mexico"),
    ("NY", "New York"),
    ("NC", "North Carolina"),
    ("ND", "North Dakota"),
    ("OH", "Ohio"),
    ("OK", "Oklahoma"),
    ("OR", "Oregon"),
    ("PA", "Pennsylvania"),
    ("RI", "Rhode Island"),
    ("SC", "South Carolina"),
    ("SD", "South Dakota"),
    ("TN", "Tennessee"),
    ("TX", "Texas"),
    ("UT", "Utah"),
    ("VT", "Vermont"),
    ("VA", "Virginia"),
    ("WA", "Washington"),
    ("WV", "West Virginia"),
    ("WI", "Wisconsin"),
    ("WY", "Wyoming"),
    ("DC", "District of Columbia"),
];

/// Canonical user record for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserData {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub date_of_birth: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

impl UserData {
    /// Produce the per-broker prepared view: every present field as a string,
    /// state rendered per `state_format`, DOB normalized to `MM/DD/YYYY`.
    ///
    /// The canonical record is untouched; each broker gets its own copy.
    pub fn prepare(&self, state_format: StateFormat) -> BrokerResult<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        out.insert("first_name".to_string(), self.first_name.clone());
        out.insert("last_name".to_string(), self.last_name.clone());
        out.insert("email".to_string(), self.email.clone());

        if let Some(dob) = &self.date_of_birth {
            out.insert("date_of_birth".to_string(), normalize_dob(dob)?);
        }
        if let Some(address) = &self.address {
            out.insert("address".to_string(), address.clone());
        }
        if let Some(city) = &self.city {
            out.insert("city".to_string(), city.clone());
        }
        if let Some(state) = &self.state {
            let code = normalize_state(state)?;
            let rendered = match state_format {
                StateFormat::Abbreviation => code.to_string(),
                StateFormat::Full => state_full_name(code)
                    .ok_or_else(|| BrokerError::UnknownState {
                        state: state.clone(),
                    })?
                    .to_string(),
            };
            out.insert("state".to_string(), rendered);
        }
        if let Some(zip) = &self.zip {
            out.insert("zip".to_string(), zip.clone());
        }
        Ok(out)
    }
}

/// Resolve user state input (code or full name, any case) to a 2-letter code.
pub fn normalize_state(input: &str) -> BrokerResult<&'static str> {
    let trimmed = input.trim();
    let upper = trimmed.to_uppercase();
    if let Some((code, _)) = STATES.iter().find(|(code, _)| *code == upper) {
        return Ok(code);
    }
    if let Some((code, _)) = STATES
        .iter()
        .find(|(_, name)| name.eq_ignore_ascii_case(trimmed))
    {
        return Ok(code);
    }
    // DC variations the original accepted.
    match upper.as_str() {
        "WASHINGTON DC" | "WASHINGTON D.C." | "D.C." => Ok("DC"),
        _ => Err(BrokerError::UnknownState {
            state: trimmed.to_string(),
        }),
    }
}

/// Full name for a 2-letter state code, if known.
pub fn state_full_name(code: &str) -> Option<&'static str> {
    STATES
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(code))
        .map(|(_, name)| *name)
}

/// Validate and normalize a date of birth to `MM/DD/YYYY`.
///
/// Broker-specific date formats are not supported; brokers needing another
/// shape must express it in their payload template.
pub fn normalize_dob(input: &str) -> BrokerResult<String> {
    let parsed = NaiveDate::parse_from_str(input.trim(), "%m/%d/%Y").map_err(|_| {
        BrokerError::Config(format!(
            "date of birth '{input}' must be in MM/DD/YYYY format"
        ))
    })?;
    if parsed > chrono::Local::now().date_naive() {
        return Err(BrokerError::Config(format!(
            "date of birth '{input}' is in the future"
        )));
    }
    Ok(parsed.format("%m/%d/%Y").to_string())
}
