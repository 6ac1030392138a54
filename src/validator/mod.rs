//! Verdict validation
//!
//! Sole trust boundary for oracle output. Raw text is stripped of incidental
//! formatting, parsed and checked against the verdict schema; nothing
//! downstream sees oracle output that has not passed through here.

use regex::Regex;
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::LazyLock;

use crate::error::ValidationError;
use crate::models::{ThreatLevel, TriageVerdict, Verdict};

/// MITRE ATT&CK technique ID, optionally with a sub-technique suffix
static TECHNIQUE_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^T\d{4}(\.\d{3})?$").expect("TECHNIQUE_ID_REGEX pattern is valid")
});

/// Whole-word severity token for legacy free-text output
static SEVERITY_TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(CRITICAL|HIGH|MEDIUM|LOW)\b").expect("SEVERITY_TOKEN_REGEX pattern is valid")
});

/// Output format the oracle was asked to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleMode {
    /// Full TriageVerdict JSON object
    Structured,
    /// A single severity word in free text
    Legacy,
}

impl FromStr for OracleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "structured" | "json" => Ok(OracleMode::Structured),
            "legacy" | "token" => Ok(OracleMode::Legacy),
            other => Err(format!(
                "unknown oracle mode '{}' (expected 'structured' or 'legacy')",
                other
            )),
        }
    }
}

/// Validate raw oracle output for the given mode
pub fn validate(raw: &str, mode: OracleMode) -> Result<Verdict, ValidationError> {
    match mode {
        OracleMode::Structured => validate_structured(raw).map(Verdict::Structured),
        OracleMode::Legacy => validate_severity_token(raw).map(Verdict::SeverityOnly),
    }
}

/// Parse and check a structured TriageVerdict
pub fn validate_structured(raw: &str) -> Result<TriageVerdict, ValidationError> {
    let body = strip_wrapping(raw);
    if body.is_empty() {
        return Err(ValidationError::new("empty output", raw));
    }

    let value: Value = serde_json::from_str(body)
        .map_err(|err| ValidationError::new(format!("not valid JSON: {}", err), raw))?;
    let object = value
        .as_object()
        .ok_or_else(|| ValidationError::new("expected a single JSON object", raw))?;

    let threat_level = required_str(object, "threat_level", raw)?;
    let mitre_tactic = required_str(object, "mitre_tactic", raw)?;
    let mitre_technique = required_str(object, "mitre_technique", raw)?;
    let remediation_summary = required_str(object, "remediation_summary", raw)?;

    let threat_level = ThreatLevel::from_str(threat_level)
        .map_err(|err| ValidationError::new(err, raw))?;

    if !TECHNIQUE_ID_REGEX.is_match(mitre_technique) {
        return Err(ValidationError::new(
            format!("malformed mitre_technique '{}'", mitre_technique),
            raw,
        ));
    }
    if mitre_tactic.is_empty() {
        return Err(ValidationError::new("mitre_tactic is empty", raw));
    }
    if remediation_summary.is_empty() {
        return Err(ValidationError::new("remediation_summary is empty", raw));
    }

    Ok(TriageVerdict {
        threat_level,
        mitre_tactic: mitre_tactic.to_string(),
        mitre_technique: mitre_technique.to_string(),
        remediation_summary: remediation_summary.to_string(),
    })
}

/// Extract the single severity word from free text.
///
/// The text must name exactly one distinct level; "HIGH or CRITICAL" is
/// ambiguous and rejected.
pub fn validate_severity_token(raw: &str) -> Result<ThreatLevel, ValidationError> {
    let body = strip_wrapping(raw);

    let mut found: Option<ThreatLevel> = None;
    for token in SEVERITY_TOKEN_REGEX.find_iter(body) {
        let level = ThreatLevel::from_str(token.as_str())
            .map_err(|err| ValidationError::new(err, raw))?;
        match found {
            None => found = Some(level),
            Some(previous) if previous == level => {}
            Some(previous) => {
                return Err(ValidationError::new(
                    format!("ambiguous severity: both {} and {}", previous, level),
                    raw,
                ));
            }
        }
    }

    found.ok_or_else(|| ValidationError::new("no severity token found", raw))
}

/// Remove surrounding whitespace and a fenced code block wrapper.
///
/// Handles "```json\n{...}\n```" as well as a lone leading or trailing fence.
pub fn strip_wrapping(raw: &str) -> &str {
    let mut body = raw.trim();

    if let Some(rest) = body.strip_prefix("```") {
        // Drop the optional language tag on the opening fence line
        body = match rest.find('\n') {
            Some(newline) if is_fence_tag(&rest[..newline]) => &rest[newline + 1..],
            None if is_fence_tag(rest) => "",
            _ => rest,
        };
    }
    if let Some(rest) = body.trim_end().strip_suffix("```") {
        body = rest;
    }

    body.trim()
}

fn is_fence_tag(candidate: &str) -> bool {
    candidate
        .trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn required_str<'a>(
    object: &'a Map<String, Value>,
    field: &str,
    raw: &str,
) -> Result<&'a str, ValidationError> {
    match object.get(field) {
        Some(Value::String(value)) => Ok(value.trim()),
        Some(_) => Err(ValidationError::new(
            format!("field '{}' is not a string", field),
            raw,
        )),
        None => Err(ValidationError::new(
            format!("missing field '{}'", field),
            raw,
        )),
    }
}
