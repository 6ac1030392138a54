//! Data models module
//!
//! Defines core data structures: the ingested SecurityEvent, the oracle's
//! TriageVerdict and the TriageRecord persisted to the result store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Column order of the result store. Dashboards depend on this exact header.
pub const RECORD_COLUMNS: [&str; 8] = [
    "timestamp",
    "rule",
    "priority",
    "details",
    "ai_decision",
    "mitre_tactic",
    "mitre_technique",
    "remediation",
];

/// One ingested Falco-style alert
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityEvent {
    /// Source-relative identifier (file name, or `file:line` for JSON-lines input)
    pub event_id: String,
    /// Event time as reported by the source (`time`)
    pub timestamp: String,
    /// Detection rule that fired (`rule`)
    pub rule: String,
    /// Source-reported severity (`priority`)
    pub priority: String,
    /// Free-text description (`output`)
    pub details: String,
    /// Original document, kept for audit and sent to the oracle
    pub raw: Value,
}

impl SecurityEvent {
    /// Build an event from a parsed document.
    ///
    /// Returns the reason the document is not a security event record when a
    /// required field is missing or not a string.
    pub fn from_document(event_id: impl Into<String>, raw: Value) -> Result<Self, String> {
        let object = raw
            .as_object()
            .ok_or_else(|| "document is not a JSON object".to_string())?;

        let field = |name: &str| {
            object
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| format!("missing string field '{}'", name))
        };

        let timestamp = field("time")?;
        let rule = field("rule")?;
        let priority = field("priority")?;
        let details = field("output")?;

        Ok(Self {
            event_id: event_id.into(),
            timestamp,
            rule,
            priority,
            details,
            raw,
        })
    }

    /// Pretty-printed original document, as handed to the oracle
    pub fn oracle_payload(&self) -> String {
        serde_json::to_string_pretty(&self.raw).unwrap_or_else(|_| self.raw.to_string())
    }
}

/// Threat level assigned by the oracle, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl ThreatLevel {
    pub const ALL: [ThreatLevel; 4] = [
        ThreatLevel::Critical,
        ThreatLevel::High,
        ThreatLevel::Medium,
        ThreatLevel::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Critical => "CRITICAL",
            ThreatLevel::High => "HIGH",
            ThreatLevel::Medium => "MEDIUM",
            ThreatLevel::Low => "LOW",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreatLevel {
    type Err = String;

    /// Exact, case-sensitive match against the wire names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ThreatLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| format!("unknown threat level '{}'", s))
    }
}

/// Structured judgment for one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageVerdict {
    pub threat_level: ThreatLevel,
    pub mitre_tactic: String,
    pub mitre_technique: String,
    pub remediation_summary: String,
}

/// Accepted oracle output after validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Full TriageVerdict JSON (preferred mode)
    Structured(TriageVerdict),
    /// Bare severity token in free text (legacy mode)
    SeverityOnly(ThreatLevel),
}

impl Verdict {
    pub fn threat_level(&self) -> ThreatLevel {
        match self {
            Verdict::Structured(verdict) => verdict.threat_level,
            Verdict::SeverityOnly(level) => *level,
        }
    }
}

/// Unit of durable storage: the event projection paired with its verdict.
///
/// Field order is the store's column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageRecord {
    pub timestamp: String,
    pub rule: String,
    pub priority: String,
    pub details: String,
    pub ai_decision: String,
    pub mitre_tactic: String,
    pub mitre_technique: String,
    pub remediation: String,
}

impl TriageRecord {
    pub fn new(event: &SecurityEvent, verdict: &Verdict) -> Self {
        let (mitre_tactic, mitre_technique, remediation) = match verdict {
            Verdict::Structured(v) => (
                v.mitre_tactic.clone(),
                v.mitre_technique.clone(),
                v.remediation_summary.clone(),
            ),
            Verdict::SeverityOnly(_) => (String::new(), String::new(), String::new()),
        };

        Self {
            timestamp: event.timestamp.clone(),
            rule: event.rule.clone(),
            priority: event.priority.clone(),
            details: event.details.clone(),
            ai_decision: verdict.threat_level().to_string(),
            mitre_tactic,
            mitre_technique,
            remediation,
        }
    }
}
