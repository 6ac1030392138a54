//! Classification oracle adapter
//!
//! The pipeline only sees the one-method `Oracle` trait, so a local model,
//! a hosted API and test fakes are interchangeable.

pub mod http;

use async_trait::async_trait;

use crate::error::OracleError;
use crate::models::SecurityEvent;
use crate::validator::OracleMode;

pub use http::HttpOracle;

/// Unvalidated oracle output. May carry formatting noise such as code fences.
pub type RawOracleOutput = String;

#[async_trait]
pub trait Oracle: Send + Sync {
    /// Classify one event. Implementations must not retry internally.
    async fn classify(&self, event: &SecurityEvent) -> Result<RawOracleOutput, OracleError>;
}

const SYSTEM_PROMPT: &str = "You are an expert cybersecurity analyst triaging runtime security alerts.";

const LEGACY_INSTRUCTIONS: &str = "Based on the log data, classify the threat level. \
Respond with only ONE of the following words: CRITICAL, HIGH, MEDIUM, or LOW.";

const STRUCTURED_INSTRUCTIONS: &str = "Based on the log data, respond with a single JSON object \
and nothing else, using exactly these keys:\n\
  \"threat_level\": one of \"CRITICAL\", \"HIGH\", \"MEDIUM\", \"LOW\"\n\
  \"mitre_tactic\": the MITRE ATT&CK tactic name\n\
  \"mitre_technique\": the MITRE ATT&CK technique ID (e.g. T1059 or T1059.004)\n\
  \"remediation_summary\": one or two sentences on how to respond";

/// User prompt carrying the pretty-printed event for the requested mode
pub fn build_prompt(event: &SecurityEvent, mode: OracleMode) -> String {
    let instructions = match mode {
        OracleMode::Structured => STRUCTURED_INSTRUCTIONS,
        OracleMode::Legacy => LEGACY_INSTRUCTIONS,
    };

    format!(
        "Analyze the security log below and classify its threat level.\n\
         The log data is provided in JSON format.\n\n\
         Log Data:\n{}\n\n{}",
        event.oracle_payload(),
        instructions
    )
}

pub fn system_prompt() -> &'static str {
    SYSTEM_PROMPT
}
