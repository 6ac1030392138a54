//! Pending event enumeration
//!
//! Reads Falco alert documents from a single input directory. Bad entries
//! are logged and skipped; only an unreadable directory fails the listing.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::EnumerationError;
use crate::models::SecurityEvent;

const TARGET_SOURCE: &str = "source";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentFormat {
    /// One JSON object per file
    Single,
    /// One JSON object per line (Falco `json_output` files)
    Lines,
}

fn document_format(path: &Path) -> Option<DocumentFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "json" => Some(DocumentFormat::Single),
        "jsonl" | "ndjson" => Some(DocumentFormat::Lines),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct DirectorySource {
    directory: PathBuf,
}

impl DirectorySource {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// List every well-formed event in file-name order.
    ///
    /// Reads only; calling it twice on an unchanged directory gives the same
    /// events in the same order.
    pub fn list_pending(&self) -> Result<Vec<SecurityEvent>, EnumerationError> {
        let dir_error = |source| EnumerationError::Directory {
            path: self.directory.clone(),
            source,
        };

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.directory).map_err(dir_error)? {
            let entry = entry.map_err(dir_error)?;
            let path = entry.path();

            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden || !path.is_file() {
                continue;
            }
            if let Some(format) = document_format(&path) {
                files.push((path, format));
            } else {
                debug!(target: TARGET_SOURCE, path = ?path, "Ignoring non-JSON file");
            }
        }
        files.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));

        let mut events = Vec::new();
        let mut skipped = 0usize;
        for (path, format) in &files {
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();

            let text = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) => {
                    warn!(target: TARGET_SOURCE, path = ?path, error = %err, "Skipping unreadable file");
                    skipped += 1;
                    continue;
                }
            };

            match format {
                DocumentFormat::Single => {
                    match parse_event(file_name.clone(), text.trim_start_matches('\u{feff}')) {
                        Ok(event) => events.push(event),
                        Err(reason) => {
                            warn!(target: TARGET_SOURCE, event_id = %file_name, %reason, "Skipping event");
                            skipped += 1;
                        }
                    }
                }
                DocumentFormat::Lines => {
                    for (index, line) in text.lines().enumerate() {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let event_id = format!("{}:{}", file_name, index + 1);
                        match parse_event(event_id.clone(), line) {
                            Ok(event) => events.push(event),
                            Err(reason) => {
                                warn!(target: TARGET_SOURCE, %event_id, %reason, "Skipping event");
                                skipped += 1;
                            }
                        }
                    }
                }
            }
        }

        info!(
            target: TARGET_SOURCE,
            directory = ?self.directory,
            files = files.len(),
            events = events.len(),
            skipped,
            "Enumerated pending events"
        );
        Ok(events)
    }
}

fn parse_event(event_id: String, text: &str) -> Result<SecurityEvent, String> {
    let raw: Value =
        serde_json::from_str(text.trim()).map_err(|err| format!("invalid JSON: {}", err))?;
    SecurityEvent::from_document(event_id, raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ALERT: &str = r#"{"time":"t1","rule":"Terminal shell in container","priority":"Warning","output":"shell spawned"}"#;

    fn write(dir: &TempDir, name: &str, contents: &str) {
        fs::write(dir.path().join(name), contents).unwrap();
    }

    #[test]
    fn test_lists_events_in_file_name_order() {
        let dir = TempDir::new().unwrap();
        write(&dir, "b.json", &ALERT.replace("t1", "t2"));
        write(&dir, "a.json", ALERT);

        let events = DirectorySource::new(dir.path()).list_pending().unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, ["a.json", "b.json"]);
        assert_eq!(events[0].timestamp, "t1");
        assert_eq!(events[0].rule, "Terminal shell in container");
        assert_eq!(events[0].details, "shell spawned");
        assert_eq!(events[1].timestamp, "t2");
    }

    #[test]
    fn test_skips_bad_entries() {
        let dir = TempDir::new().unwrap();
        write(&dir, "good.json", ALERT);
        write(&dir, "garbage.json", "not json at all");
        write(&dir, "array.json", "[1, 2, 3]");
        write(&dir, "missing.json", r#"{"time":"t1","rule":"r","priority":"p"}"#);
        write(&dir, "notes.txt", ALERT);
        write(&dir, ".hidden.json", ALERT);
        fs::create_dir(dir.path().join("nested.json")).unwrap();

        let events = DirectorySource::new(dir.path()).list_pending().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, "good.json");
    }

    #[test]
    fn test_json_lines_file() {
        let dir = TempDir::new().unwrap();
        let contents = format!("{}\n\n{{broken\n{}\n", ALERT, ALERT.replace("t1", "t9"));
        write(&dir, "falco_events.jsonl", &contents);

        let events = DirectorySource::new(dir.path()).list_pending().unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, ["falco_events.jsonl:1", "falco_events.jsonl:4"]);
        assert_eq!(events[1].timestamp, "t9");
    }

    #[test]
    fn test_enumeration_is_repeatable() {
        let dir = TempDir::new().unwrap();
        write(&dir, "one.json", ALERT);
        write(&dir, "two.ndjson", &format!("{}\n{}\n", ALERT, ALERT));

        let source = DirectorySource::new(dir.path());
        let first = source.list_pending().unwrap();
        let second = source.list_pending().unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let source = DirectorySource::new(dir.path().join("absent"));
        assert!(matches!(
            source.list_pending(),
            Err(EnumerationError::Directory { .. })
        ));
    }

    #[test]
    fn test_raw_document_retained() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "e.json",
            r#"{"time":"t1","rule":"r","priority":"Notice","output":"o","output_fields":{"proc.name":"bash"}}"#,
        );

        let events = DirectorySource::new(dir.path()).list_pending().unwrap();
        assert_eq!(events[0].raw["output_fields"]["proc.name"], "bash");
    }
}
