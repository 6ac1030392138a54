//! Append-only result store
//!
//! Persists one CSV line per triaged event under a fixed header. Every
//! append and count runs inside one exclusive section, so readers never
//! observe a partially written record. `StoreView` gives the metrics
//! exporter a read-only view of the same file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::{TriageRecord, RECORD_COLUMNS};

const TARGET_STORE: &str = "store";

/// Read access to the number of complete records in a store
pub trait RecordCounter: Send + Sync {
    fn count(&self) -> Result<u64, StoreError>;
}

/// Write access used by the triage pipeline
pub trait RecordSink: Send + Sync {
    fn path(&self) -> &Path;
    fn append(&self, record: &TriageRecord) -> Result<u64, StoreError>;
    fn reopen(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Sync each record to disk before `append` returns
    pub fsync: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { fsync: true }
    }
}

struct StoreInner {
    file: File,
    /// Byte length of the file, all of it complete records
    len: u64,
    /// Records currently persisted (header excluded)
    records: u64,
    /// A failed write left bytes that could not be rolled back. Appends
    /// are refused until `reopen` truncates them.
    torn: bool,
}

/// Writable handle to the result store, shared by pipeline workers
pub struct ResultStore {
    path: PathBuf,
    options: StoreOptions,
    inner: Mutex<StoreInner>,
}

impl ResultStore {
    /// Open the store, creating it with its header if it does not exist.
    ///
    /// An existing store must carry the expected header. A torn record at
    /// the end of the file (left by an interrupted write) is truncated.
    /// Complete lines that do not parse as records are kept but not counted.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let inner = prepare(&path)?;

        info!(
            target: TARGET_STORE,
            path = ?path,
            records = inner.records,
            "Result store opened"
        );

        Ok(Self {
            path,
            options,
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one record. Returns its sequence number (0-based).
    pub fn append(&self, record: &TriageRecord) -> Result<u64, StoreError> {
        let line = encode_record(record).map_err(|err| StoreError::WriteFailed {
            path: self.path.clone(),
            reason: format!("encode: {}", err),
        })?;

        let mut inner = self.lock();
        if inner.torn {
            return Err(StoreError::WriteFailed {
                path: self.path.clone(),
                reason: "partial record from an earlier failure is still present".to_string(),
            });
        }
        let sequence = inner.records;
        let previous_len = inner.len;

        let written = inner.file.write_all(&line).and_then(|()| {
            if self.options.fsync {
                inner.file.sync_data()
            } else {
                Ok(())
            }
        });

        if let Err(err) = written {
            // Drop whatever part of the line reached the file
            if let Err(truncate_err) = inner.file.set_len(previous_len) {
                warn!(
                    target: TARGET_STORE,
                    error = %truncate_err,
                    "Failed to roll back partial record"
                );
                inner.torn = true;
            }
            return Err(StoreError::WriteFailed {
                path: self.path.clone(),
                reason: err.to_string(),
            });
        }

        inner.len += line.len() as u64;
        inner.records += 1;
        debug!(target: TARGET_STORE, sequence, "Record appended");
        Ok(sequence)
    }

    /// Number of complete records persisted
    pub fn records(&self) -> u64 {
        self.lock().records
    }

    /// Reacquire the file handle after a write failure.
    ///
    /// Fails when the store cannot be opened at all, which the pipeline
    /// treats as the store being permanently unavailable.
    pub fn reopen(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        *inner = prepare(&self.path)?;
        info!(
            target: TARGET_STORE,
            path = ?self.path,
            records = inner.records,
            "Result store reopened"
        );
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // Counters only change after a completed write
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordCounter for ResultStore {
    fn count(&self) -> Result<u64, StoreError> {
        Ok(self.records())
    }
}

impl RecordSink for ResultStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &TriageRecord) -> Result<u64, StoreError> {
        ResultStore::append(self, record)
    }

    fn reopen(&self) -> Result<(), StoreError> {
        ResultStore::reopen(self)
    }
}

/// Read-only view of a store file, for an exporter running apart from the
/// process that writes the store. A missing file holds zero records.
#[derive(Debug, Clone)]
pub struct StoreView {
    path: PathBuf,
}

impl StoreView {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordCounter for StoreView {
    fn count(&self) -> Result<u64, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(StoreError::Unavailable {
                    path: self.path.clone(),
                    source: err,
                })
            }
        };

        let scan = scan_records(&bytes).map_err(|source| StoreError::Unavailable {
            path: self.path.clone(),
            source,
        })?;
        if let HeaderState::Mismatch(found) = scan.header {
            return Err(StoreError::SchemaMismatch {
                path: self.path.clone(),
                found,
            });
        }
        Ok(scan.records)
    }
}

enum HeaderState {
    /// No complete header line yet
    Missing,
    Valid,
    Mismatch(String),
}

struct Scan {
    header: HeaderState,
    records: u64,
    /// Complete lines with the wrong number of fields
    malformed: u64,
    /// Byte length covered by complete lines
    complete_len: u64,
}

/// Walk the file and count complete records.
///
/// A line is complete when it is newline-terminated and has balanced
/// quotes; it is a record when it also carries every column. Only the
/// torn tail after the last complete line is left out of `complete_len`.
fn scan_records(bytes: &[u8]) -> io::Result<Scan> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut record = csv::ByteRecord::new();
    let mut scan = Scan {
        header: HeaderState::Missing,
        records: 0,
        malformed: 0,
        complete_len: 0,
    };

    loop {
        let start = reader.position().byte() as usize;
        let more = reader
            .read_byte_record(&mut record)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        if !more {
            break;
        }
        let end = (reader.position().byte() as usize).min(bytes.len());
        let span = &bytes[start..end];

        let terminated = span.ends_with(b"\n");
        let balanced = span.iter().filter(|&&b| b == b'"').count() % 2 == 0;
        if !terminated || !balanced {
            // An open quote runs to the end of input, so this is the tail
            break;
        }

        match scan.header {
            HeaderState::Missing => {
                let matches = record
                    .iter()
                    .eq(RECORD_COLUMNS.iter().map(|column| column.as_bytes()));
                if !matches {
                    break;
                }
                scan.header = HeaderState::Valid;
            }
            _ if record.len() != RECORD_COLUMNS.len() => scan.malformed += 1,
            _ => scan.records += 1,
        }
        scan.complete_len = end as u64;
    }

    if matches!(scan.header, HeaderState::Missing) && !bytes.is_empty() {
        // Only our own header cut short before its newline is a torn write
        let line_end = bytes.iter().position(|&b| b == b'\n');
        let first = String::from_utf8_lossy(&bytes[..line_end.unwrap_or(bytes.len())])
            .trim_end()
            .to_string();
        let blank = bytes.iter().all(|b| b.is_ascii_whitespace());
        if !blank && (line_end.is_some() || !is_header_prefix(&first)) {
            scan.header = HeaderState::Mismatch(first);
        }
    }

    Ok(scan)
}

fn is_header_prefix(line: &str) -> bool {
    RECORD_COLUMNS.join(",").starts_with(line)
}

/// Open the file for appending, writing the header on first use and
/// truncating any torn tail.
fn prepare(path: &Path) -> Result<StoreInner, StoreError> {
    let unavailable = |source: io::Error| StoreError::Unavailable {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(unavailable)?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .map_err(unavailable)?;

    let bytes = fs::read(path).map_err(unavailable)?;
    let scan = scan_records(&bytes).map_err(unavailable)?;

    match scan.header {
        HeaderState::Mismatch(found) => {
            return Err(StoreError::SchemaMismatch {
                path: path.to_path_buf(),
                found,
            });
        }
        HeaderState::Missing => {
            if !bytes.is_empty() {
                warn!(
                    target: TARGET_STORE,
                    path = ?path,
                    bytes = bytes.len(),
                    "Discarding incomplete header"
                );
                file.set_len(0).map_err(unavailable)?;
            }
            let header = encode_header().map_err(unavailable)?;
            file.write_all(&header).map_err(unavailable)?;
            file.sync_data().map_err(unavailable)?;
            return Ok(StoreInner {
                file,
                len: header.len() as u64,
                records: 0,
                torn: false,
            });
        }
        HeaderState::Valid => {}
    }

    if scan.malformed > 0 {
        warn!(
            target: TARGET_STORE,
            path = ?path,
            malformed = scan.malformed,
            "Store contains lines that are not records, leaving them in place"
        );
    }

    if scan.complete_len < bytes.len() as u64 {
        warn!(
            target: TARGET_STORE,
            path = ?path,
            discarded_bytes = bytes.len() as u64 - scan.complete_len,
            "Truncating incomplete trailing record"
        );
        file.set_len(scan.complete_len).map_err(unavailable)?;
    }

    Ok(StoreInner {
        file,
        len: scan.complete_len,
        records: scan.records,
        torn: false,
    })
}

fn csv_writer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new())
}

fn encode_header() -> io::Result<Vec<u8>> {
    let mut writer = csv_writer();
    writer
        .write_record(RECORD_COLUMNS)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    writer.into_inner().map_err(|err| err.into_error())
}

fn encode_record(record: &TriageRecord) -> io::Result<Vec<u8>> {
    let mut writer = csv_writer();
    writer
        .serialize(record)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    writer.into_inner().map_err(|err| err.into_error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    const HEADER: &str =
        "timestamp,rule,priority,details,ai_decision,mitre_tactic,mitre_technique,remediation\n";

    fn make_store() -> (ResultStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path().join("results.csv"), StoreOptions::default())
            .unwrap();
        (store, dir)
    }

    fn make_record(rule: &str) -> TriageRecord {
        TriageRecord {
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            rule: rule.to_string(),
            priority: "Warning".to_string(),
            details: "shell spawned".to_string(),
            ai_decision: "HIGH".to_string(),
            mitre_tactic: "Execution".to_string(),
            mitre_technique: "T1059".to_string(),
            remediation: "Restrict exec in container".to_string(),
        }
    }

    #[test]
    fn test_new_store_has_header_only() {
        let (store, _dir) = make_store();
        assert_eq!(store.records(), 0);
        let content = fs::read_to_string(store.path()).unwrap();
        assert_eq!(content, HEADER);
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("csv-data").join("nested").join("results.csv");
        let store = ResultStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.records(), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_append_returns_sequence_and_counts() {
        let (store, _dir) = make_store();
        assert_eq!(store.append(&make_record("a")).unwrap(), 0);
        assert_eq!(store.append(&make_record("b")).unwrap(), 1);
        assert_eq!(store.append(&make_record("c")).unwrap(), 2);
        assert_eq!(store.records(), 3);
        assert_eq!(StoreView::new(store.path()).count().unwrap(), 3);
    }

    #[test]
    fn test_record_line_format() {
        let (store, _dir) = make_store();
        store.append(&make_record("Terminal shell in container")).unwrap();
        let content = fs::read_to_string(store.path()).unwrap();
        assert_eq!(
            content,
            format!(
                "{}2025-01-01T00:00:00Z,Terminal shell in container,Warning,shell spawned,HIGH,Execution,T1059,Restrict exec in container\n",
                HEADER
            )
        );
    }

    #[test]
    fn test_appends_never_change_prior_bytes() {
        let (store, _dir) = make_store();
        store.append(&make_record("first")).unwrap();
        let before = fs::read(store.path()).unwrap();

        let mut tricky = make_record("second");
        tricky.details = "quoted \"value\", with comma\nand newline".to_string();
        store.append(&tricky).unwrap();

        let after = fs::read(store.path()).unwrap();
        assert!(after.starts_with(&before));
        assert_eq!(StoreView::new(store.path()).count().unwrap(), 2);
    }

    #[test]
    fn test_reopen_keeps_header_and_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        {
            let store = ResultStore::open(&path, StoreOptions::default()).unwrap();
            store.append(&make_record("a")).unwrap();
            store.append(&make_record("b")).unwrap();
        }

        let store = ResultStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.records(), 2);
        assert_eq!(store.append(&make_record("c")).unwrap(), 2);

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("timestamp,rule").count(), 1);

        store.reopen().unwrap();
        assert_eq!(store.records(), 3);
    }

    #[test]
    fn test_torn_tail_is_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        {
            let store = ResultStore::open(&path, StoreOptions::default()).unwrap();
            store.append(&make_record("a")).unwrap();
        }
        let complete = fs::read(&path).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"2025-01-01T00:00:00Z,half writ").unwrap();
        }

        assert_eq!(StoreView::new(&path).count().unwrap(), 1);

        let store = ResultStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.records(), 1);
        assert_eq!(fs::read(&path).unwrap(), complete);
    }

    #[test]
    fn test_torn_quoted_field_not_counted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        fs::write(
            &path,
            format!(
                "{}t,r,p,d,HIGH,Execution,T1059,fix\nt,r,p,\"line one\n",
                HEADER
            ),
        )
        .unwrap();
        assert_eq!(StoreView::new(&path).count().unwrap(), 1);
    }

    #[test]
    fn test_malformed_line_keeps_later_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        let good = |ts: &str| format!("{},r,p,d,HIGH,Execution,T1059,fix\n", ts);
        let contents = format!(
            "{}{}t2,r,p,d,HIGH,Execution\n{}",
            HEADER,
            good("t1"),
            good("t3")
        );
        fs::write(&path, &contents).unwrap();

        assert_eq!(StoreView::new(&path).count().unwrap(), 2);

        let store = ResultStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.records(), 2);
        assert_eq!(fs::read_to_string(&path).unwrap(), contents);

        assert_eq!(store.append(&make_record("t4")).unwrap(), 2);
        let after = fs::read_to_string(&path).unwrap();
        assert!(after.starts_with(&contents));
        assert_eq!(StoreView::new(&path).count().unwrap(), 3);
    }

    #[test]
    fn test_only_torn_tail_dropped_after_malformed_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        let kept = format!(
            "{}t1,r,p,d,HIGH,Execution\nt2,r,p,d,HIGH,Execution,T1059,fix\n",
            HEADER
        );
        fs::write(&path, format!("{}t3,r,p,\"half", kept)).unwrap();

        let store = ResultStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.records(), 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), kept);
    }

    #[test]
    fn test_failed_append_leaves_store_untouched() {
        let (store, _dir) = make_store();
        store.append(&make_record("a")).unwrap();
        let before = fs::read(store.path()).unwrap();

        // Read-only handle: the write fails and so does the rollback
        store.lock().file = File::open(store.path()).unwrap();
        let err = store.append(&make_record("b")).unwrap_err();
        assert!(matches!(err, StoreError::WriteFailed { .. }));
        assert_eq!(store.records(), 1);
        assert_eq!(fs::read(store.path()).unwrap(), before);

        // Nothing more is written until the store is reopened
        store.lock().file = OpenOptions::new().append(true).open(store.path()).unwrap();
        assert!(matches!(
            store.append(&make_record("c")),
            Err(StoreError::WriteFailed { .. })
        ));
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn test_reopen_after_failed_append() {
        let (store, _dir) = make_store();
        store.append(&make_record("a")).unwrap();
        let before = fs::read(store.path()).unwrap();

        store.lock().file = File::open(store.path()).unwrap();
        assert!(store.append(&make_record("b")).is_err());
        // Partial bytes the failed write could have left behind
        {
            let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
            file.write_all(b"2025-01-01T00:00:00Z,b,Warn").unwrap();
        }

        store.reopen().unwrap();
        assert_eq!(store.records(), 1);
        assert_eq!(fs::read(store.path()).unwrap(), before);

        assert_eq!(store.append(&make_record("c")).unwrap(), 1);
        assert_eq!(StoreView::new(store.path()).count().unwrap(), 2);
        let mut reader = csv::Reader::from_path(store.path()).unwrap();
        let rules: Vec<String> = reader
            .deserialize::<TriageRecord>()
            .map(|row| row.unwrap().rule)
            .collect();
        assert_eq!(rules, ["a", "c"]);
    }

    #[test]
    fn test_foreign_unterminated_line_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        fs::write(&path, "id,name").unwrap();

        assert!(matches!(
            ResultStore::open(&path, StoreOptions::default()),
            Err(StoreError::SchemaMismatch { .. })
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), "id,name");
    }

    #[test]
    fn test_foreign_header_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        fs::write(&path, "id,name\n1,foo\n").unwrap();

        let err = ResultStore::open(&path, StoreOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
        assert!(matches!(
            StoreView::new(&path).count(),
            Err(StoreError::SchemaMismatch { .. })
        ));
        // Existing data is left alone
        assert_eq!(fs::read_to_string(&path).unwrap(), "id,name\n1,foo\n");
    }

    #[test]
    fn test_torn_header_rewritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        fs::write(&path, "timestamp,rule,prio").unwrap();

        let store = ResultStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.records(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), HEADER);
    }

    #[test]
    fn test_view_of_missing_file_is_zero() {
        let dir = TempDir::new().unwrap();
        let view = StoreView::new(dir.path().join("absent.csv"));
        assert_eq!(view.count().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_appends() {
        let (store, _dir) = make_store();
        let store = Arc::new(store);
        let writers = 8;
        let per_writer = 25;

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..per_writer {
                        let mut record = make_record(&format!("rule-{}-{}", w, i));
                        record.details = format!("details, \"{}\"\nspanning lines", i);
                        store.append(&record).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let expected = (writers * per_writer) as u64;
        assert_eq!(store.records(), expected);
        assert_eq!(StoreView::new(store.path()).count().unwrap(), expected);

        let mut reader = csv::Reader::from_path(store.path()).unwrap();
        let mut rows = 0;
        for row in reader.deserialize::<TriageRecord>() {
            let row = row.unwrap();
            assert!(row.rule.starts_with("rule-"));
            assert_eq!(row.mitre_technique, "T1059");
            rows += 1;
        }
        assert_eq!(rows, writers * per_writer);
    }
}
