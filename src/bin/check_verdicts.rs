//! Verdict Validation Harness
//!
//! Runs the verdict validator over saved oracle outputs (one output per
//! file) and reports how many would have been accepted, by threat level,
//! along with the rejection reasons.

use clap::Parser;
use falco_triage::models::{ThreatLevel, Verdict};
use falco_triage::utils::truncate_str;
use falco_triage::validator::{validate, OracleMode};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

const MAX_SHOWN_FAILURES: usize = 10;

#[derive(Parser)]
#[command(name = "check-verdicts")]
#[command(about = "Validate saved oracle outputs against the verdict schema", long_about = None)]
struct Args {
    /// Outputs are bare severity words rather than verdict JSON
    #[arg(long)]
    legacy: bool,
    /// Print every rejection instead of the first few
    #[arg(long)]
    verbose: bool,
    /// Output files, or directories of output files
    #[arg(required = true, value_name = "PATH")]
    paths: Vec<PathBuf>,
}

#[derive(Default)]
struct ValidationStats {
    total: usize,
    unreadable: Vec<(PathBuf, String)>,
    accepted_by_level: BTreeMap<ThreatLevel, usize>,
    techniques: BTreeMap<String, usize>,
    rejected: Vec<(PathBuf, String, String)>,
}

impl ValidationStats {
    fn accepted(&self) -> usize {
        self.accepted_by_level.values().sum()
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let mode = if args.legacy {
        OracleMode::Legacy
    } else {
        OracleMode::Structured
    };

    println!("═══════════════════════════════════════════════════");
    println!("Verdict Validation ({:?} mode)", mode);
    println!("═══════════════════════════════════════════════════");

    let start = Instant::now();
    let files = collect_files(&args.paths);
    let mut stats = ValidationStats::default();

    for path in files {
        stats.total += 1;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                stats.unreadable.push((path, err.to_string()));
                continue;
            }
        };

        match validate(&raw, mode) {
            Ok(verdict) => {
                *stats
                    .accepted_by_level
                    .entry(verdict.threat_level())
                    .or_default() += 1;
                if let Verdict::Structured(v) = verdict {
                    *stats.techniques.entry(v.mitre_technique).or_default() += 1;
                }
            }
            Err(err) => stats.rejected.push((path, err.reason, err.raw)),
        }
    }

    print_summary(&stats, args.verbose);
    println!();
    println!("Checked {} outputs in {:.2?}", stats.total, start.elapsed());

    if stats.rejected.is_empty() && stats.unreadable.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Expand directories one level, keeping command-line order for files
fn collect_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            match fs::read_dir(path) {
                Ok(entries) => {
                    let mut found: Vec<PathBuf> = entries
                        .filter_map(|entry| entry.ok().map(|e| e.path()))
                        .filter(|p| p.is_file())
                        .collect();
                    found.sort();
                    files.extend(found);
                }
                Err(err) => println!("❌ Cannot read directory {}: {}", path.display(), err),
            }
        } else {
            files.push(path.clone());
        }
    }
    files
}

fn print_summary(stats: &ValidationStats, verbose: bool) {
    let accepted = stats.accepted();
    let rate = if stats.total == 0 {
        0.0
    } else {
        accepted as f64 / stats.total as f64 * 100.0
    };

    println!("  ✓ Accepted:   {:>5}", accepted);
    println!("  ✗ Rejected:   {:>5}", stats.rejected.len());
    println!("  ? Unreadable: {:>5}", stats.unreadable.len());
    println!("  Acceptance rate: {:.1}%", rate);
    println!();

    if !stats.accepted_by_level.is_empty() {
        println!("Accepted by threat level:");
        for level in ThreatLevel::ALL {
            let count = stats.accepted_by_level.get(&level).copied().unwrap_or(0);
            println!("  {:10} {:>5}", level.as_str(), count);
        }
        println!();
    }

    if !stats.techniques.is_empty() {
        let mut techniques: Vec<_> = stats.techniques.iter().collect();
        techniques.sort_by(|a, b| b.1.cmp(a.1));
        println!("Top MITRE techniques:");
        for (technique, count) in techniques.iter().take(10) {
            println!("  {:12} {:>5}", technique, count);
        }
        println!();
    }

    let shown = if verbose {
        stats.rejected.len()
    } else {
        MAX_SHOWN_FAILURES
    };
    if !stats.rejected.is_empty() {
        println!("Rejected outputs (first {}):", shown.min(stats.rejected.len()));
        for (path, reason, raw) in stats.rejected.iter().take(shown) {
            println!("  ✗ {}: {}", file_label(path), reason);
            println!("      {}", truncate_str(raw.trim(), 120).replace('\n', "\\n"));
        }
    }

    for (path, err) in &stats.unreadable {
        println!("  ? {}: {}", file_label(path), err);
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string())
}
