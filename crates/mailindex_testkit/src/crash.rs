//! Crash recovery testing.
//!
//! A transaction is written to the log in two steps: the whole transaction
//! with its first record's size zeroed, then the size itself. A process
//! that dies anywhere in between must leave a log whose readers stop just
//! before the transaction, and whose next writer overwrites it.
//!
//! The helpers here damage a committed transaction on disk the way such a
//! crash would, then reopen the index and check what survived.
//!
//! ## Usage
//!
//! ```rust
//! use mailindex_testkit::crash::{CrashPoint, CrashRecoveryHarness};
//!
//! let mut harness = CrashRecoveryHarness::new();
//! let result = harness.run(CrashPoint::BeforeSizeWrite);
//! assert!(result.passed, "{:?}", result.error);
//! ```

use mailindex_core::log::LogSpan;
use mailindex_core::{Config, MailIndex, Registry, TransactionFlags};
use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Offset of the size field within a record header.
const RECORD_SIZE_OFFSET: u64 = 4;

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Only part of the transaction reached the disk.
    DuringWrite,
    /// The transaction is on disk but its first record's size is still
    /// zero.
    BeforeSizeWrite,
    /// The transaction was followed by bytes from a write that never
    /// finished.
    TrailingGarbage,
}

impl CrashPoint {
    /// Every crash point.
    pub const ALL: [Self; 3] = [Self::DuringWrite, Self::BeforeSizeWrite, Self::TrailingGarbage];

    /// Returns true if the transaction survives this crash.
    pub const fn keeps_transaction(self) -> bool {
        matches!(self, Self::TrailingGarbage)
    }
}

/// Cuts the log file at `path` to `len` bytes.
pub fn tear_log(path: &Path, len: u64) -> io::Result<()> {
    OpenOptions::new().write(true).open(path)?.set_len(len)
}

/// Zeroes the size of the record at `offset`, as if the second write of a
/// transaction never happened.
pub fn zero_record_size(path: &Path, offset: u64) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset + RECORD_SIZE_OFFSET))?;
    file.write_all(&[0; 4])
}

/// Appends `len` bytes of junk that look like the start of a record.
pub fn append_garbage(path: &Path, len: usize) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    let mut junk = vec![0xa5; len];
    // A plausible type, and a size pointing past the end of the file.
    if len >= 8 {
        junk[..4].copy_from_slice(&0x0002u32.to_le_bytes());
        junk[4..8].copy_from_slice(&(len as u32 * 4).to_le_bytes());
    }
    file.write_all(&junk)
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// The crash that was simulated.
    pub point: CrashPoint,
    /// Expected messages after recovery.
    pub expected_messages: u32,
    /// Actual messages after recovery.
    pub actual_messages: u32,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    fn pass(point: CrashPoint, messages: u32) -> Self {
        Self {
            passed: true,
            point,
            expected_messages: messages,
            actual_messages: messages,
            error: None,
        }
    }

    fn fail(point: CrashPoint, expected: u32, actual: u32, error: impl Into<String>) -> Self {
        Self {
            passed: false,
            point,
            expected_messages: expected,
            actual_messages: actual,
            error: Some(error.into()),
        }
    }
}

/// Test harness for crash recovery scenarios.
pub struct CrashRecoveryHarness {
    dir: TempDir,
    config: Config,
    registry: Arc<Registry>,
    /// Results of the scenarios run so far.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashRecoveryHarness {
    /// Number of messages committed before the damaged transaction.
    pub const BASELINE: u32 = 2;
    /// Number of messages in the damaged transaction.
    pub const DOOMED: u32 = 3;

    /// Creates a harness in a temporary directory.
    ///
    /// The index file is only written explicitly, so recovery always has
    /// to go through the log.
    pub fn new() -> Self {
        crate::fixtures::init_test_logging();
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
            config: Config::default().index_write_threshold(u64::MAX),
            registry: Registry::new(),
            results: Vec::new(),
        }
    }

    fn scenario_dir(&self, point: CrashPoint) -> PathBuf {
        self.dir.path().join(format!("{point:?}"))
    }

    fn open(&self, dir: &Path) -> Result<MailIndex, String> {
        MailIndex::open(dir, &self.config, Arc::clone(&self.registry)).map_err(|err| err.to_string())
    }

    /// Commits a baseline and a doomed transaction, simulates `point` on
    /// the doomed one and checks the reopened index.
    pub fn run(&mut self, point: CrashPoint) -> CrashRecoveryResult {
        let result = self.try_run(point).unwrap_or_else(|err| {
            CrashRecoveryResult::fail(point, Self::BASELINE, 0, err)
        });
        self.results.push(result.clone());
        result
    }

    fn try_run(&self, point: CrashPoint) -> Result<CrashRecoveryResult, String> {
        let dir = self.scenario_dir(point);
        let log_path = dir.join(format!("{}.log", self.config.prefix));

        let span = {
            let index = self.open(&dir)?;
            append(&index, Self::BASELINE)?;
            append(&index, Self::DOOMED)?
        };

        let damage = match point {
            CrashPoint::DuringWrite => {
                let middle = span.start.offset + (span.end.offset - span.start.offset) / 2;
                tear_log(&log_path, middle)
            }
            CrashPoint::BeforeSizeWrite => zero_record_size(&log_path, span.start.offset),
            CrashPoint::TrailingGarbage => append_garbage(&log_path, 24),
        };
        damage.map_err(|err| err.to_string())?;

        let index = self.open(&dir)?;
        let expected = if point.keeps_transaction() {
            Self::BASELINE + Self::DOOMED
        } else {
            Self::BASELINE
        };
        let actual = index.map().messages_count();
        if actual != expected {
            return Ok(CrashRecoveryResult::fail(point, expected, actual, "wrong message count"));
        }

        // The next transaction goes where the damaged bytes were.
        let next = append(&index, 1)?;
        let resume_at = if point.keeps_transaction() { span.end } else { span.start };
        if next.start != resume_at {
            return Ok(CrashRecoveryResult::fail(
                point,
                expected,
                actual,
                format!("next transaction at {:?}, expected {:?}", next.start, resume_at),
            ));
        }
        drop(index);

        let actual = self.open(&dir)?.map().messages_count();
        if actual != expected + 1 {
            return Ok(CrashRecoveryResult::fail(point, expected + 1, actual, "append after recovery lost"));
        }
        Ok(CrashRecoveryResult::pass(point, expected))
    }

    /// Runs every crash point.
    pub fn run_all(&mut self) -> Vec<CrashRecoveryResult> {
        CrashPoint::ALL.iter().map(|&point| self.run(point)).collect()
    }

    /// Returns a summary of the results.
    pub fn summary(&self) -> String {
        let passed = self.results.iter().filter(|r| r.passed).count();
        let mut out = format!("{passed}/{} crash scenarios passed\n", self.results.len());
        for result in &self.results {
            let status = if result.passed { "ok" } else { "FAILED" };
            out.push_str(&format!(
                "  {:?}: {status} ({} of {} messages)",
                result.point, result.actual_messages, result.expected_messages
            ));
            if let Some(err) = &result.error {
                out.push_str(&format!(": {err}"));
            }
            out.push('\n');
        }
        out
    }

    /// Returns true if every scenario run so far passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}

impl Default for CrashRecoveryHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn append(index: &MailIndex, count: u32) -> Result<LogSpan, String> {
    let mut tx = index.transaction_begin(TransactionFlags::empty());
    for _ in 0..count {
        tx.append(0);
    }
    index.commit(tx).map(|result| result.span).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn torn_transaction_is_dropped() {
        let mut harness = CrashRecoveryHarness::new();
        let result = harness.run(CrashPoint::DuringWrite);
        assert!(result.passed, "{}", harness.summary());
    }

    #[test]
    fn zero_size_record_hides_transaction() {
        let mut harness = CrashRecoveryHarness::new();
        let result = harness.run(CrashPoint::BeforeSizeWrite);
        assert!(result.passed, "{}", harness.summary());
    }

    #[test]
    fn trailing_garbage_is_overwritten() {
        let mut harness = CrashRecoveryHarness::new();
        let result = harness.run(CrashPoint::TrailingGarbage);
        assert!(result.passed, "{}", harness.summary());
    }

    #[test]
    fn all_crash_points_recover() {
        let mut harness = CrashRecoveryHarness::new();
        let results = harness.run_all();
        assert_eq!(results.len(), CrashPoint::ALL.len());
        assert!(harness.all_passed(), "{}", harness.summary());
    }

    #[test]
    fn zero_record_size_only_touches_the_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, [1u8; 16]).unwrap();
        zero_record_size(&path, 4).unwrap();
        assert_eq!(
            std::fs::read(&path).unwrap(),
            [1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 1, 1, 1, 1]
        );
    }
}
