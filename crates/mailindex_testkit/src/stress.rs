//! Stress tests for the mailbox index.
//!
//! These exercise concurrent commits, both through one shared handle and
//! through one handle per thread, which is how separate processes share an
//! index.

use mailindex_core::types::Uid;
use mailindex_core::{Config, MailFlags, MailIndex, ModifyType, Registry, TransactionFlags};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
    /// UID ranges handed out by the successful commits.
    pub uid_ranges: Vec<(Uid, Uid)>,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration, uid_ranges: Vec<(Uid, Uid)>) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
            uid_ranges,
        }
    }

    /// Returns true if no UID was handed out twice.
    pub fn uids_are_unique(&self) -> bool {
        let mut ranges = self.uid_ranges.clone();
        ranges.sort_unstable();
        ranges.windows(2).all(|pair| pair[0].1 < pair[1].0)
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of commits per thread.
    pub commits: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Messages appended by each commit.
    pub messages_per_commit: u32,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            commits: 50,
            threads: 4,
            messages_per_commit: 2,
        }
    }
}

fn append_commit(index: &MailIndex, count: u32) -> Option<(Uid, Uid)> {
    let mut tx = index.transaction_begin(TransactionFlags::empty());
    for _ in 0..count {
        tx.append(0);
    }
    index.commit(tx).ok().and_then(|result| result.uids)
}

fn run_threads<F>(config: &StressConfig, make_index: F) -> StressTestResult
where
    F: Fn(usize) -> Arc<MailIndex>,
{
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let index = make_index(t);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let commits = config.commits;
            let count = config.messages_per_commit;

            thread::spawn(move || {
                let mut ranges = Vec::with_capacity(commits);
                for _ in 0..commits {
                    match append_commit(&index, count) {
                        Some(range) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                            ranges.push(range);
                        }
                        None => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                ranges
            })
        })
        .collect();

    let mut uid_ranges = Vec::new();
    for handle in handles {
        uid_ranges.extend(handle.join().expect("Thread panicked"));
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
        uid_ranges,
    )
}

/// Commits appends from several threads through one shared handle.
pub fn stress_shared_handle_commits(index: Arc<MailIndex>, config: &StressConfig) -> StressTestResult {
    run_threads(config, |_| Arc::clone(&index))
}

/// Commits appends from several threads, each with its own handle on the
/// index in `dir`.
pub fn stress_handle_per_thread_commits(
    dir: &Path,
    index_config: &Config,
    registry: &Arc<Registry>,
    config: &StressConfig,
) -> StressTestResult {
    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            Arc::new(
                MailIndex::open(dir, index_config, Arc::clone(registry))
                    .expect("Failed to open index handle"),
            )
        })
        .collect();
    run_threads(config, |t| Arc::clone(&handles[t]))
}

/// Toggles `\Seen` over growing ranges and checks the seen count after
/// every commit.
pub fn stress_flag_churn(index: &MailIndex, config: &StressConfig) -> StressTestResult {
    let messages = config.messages_per_commit.max(1) * 10;
    let mut successful = 0;
    let mut failed = 0;
    let start = Instant::now();

    let mut tx = index.transaction_begin(TransactionFlags::empty());
    for _ in 0..messages {
        tx.append(0);
    }
    if index.commit(tx).is_err() {
        return StressTestResult::new(0, 1, start.elapsed(), Vec::new());
    }

    for i in 0..config.commits {
        let seq2 = (i as u32 % messages) + 1;
        let mode = if i % 2 == 0 { ModifyType::Add } else { ModifyType::Remove };
        let mut tx = index.transaction_begin(TransactionFlags::empty());
        tx.update_flags(1, seq2, mode, MailFlags::SEEN);
        let expected = if mode == ModifyType::Add { seq2 } else { 0 };
        match index.commit(tx) {
            Ok(_) if index.map().header().seen_messages_count == expected => successful += 1,
            _ => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed(), Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestIndex;
    use mailindex_core::CoreError;

    fn small() -> StressConfig {
        StressConfig {
            commits: 20,
            threads: 4,
            messages_per_commit: 3,
        }
    }

    #[test]
    fn test_shared_handle_commits() {
        let test_index = TestIndex::file();
        let config = small();
        let index = Arc::new(test_index.open_another());
        let result = stress_shared_handle_commits(Arc::clone(&index), &config);
        assert_eq!(result.failed_ops, 0);
        assert!(result.uids_are_unique());
        assert_eq!(index.map().messages_count(), 20 * 4 * 3);
    }

    #[test]
    fn test_handle_per_thread_commits() {
        let test_index = TestIndex::file();
        let config = small();
        let result = stress_handle_per_thread_commits(
            test_index.dir().unwrap(),
            &Config::default(),
            &test_index.registry,
            &config,
        );
        assert_eq!(result.failed_ops, 0);
        assert!(result.uids_are_unique());

        test_index.refresh().unwrap();
        let map = test_index.map();
        assert_eq!(map.messages_count(), 20 * 4 * 3);
        assert_eq!(map.header().next_uid, 20 * 4 * 3 + 1);
    }

    #[test]
    fn test_flag_churn() {
        let test_index = TestIndex::memory();
        let result = stress_flag_churn(&test_index, &small());
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 20);
    }

    #[test]
    fn test_three_lockers() {
        let config = Config::default().lock_timeout(Duration::from_millis(100));
        let test_index = TestIndex::file_with(config);
        let a = test_index.open_another();
        let b = test_index.open_another();
        let c = test_index.open_another();

        let shared_a = a.lock_shared().unwrap();
        let shared_b = b.lock_shared().unwrap();
        assert!(matches!(c.try_lock_exclusive(), Err(CoreError::LockWouldBlock { .. })));

        a.unlock(shared_a);
        assert!(!a.is_lock_valid(shared_a));
        assert!(matches!(c.try_lock_exclusive(), Err(CoreError::LockWouldBlock { .. })));
        b.unlock(shared_b);

        let excl = c.try_lock_exclusive().unwrap();
        assert!(matches!(a.lock_shared(), Err(CoreError::LockTimeout { .. })));
        c.unlock(excl);
        assert!(!c.is_lock_valid(excl));

        let shared = a.lock_shared().unwrap();
        assert!(a.is_lock_valid(shared));
        a.unlock(shared);
    }
}
