//! Bounded retry loops for non-blocking lock attempts.

use std::io;
use std::thread;
use std::time::{Duration, Instant};

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Returns true if `err` means "someone else holds the lock".
pub(crate) fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Calls `attempt` until it yields a value or `timeout` passes.
///
/// `attempt` returns `Ok(None)` to ask for another try. The first attempt
/// always runs, so a zero timeout means "try exactly once". Returns
/// `Ok(None)` on timeout.
pub(crate) fn retry_until<T>(
    timeout: Duration,
    mut attempt: impl FnMut() -> io::Result<Option<T>>,
) -> io::Result<Option<T>> {
    let deadline = Instant::now() + timeout;
    let mut backoff = MIN_BACKOFF;
    loop {
        if let Some(value) = attempt()? {
            return Ok(Some(value));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(backoff.min(deadline - now));
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_tries_once() {
        let mut calls = 0;
        let result: Option<()> = retry_until(Duration::ZERO, || {
            calls += 1;
            Ok(None)
        })
        .unwrap();
        assert!(result.is_none());
        assert_eq!(calls, 1);
    }

    #[test]
    fn succeeds_after_retries() {
        let mut calls = 0;
        let result = retry_until(Duration::from_secs(5), || {
            calls += 1;
            Ok((calls == 3).then_some(calls))
        })
        .unwrap();
        assert_eq!(result, Some(3));
    }

    #[test]
    fn errors_stop_the_loop() {
        let result: io::Result<Option<()>> =
            retry_until(Duration::from_secs(5), || Err(io::Error::other("boom")));
        assert!(result.is_err());
    }
}
