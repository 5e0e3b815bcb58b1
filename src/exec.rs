//! Generic execution primitives for the OCR dispatch path: a retry policy
//! with exponential backoff, and a bounded parallel map that preserves
//! input order regardless of completion order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Exponential-backoff retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

/// Run `op` until it succeeds or the attempt ceiling is reached, sleeping
/// a strictly increasing delay between attempts. Only errors for which
/// `is_retryable` returns true are retried; anything else surfaces
/// immediately.
pub fn retry_with_backoff<T, E, F, P>(policy: &RetryPolicy, mut op: F, is_retryable: P) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.base_delay;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= attempts || !is_retryable(&err) {
                    return Err(err);
                }
                tracing::warn!("retrying after error (attempt {}/{}): {}", attempt, attempts, err);
                std::thread::sleep(delay);
                delay = delay.mul_f64(policy.multiplier);
                attempt += 1;
            }
        }
    }
}

/// Apply `f` to every item on a bounded pool of worker threads, returning
/// results aligned with the input order. Workers pull the next unclaimed
/// index, so completion order never affects output order.
pub fn parallel_map<T, R, F>(max_workers: usize, items: Vec<T>, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let len = items.len();
    if len == 0 {
        return Vec::new();
    }
    let workers = max_workers.clamp(1, len);
    if workers == 1 {
        return items.into_iter().map(f).collect();
    }

    let work: Vec<Mutex<Option<T>>> = items.into_iter().map(|item| Mutex::new(Some(item))).collect();
    let slots: Vec<Mutex<Option<R>>> = (0..len).map(|_| Mutex::new(None)).collect();
    let next = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let idx = next.fetch_add(1, Ordering::SeqCst);
                if idx >= len {
                    break;
                }
                let item = work[idx].lock().unwrap().take().expect("each index claimed once");
                let output = f(item);
                *slots[idx].lock().unwrap() = Some(output);
            });
        }
    });

    slots
        .into_iter()
        .map(|slot| slot.into_inner().unwrap().expect("every slot filled"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
        };
        let result: Result<u32, String> = retry_with_backoff(
            &policy,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            },
            |_| true,
        );
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_ceiling_exhausted() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
        };
        let result: Result<(), String> = retry_with_backoff(
            &policy,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("still down".to_string())
            },
            |_| true,
        );
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_non_retryable_error_surfaces_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
        };
        let result: Result<(), String> = retry_with_backoff(
            &policy,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("programming error".to_string())
            },
            |_| false,
        );
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parallel_map_preserves_order() {
        // Later items finish first; output must still follow input order.
        let items: Vec<usize> = (0..8).collect();
        let results = parallel_map(4, items, |i| {
            std::thread::sleep(Duration::from_millis((8 - i) as u64 * 5));
            i * 10
        });
        assert_eq!(results, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }

    #[test]
    fn test_parallel_map_empty_and_single_worker() {
        let empty: Vec<u32> = Vec::new();
        assert!(parallel_map(4, empty, |i| i).is_empty());
        assert_eq!(parallel_map(1, vec![1, 2, 3], |i| i + 1), vec![2, 3, 4]);
    }
}
