//! Per-client rate limiting using fixed windows.
//!
//! Each key (normally the client IP) gets a bucket holding the number of
//! requests still allowed in its current window. The window starts with the
//! first request from that key and lasts [`RateLimiter::window`]; the first
//! request after it ends opens a fresh window.
//!
//! # Algorithm
//!
//! - An unseen key, or a key whose window has ended, gets `rate - 1` tokens
//!   and the request is allowed
//! - Otherwise a request is allowed if a token is left, consuming it
//! - Otherwise it is denied and nothing changes
//!
//! Windows are fixed, not sliding: a client can send `rate` requests at the
//! very end of one window and `rate` more at the start of the next.
//!
//! Buckets untouched for more than two windows are removed by
//! [`RateLimiter::sweep`], which [`RateLimiter::start_sweeper`] runs on a
//! timer.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use ngp_server::rate_limit::RateLimiter;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::new(2, Duration::from_secs(60));
//!
//!     assert!(limiter.allow("10.0.0.1").await);
//!     assert!(limiter.allow("10.0.0.1").await);
//!     assert!(!limiter.allow("10.0.0.1").await);
//!     assert_eq!(limiter.remaining("10.0.0.1").await, 0);
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default number of requests per window.
pub const DEFAULT_RATE: u32 = 60;

/// Default window length (one minute).
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// The sweeper runs every this many windows unless told otherwise.
const SWEEP_INTERVAL_WINDOWS: u32 = 5;

/// Buckets whose window started more than this many windows ago are stale.
const STALE_AFTER_WINDOWS: u32 = 2;

/// State for a single key.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Requests still allowed in the current window. Never exceeds the rate.
    tokens_remaining: u32,

    /// When the current window opened.
    window_start: Instant,
}

impl Bucket {
    fn expired(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.window_start) >= window
    }
}

/// Thread-safe fixed-window rate limiter keyed by string.
///
/// Cloning is cheap and all clones share the same buckets.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    buckets: Arc<RwLock<HashMap<String, Bucket>>>,
    rate: u32,
    window: Duration,
}

impl RateLimiter {
    /// Creates a limiter admitting `rate` requests per key and `window`.
    ///
    /// A `rate` of zero is raised to one.
    pub fn new(rate: u32, window: Duration) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            rate: rate.max(1),
            window,
        }
    }

    /// Requests admitted per window.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Length of one window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records a request from `key` and returns whether it may proceed.
    ///
    /// A denied request leaves the bucket untouched.
    pub async fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;

        match buckets.get_mut(key) {
            Some(bucket) if !bucket.expired(now, self.window) => {
                if bucket.tokens_remaining > 0 {
                    bucket.tokens_remaining -= 1;
                    true
                } else {
                    false
                }
            }
            // Unseen key or finished window: open a new window.
            _ => {
                buckets.insert(
                    key.to_string(),
                    Bucket {
                        tokens_remaining: self.rate - 1,
                        window_start: now,
                    },
                );
                true
            }
        }
    }

    /// Requests `key` may still make in its current window.
    ///
    /// Returns the full rate for unseen keys and for keys whose window ended.
    pub async fn remaining(&self, key: &str) -> u32 {
        let now = Instant::now();
        let buckets = self.buckets.read().await;

        match buckets.get(key) {
            Some(bucket) if !bucket.expired(now, self.window) => bucket.tokens_remaining,
            _ => self.rate,
        }
    }

    /// When the current window for `key` ends.
    ///
    /// For unseen keys this is one full window from now. For a key whose
    /// window already ended it is that past instant.
    pub async fn reset_time(&self, key: &str) -> Instant {
        let buckets = self.buckets.read().await;

        match buckets.get(key) {
            Some(bucket) => bucket.window_start + self.window,
            None => Instant::now() + self.window,
        }
    }

    /// Removes buckets whose window started more than two windows ago.
    ///
    /// Returns the number of buckets removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let stale_after = self.window * STALE_AFTER_WINDOWS;
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();

        buckets.retain(|_, bucket| now.duration_since(bucket.window_start) <= stale_after);

        before - buckets.len()
    }

    /// Number of keys currently tracked.
    pub async fn tracked_keys(&self) -> usize {
        self.buckets.read().await.len()
    }

    /// Starts the background sweep, running every five windows.
    ///
    /// The sweep stops when [`Sweeper::stop`] is called or the returned
    /// handle is dropped.
    #[must_use = "dropping the handle stops the sweeper"]
    pub fn start_sweeper(&self) -> Sweeper {
        self.start_sweeper_every(self.window * SWEEP_INTERVAL_WINDOWS)
    }

    /// Starts the background sweep with a custom interval.
    #[must_use = "dropping the handle stops the sweeper"]
    pub fn start_sweeper_every(&self, every: Duration) -> Sweeper {
        let limiter = self.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = limiter.sweep().await;
                        if removed > 0 {
                            debug!(removed_count = removed, "Swept stale rate limit entries");
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }

            debug!("Rate limit sweeper stopped");
        });

        Sweeper {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_WINDOW)
    }
}

/// Handle to a running sweep task.
#[derive(Debug)]
pub struct Sweeper {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Sweeper {
    /// Signals the sweep task to stop. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    /// Returns `true` once the sweep task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
