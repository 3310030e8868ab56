//! Bounded waiting for worker echoes.
//!
//! The control thread polls with exponential backoff. It never spins and never
//! blocks forever: after the configured bound the wait gives up, and the
//! generation it was waiting on stays pending rather than being freed.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::config::QuiescenceConfig;
use crate::error::{CoreError, Result};
use crate::generation::ResourceKind;

/// Result of one poll of the echo board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Nothing left to wait for.
    Quiescent,
    /// `generation` is still held by the workers listed in `laggards`.
    Waiting { generation: u64, laggards: Vec<usize> },
}

/// Exponential backoff between polls.
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { next: initial, max }
    }

    /// The delay to sleep now; doubles the following one up to the cap.
    pub fn step(&mut self) -> Duration {
        let current = self.next;
        self.next = (self.next * 2).min(self.max);
        current
    }
}

/// Poll until `poll` reports quiescence or the give-up bound passes.
///
/// Returns how long the wait took.
pub fn await_quiescence<F>(
    config: &QuiescenceConfig,
    kind: ResourceKind,
    mut poll: F,
) -> Result<Duration>
where
    F: FnMut() -> Progress,
{
    let start = Instant::now();
    let mut backoff = Backoff::new(config.poll_initial(), config.poll_max());
    let mut warned = false;

    loop {
        let (generation, laggards) = match poll() {
            Progress::Quiescent => {
                let waited = start.elapsed();
                debug!(%kind, ?waited, "quiescent");
                return Ok(waited);
            }
            Progress::Waiting {
                generation,
                laggards,
            } => (generation, laggards),
        };

        let waited = start.elapsed();
        if waited >= config.give_up_after() {
            error!(%kind, generation, workers = ?laggards, ?waited, "workers never echoed; generation stays pending");
            return Err(CoreError::QuiescenceStalled {
                kind,
                generation,
                workers: laggards,
                waited,
            });
        }
        if !warned && waited >= config.warn_after() {
            warn!(%kind, generation, workers = ?laggards, ?waited, "still waiting for workers to echo");
            warned = true;
        }

        thread::sleep(backoff.step());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> QuiescenceConfig {
        QuiescenceConfig {
            poll_initial_ms: 1,
            poll_max_ms: 2,
            warn_after_ms: 5,
            give_up_after_ms: 30,
        }
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5));
        let steps: Vec<_> = (0..5).map(|_| backoff.step().as_millis()).collect();
        assert_eq!(steps, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_immediately_quiescent() {
        let mut polls = 0;
        let result = await_quiescence(&fast_config(), ResourceKind::Sockets, || {
            polls += 1;
            Progress::Quiescent
        });
        assert!(result.is_ok());
        assert_eq!(polls, 1);
    }

    #[test]
    fn test_waits_until_quiescent() {
        let mut polls = 0;
        let result = await_quiescence(&fast_config(), ResourceKind::Raw, || {
            polls += 1;
            if polls < 4 {
                Progress::Waiting {
                    generation: 1,
                    laggards: vec![0],
                }
            } else {
                Progress::Quiescent
            }
        });
        assert!(result.is_ok());
        assert_eq!(polls, 4);
    }

    #[test]
    fn test_gives_up_with_laggards() {
        let err = await_quiescence(&fast_config(), ResourceKind::Catalog, || {
            Progress::Waiting {
                generation: 7,
                laggards: vec![2, 3],
            }
        })
        .unwrap_err();

        match err {
            CoreError::QuiescenceStalled {
                kind,
                generation,
                workers,
                waited,
            } => {
                assert_eq!(kind, ResourceKind::Catalog);
                assert_eq!(generation, 7);
                assert_eq!(workers, vec![2, 3]);
                assert!(waited >= Duration::from_millis(30));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
