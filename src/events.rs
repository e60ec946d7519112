//! Progress events published by the evaluator and the optimization loop.
//!
//! A broadcast channel decouples producers from consumers: the evaluator
//! never knows whether a task-record updater, a logger, or nobody is
//! listening.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::schema::{IterationResult, LoopPhase, SessionStatus};

/// Default channel capacity. Slow subscribers skip lagged events.
pub const DEFAULT_CAPACITY: usize = 1024;

/// One progress notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Replicate runs finished so far within one phase. `completed` only
    /// grows until the next phase starts over at 0.
    Runs { completed: usize, total: usize },
    /// The loop entered a new phase.
    Phase { iteration: usize, phase: LoopPhase },
    /// An iteration finished and was appended to history.
    Iteration(IterationResult),
    /// The loop reached a terminal status.
    Finished { status: SessionStatus },
}

/// Cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct ProgressHub {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Spawn a subscriber that logs every event until the session finishes
    /// or the hub is dropped.
    pub fn spawn_logger(&self) -> tokio::task::JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ProgressEvent::Runs { completed, total }) => {
                        log::trace!("runs {}/{}", completed, total);
                    }
                    Ok(ProgressEvent::Phase { iteration, phase }) => {
                        log::debug!("iteration {}: {}", iteration, phase);
                    }
                    Ok(ProgressEvent::Iteration(result)) => {
                        log::info!(
                            "iteration {} done: pairs={} candidates={} promoted={}",
                            result.iteration,
                            result.pairs_found,
                            result.candidates_generated,
                            result.promoted
                        );
                    }
                    Ok(ProgressEvent::Finished { status }) => {
                        log::info!("session finished: {}", status);
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("progress logger lagged by {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Run counter shared by every evaluation in one phase.
///
/// Concurrent evaluations advance the same count, and each `Runs` event is
/// sent while the count is locked, so subscribers see it in order.
#[derive(Debug, Clone)]
pub struct RunCounter {
    hub: ProgressHub,
    completed: Arc<Mutex<usize>>,
    total: usize,
}

impl RunCounter {
    /// Start a phase of `total` runs and publish `0 / total`.
    pub fn start(hub: ProgressHub, total: usize) -> Self {
        hub.publish(ProgressEvent::Runs {
            completed: 0,
            total,
        });
        Self {
            hub,
            completed: Arc::new(Mutex::new(0)),
            total,
        }
    }

    /// Count one finished run and publish the new total.
    pub fn advance(&self) -> usize {
        let mut completed = self.completed.lock();
        *completed = (*completed + 1).min(self.total);
        self.hub.publish(ProgressEvent::Runs {
            completed: *completed,
            total: self.total,
        });
        *completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_multiple_subscribers_receive_events() {
        let hub = ProgressHub::default();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(ProgressEvent::Runs {
            completed: 1,
            total: 6,
        });

        let expected = ProgressEvent::Runs {
            completed: 1,
            total: 6,
        };
        assert_eq!(a.recv().await.unwrap(), expected);
        assert_eq!(b.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_logger_stops_on_finish() {
        let hub = ProgressHub::default();
        let logger = hub.spawn_logger();
        hub.publish(ProgressEvent::Phase {
            iteration: 1,
            phase: LoopPhase::MiningPairs,
        });
        hub.publish(ProgressEvent::Finished {
            status: SessionStatus::Completed,
        });
        logger.await.unwrap();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_shared_counter_never_goes_backwards() {
        let hub = ProgressHub::default();
        let mut rx = hub.subscribe();
        let counter = RunCounter::start(hub.clone(), 6);

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let counter = counter.clone();
                tokio::spawn(async move {
                    for _ in 0..2 {
                        tokio::task::yield_now().await;
                        counter.advance();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        let mut seen = Vec::new();
        while let Ok(ProgressEvent::Runs { completed, total }) = rx.try_recv() {
            assert_eq!(total, 6);
            seen.push(completed);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let hub = ProgressHub::new(4);
        hub.publish(ProgressEvent::Finished {
            status: SessionStatus::Completed,
        });
    }
}
