use std::{future::Future, sync::Arc, time::Duration};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, time};

use crate::error::SessionExit;

use super::state::{LivenessCounter, TripReason};

// Set to true to log every wait iteration
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

/// Timeouts and counter steps for the wait loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessPolicy {
    /// Ceiling for one wait iteration, including handling the event.
    pub hard_deadline_secs: u64,
    /// How long a single wait blocks before counting as idle.
    pub soft_poll_secs: u64,
    pub threshold: u32,
    pub idle_step: u32,
    pub trip_step: u32,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            hard_deadline_secs: 120,
            soft_poll_secs: 60,
            threshold: 7,
            idle_step: 1,
            trip_step: 8,
        }
    }
}

impl LivenessPolicy {
    pub fn hard_deadline(&self) -> Duration {
        Duration::from_secs(self.hard_deadline_secs)
    }

    pub fn soft_poll(&self) -> Duration {
        Duration::from_secs(self.soft_poll_secs)
    }
}

enum Wait {
    Event,
    Idle,
    Closed,
}

/// Owns the idle counter and drives the bounded wait loop over the inbound
/// event channel. Termination is final; there is no reconnect here.
pub struct LivenessSupervisor {
    policy: LivenessPolicy,
    counter: Arc<LivenessCounter>,
}

impl LivenessSupervisor {
    pub fn new(policy: LivenessPolicy) -> Self {
        Self {
            policy,
            counter: Arc::new(LivenessCounter::new()),
        }
    }

    /// Handle for the event handler, which resets the counter on data and
    /// trips it on transport faults.
    pub fn counter(&self) -> Arc<LivenessCounter> {
        Arc::clone(&self.counter)
    }

    pub fn trip(&self, reason: TripReason) {
        self.counter.trip(reason, self.policy.trip_step);
    }

    /// Waits for events until the counter crosses the threshold, a trip is
    /// recorded, the hard deadline fires, or `handler` fails.
    pub async fn run<E, F, Fut>(&self, events: &mut mpsc::Receiver<E>, mut handler: F) -> SessionExit
    where
        F: FnMut(E) -> Fut,
        Fut: Future<Output = Result<(), SessionExit>>,
    {
        let soft_poll = self.policy.soft_poll();
        let hard_deadline = self.policy.hard_deadline();

        loop {
            if let Some(exit) = self.counter.check(self.policy.threshold) {
                log_info!("Leaving wait loop at {}: {}", Local::now().to_rfc3339(), exit);
                return exit;
            }

            log::debug!("waiting at {}", Local::now().to_rfc3339());

            let iteration = async {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => handler(event).await.map(|_| Wait::Event),
                        None => Ok(Wait::Closed),
                    },
                    _ = time::sleep(soft_poll) => Ok(Wait::Idle),
                }
            };

            match time::timeout(hard_deadline, iteration).await {
                Err(_) => {
                    log_error!("alarm fired after {}s", hard_deadline.as_secs());
                    return SessionExit::HardDeadline(hard_deadline);
                }
                Ok(Err(exit)) => return exit,
                Ok(Ok(Wait::Event)) => {}
                Ok(Ok(Wait::Idle)) => {
                    let count = self.counter.bump(self.policy.idle_step);
                    log::debug!("no data for {}s, idle count {}", soft_poll.as_secs(), count);
                }
                Ok(Ok(Wait::Closed)) => {
                    log_error!("inbound event channel closed");
                    self.trip(TripReason::Disconnected);
                }
            }
        }
    }
}
