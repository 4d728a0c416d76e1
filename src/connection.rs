//! Supervised connection establishment with a bounded retry budget
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::state::{Dependency, SharedState};

pub const CONNECT_ATTEMPTS: u32 = 10;
pub const CONNECT_DELAY: Duration = Duration::from_secs(5);
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// pause between two attempts
    pub delay: Duration,
    /// upper bound for a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: CONNECT_ATTEMPTS,
            delay: CONNECT_DELAY,
            attempt_timeout: ATTEMPT_TIMEOUT,
        }
    }
}

/// Opens one connection to an external dependency
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Send + 'static;

    fn dependency(&self) -> Dependency;

    /// Address for logs
    fn target(&self) -> String;

    async fn connect(&self) -> anyhow::Result<Self::Connection>;
}

/// Owns the connectivity flag of one dependency
pub struct ConnectionManager<C: Connector> {
    connector: C,
    policy: RetryPolicy,
    state: Arc<SharedState>,
    cancel: CancellationToken,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        connector: C,
        policy: RetryPolicy,
        state: Arc<SharedState>,
        cancel: CancellationToken,
    ) -> Self {
        ConnectionManager {
            connector,
            policy,
            state,
            cancel,
        }
    }

    /// Tries up to `policy.attempts` times. `None` leaves the dependency marked
    /// disconnected; calling again starts a fresh budget.
    pub async fn connect(&self) -> Option<C::Connection> {
        let dependency = self.connector.dependency();
        let target = self.connector.target();
        for attempt in 1..=self.policy.attempts {
            if self.cancel.is_cancelled() {
                break;
            }
            info!(%dependency, %target, attempt, "connecting");
            let result = match timeout(self.policy.attempt_timeout, self.connector.connect()).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "timed out after {:?}",
                    self.policy.attempt_timeout
                )),
            };
            match result {
                Ok(connection) => {
                    self.state.set_connected(dependency, true);
                    info!(%dependency, "connected");
                    return Some(connection);
                }
                Err(e) => {
                    error!(%dependency, error = %format_args!("{e:#}"), "connection failed");
                    self.state.set_connected(dependency, false);
                    if attempt < self.policy.attempts {
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = sleep(self.policy.delay) => {}
                        }
                    }
                }
            }
        }
        None
    }

    pub fn mark_disconnected(&self) {
        self.state.set_connected(self.connector.dependency(), false);
    }

    pub fn dependency(&self) -> Dependency {
        self.connector.dependency()
    }
}
