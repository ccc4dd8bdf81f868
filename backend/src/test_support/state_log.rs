//! Doubles that note the bus state at every connect attempt and backoff.
//!
//! `watch` receivers only keep the latest value, so a reconnect that passes
//! through several states between polls looks like a single change. Logging
//! from inside the broker and sleeper captures each step in order.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::domain::ports::{BrokerError, BrokerSession, MessageBroker};
use crate::domain::{ConnectionState, EventBus, ReconnectSleeper};
use crate::test_support::in_memory_broker::InMemoryBroker;

/// Ordered record of the states a bus was in at each reconnect step.
#[derive(Debug, Default)]
pub struct StateLog {
    source: OnceLock<watch::Receiver<ConnectionState>>,
    states: Mutex<Vec<ConnectionState>>,
}

impl StateLog {
    /// Start logging the state of `bus`.
    pub fn attach(&self, bus: &EventBus) {
        if self.source.set(bus.state_changes()).is_err() {
            panic!("state log already attached");
        }
    }

    /// States logged so far, oldest first.
    pub fn states(&self) -> Vec<ConnectionState> {
        match self.states.lock() {
            Ok(states) => states.clone(),
            Err(_) => panic!("state log mutex"),
        }
    }

    fn record(&self) {
        let Some(source) = self.source.get() else {
            return;
        };
        let state = *source.borrow();
        match self.states.lock() {
            Ok(mut states) => states.push(state),
            Err(_) => panic!("state log mutex"),
        }
    }
}

/// [`InMemoryBroker`] that logs the bus state before every connect attempt.
#[derive(Clone)]
pub struct StateLoggingBroker {
    inner: InMemoryBroker,
    log: Arc<StateLog>,
}

impl StateLoggingBroker {
    /// Wrap `inner`, logging into `log`.
    pub fn new(inner: InMemoryBroker, log: Arc<StateLog>) -> Self {
        Self { inner, log }
    }
}

#[async_trait]
impl MessageBroker for StateLoggingBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        self.log.record();
        self.inner.connect().await
    }
}

/// Sleeper that logs the bus state and returns immediately.
#[derive(Debug, Clone)]
pub struct StateLoggingSleeper(Arc<StateLog>);

impl StateLoggingSleeper {
    /// Log into `log` on every sleep.
    pub fn new(log: Arc<StateLog>) -> Self {
        Self(log)
    }
}

#[async_trait]
impl ReconnectSleeper for StateLoggingSleeper {
    async fn sleep(&self, _duration: Duration) {
        self.0.record();
        tokio::task::yield_now().await;
    }
}
