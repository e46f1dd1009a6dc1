//! Configuration for the queue engine.

use std::time::Duration;

/// Options for [`QueueService`](crate::QueueService).
#[derive(Debug, Clone)]
pub struct Config {
    /// Period between automatic cleanings of all known queues and consumer
    /// groups by the background runner.
    pub clean_period: Duration,

    /// Prefix under which every key of this deployment lives. Lets several
    /// deployments share one backing store.
    pub key_prefix: String,

    /// Extra time event payloads outlive their expiration, so a consumer
    /// that receives an event right as it expires can still read it.
    pub event_ttl_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clean_period: Duration::from_secs(60),
            key_prefix: String::new(),
            event_ttl_grace: Duration::from_secs(30),
        }
    }
}
