use std::time::Duration;

/// Exchange, queues and routing keys of the notification retry loop.
///
/// Rejected messages on `main_queue` are dead-lettered to `exchange` under
/// `retry_routing_key`, wait `retry_ttl` in `retry_queue`, then expire back to
/// `exchange` under `main_routing_key`.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    pub exchange: String,
    pub main_queue: String,
    pub retry_queue: String,
    pub main_routing_key: String,
    pub retry_routing_key: String,
    pub retry_ttl: Duration,
    pub parking_queue: Option<String>,
}

impl TopologyConfig {
    pub fn retry_ttl_ms(&self) -> u32 {
        u32::try_from(self.retry_ttl.as_millis()).unwrap_or(u32::MAX)
    }
}
