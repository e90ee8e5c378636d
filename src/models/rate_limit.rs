use std::time::Duration;

/// Capacity and refill window of one independently keyed limiter.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub name: &'static str,
    pub capacity: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(name: &'static str, capacity: u32, window: Duration) -> Self {
        Self {
            name,
            capacity,
            window,
        }
    }
}
