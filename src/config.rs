use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Address to bind the south-side HTTP/SSE API to
    #[arg(long, env = "RELAY_ADDR", default_value = "0.0.0.0:9080")]
    pub addr: String,

    /// Maximum number of in-flight requests admitted at once
    #[arg(long, env = "RELAY_MAX_CONCURRENT", default_value_t = 20)]
    pub max_concurrent_requests: usize,

    /// Seconds a surviving request waits for the agent to reconnect
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_SECS", default_value_t = 180)]
    pub request_timeout_secs: u64,

    /// Heartbeat ping interval in seconds
    #[arg(long, env = "RELAY_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,
}

/// Timing and sizing constants, overridable from `Args` but otherwise fixed
/// at values tuned for a single browser-agent backend.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_concurrent_requests: usize,
    pub request_timeout: Duration,
    pub ping_interval: Duration,
    pub missed_pong_threshold: u32,
    pub backpressure_queue_size: usize,
    pub min_chunk: usize,
    pub max_buffer_time: Duration,
    pub queue_poll_interval: Duration,
}

impl RelayConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            max_concurrent_requests: args.max_concurrent_requests,
            request_timeout: Duration::from_secs(args.request_timeout_secs),
            ping_interval: Duration::from_secs(args.ping_interval_secs),
            missed_pong_threshold: 3,
            backpressure_queue_size: 5,
            min_chunk: 40,
            max_buffer_time: Duration::from_millis(500),
            queue_poll_interval: Duration::from_millis(100),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 20,
            request_timeout: Duration::from_secs(180),
            ping_interval: Duration::from_secs(30),
            missed_pong_threshold: 3,
            backpressure_queue_size: 5,
            min_chunk: 40,
            max_buffer_time: Duration::from_millis(500),
            queue_poll_interval: Duration::from_millis(100),
        }
    }
}
