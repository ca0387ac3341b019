//! Tunables gathered into small config structs with sane `Default` impls
//! rather than scattered magic numbers.

use std::time::Duration;

/// Endpoint-level tunables: socket read deadline, send-queue depth, and the
/// per-datagram receive buffer size.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Socket read deadline per attempt.
    pub read_timeout: Duration,
    /// Bounded FIFO send-queue capacity.
    pub send_queue_capacity: usize,
    /// Per-datagram receive buffer size.
    pub recv_buffer_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            read_timeout: Duration::from_secs(1),
            send_queue_capacity: 100,
            recv_buffer_size: 2048,
        }
    }
}

/// Hole-punch procedure tunables.
#[derive(Debug, Clone, Copy)]
pub struct HolePunchConfig {
    pub attempts: usize,
    pub interval: Duration,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        HolePunchConfig {
            attempts: 5,
            interval: Duration::from_secs(3),
        }
    }
}
