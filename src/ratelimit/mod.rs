//! Rate limiting for the socket front door.
//!
//! Not part of spec.md's core contracts, but an ambient concern the core
//! still needs: an unauthenticated flood of upgrade attempts or a single
//! chatty connection sending faster than the Session can usefully process
//! both degrade every other participant's experience. Grounded directly in
//! this codebase's `ipc::mod`'s `ConnectionRateLimiter`/`RpcRateLimiter` —
//! same sliding-window-per-IP and tumbling-window-per-connection shapes,
//! generalized to use `CoreConfig`'s bounds instead of the sibling daemon's
//! hardcoded constants.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Per-IP connection attempt tracker. One instance shared across all accept
/// iterations of the WebSocket listener.
pub struct ConnectionRateLimiter {
    max_per_min: usize,
    connections: HashMap<IpAddr, Vec<Instant>>,
}

impl ConnectionRateLimiter {
    pub fn new(max_per_min: usize) -> Self {
        Self {
            max_per_min,
            connections: HashMap::new(),
        }
    }

    /// Returns `true` if a new connection from `ip` should be allowed.
    pub fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - Duration::from_secs(60);

        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);

        if timestamps.len() >= self.max_per_min {
            return false;
        }
        timestamps.push(now);
        true
    }
}

/// Per-connection inbound message rate tracker, tumbling window reset every
/// second. One instance per live socket.
pub struct MessageRateLimiter {
    max_per_sec: u32,
    count: u32,
    window_start: Instant,
}

impl MessageRateLimiter {
    pub fn new(max_per_sec: u32) -> Self {
        Self {
            max_per_sec,
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Returns `true` if the message currently being processed is within
    /// the connection's budget for this window.
    pub fn check(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start).as_secs() >= 1 {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= self.max_per_sec
    }
}
