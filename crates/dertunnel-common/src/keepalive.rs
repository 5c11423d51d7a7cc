use std::time::Duration;

use tokio::time::Instant;

/// Ping/pong timing shared by both ends of a control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Time between PINGs
    pub interval: Duration,
    /// How long to wait for the matching PONG
    pub pong_timeout: Duration,
    /// Consecutive missed PONGs before the peer is considered dead
    pub max_missed: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(7),
            max_missed: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Alive,
    Dead,
}

/// Keepalive bookkeeping owned by a connection task
///
/// The task selects on [`Keepalive::next_ping`] and [`Keepalive::pong_deadline`]
/// and reports back what happened.
#[derive(Debug)]
pub struct Keepalive {
    config: KeepaliveConfig,
    next_ping: Instant,
    pong_deadline: Option<Instant>,
    missed: u32,
}

impl Keepalive {
    pub fn new(config: KeepaliveConfig) -> Self {
        Self {
            config,
            next_ping: Instant::now() + config.interval,
            pong_deadline: None,
            missed: 0,
        }
    }

    pub fn next_ping(&self) -> Instant {
        self.next_ping
    }

    pub fn pong_deadline(&self) -> Option<Instant> {
        self.pong_deadline
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Record a PING just written; only the oldest unanswered one is timed
    pub fn ping_sent(&mut self) {
        let now = Instant::now();
        self.next_ping = now + self.config.interval;
        if self.pong_deadline.is_none() {
            self.pong_deadline = Some(now + self.config.pong_timeout);
        }
    }

    pub fn pong_received(&mut self) {
        self.pong_deadline = None;
        self.missed = 0;
    }

    /// Record an expired PONG deadline
    pub fn pong_overdue(&mut self) -> PeerStatus {
        self.pong_deadline = None;
        self.missed += 1;
        if self.missed >= self.config.max_missed {
            PeerStatus::Dead
        } else {
            PeerStatus::Alive
        }
    }
}
