//! Scan start rate limiting
//! The platform silently refuses scans when more than a handful are started within
//! a rolling window. This limiter keeps a ticket per issued scan and holds further
//! requests back, in arrival order, until the oldest ticket expires.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Rolling-window limiter over opaque scan requests
#[derive(Debug)]
pub struct ScanRateLimiter<R> {
    capacity: usize,
    period: Duration,
    /// Issue time of every ticket still inside the window, oldest first
    issued: VecDeque<Instant>,
    pending: VecDeque<R>,
}

impl<R> ScanRateLimiter<R> {
    pub fn new(capacity: usize, period: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            period,
            issued: VecDeque::new(),
            pending: VecDeque::new(),
        }
    }

    /// Queues `request` and returns every request that may be issued now, oldest first.
    /// Each returned request has taken a ticket.
    pub fn schedule(&mut self, request: R, now: Instant) -> Vec<R> {
        self.pending.push_back(request);
        self.release(now)
    }

    /// Retires expired tickets and hands out as many pending requests as the window allows.
    pub fn release(&mut self, now: Instant) -> Vec<R> {
        self.evict_expired(now);

        let mut ready = Vec::new();
        while self.issued.len() < self.capacity {
            let Some(request) = self.pending.pop_front() else {
                break;
            };
            self.issued.push_back(now);
            ready.push(request);
        }
        ready
    }

    /// When the next held request can go out, if any is held.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            return None;
        }
        self.issued.front().map(|oldest| *oldest + self.period)
    }

    /// Drops every held request. Tickets already issued stay counted.
    pub fn cancel_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Tickets still inside the window at `now`.
    pub fn in_flight(&self, now: Instant) -> usize {
        self.issued
            .iter()
            .filter(|issued_at| now.saturating_duration_since(**issued_at) < self.period)
            .count()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(oldest) = self.issued.front() {
            if now.saturating_duration_since(*oldest) >= self.period {
                self.issued.pop_front();
            } else {
                break;
            }
        }
    }
}
