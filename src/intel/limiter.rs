//! Per-source query quotas
//!
//! Each external source carries its own per-minute and daily budgets.
//! Rejection is not an error; the aggregator degrades to cached data.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sliding-window call counter for one budget
#[derive(Debug, Default)]
struct Budget {
    calls: VecDeque<DateTime<Utc>>,
}

impl Budget {
    fn would_exceed(&mut self, now: DateTime<Utc>, window: Duration, limit: u32) -> bool {
        let cutoff = now - window;
        while let Some(front) = self.calls.front() {
            if *front <= cutoff {
                self.calls.pop_front();
            } else {
                break;
            }
        }
        self.calls.len() >= limit as usize
    }

    fn record(&mut self, now: DateTime<Utc>) {
        self.calls.push_back(now);
    }
}

/// Token-bucket style limiter scoped to one reputation source.
///
/// Safe under concurrent lookups for different IPs hitting the same source;
/// the two budgets are checked and consumed under one lock.
pub struct QuotaLimiter {
    per_minute: u32,
    per_day: u32,
    budgets: Mutex<(Budget, Budget)>,
    rejections: AtomicU64,
}

impl QuotaLimiter {
    pub fn new(per_minute: u32, per_day: u32) -> Self {
        Self {
            per_minute,
            per_day,
            budgets: Mutex::new((Budget::default(), Budget::default())),
            rejections: AtomicU64::new(0),
        }
    }

    /// Consume one call from both budgets, or reject without consuming
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Utc::now())
    }

    /// Testing seam: acquire at an explicit instant
    pub fn try_acquire_at(&self, now: DateTime<Utc>) -> bool {
        let mut budgets = self.budgets.lock();
        let (minute, day) = &mut *budgets;

        if minute.would_exceed(now, Duration::minutes(1), self.per_minute)
            || day.would_exceed(now, Duration::days(1), self.per_day)
        {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        minute.record(now);
        day.record(now);
        true
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}
