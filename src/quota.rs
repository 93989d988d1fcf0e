//! Per-user daily file quotas.
//!
//! ## Reservation, not record
//!
//! A slot is taken *before* the document is downloaded. Two files sent by the
//! same user at the same moment therefore cannot both squeeze through the last
//! free slot. If the download or store step fails afterwards, the reservation
//! is rolled back, either explicitly with [`QuotaTracker::rollback`] or by
//! dropping the [`Reservation`] without committing it.
//!
//! ## Lazy reset
//!
//! Counters are cleared by the first request that observes the UTC day
//! boundary has passed, not by a background timer. A user who was idle across
//! midnight sees a fresh allowance on their next request.
//!
//! The reset takes the day lock exclusively while every reservation and
//! release holds it shared, so no slot is taken or given back half-way
//! through a reset. A reservation remembers the day it was taken on and is
//! not released into a later day.

use crate::config::MergeConfig;
use crate::error::MergeError;
use crate::types::UserId;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tracing::{debug, info};

const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real UTC clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock moved by hand.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Unix timestamp of the UTC midnight that starts `t`'s day.
fn midnight_of(t: DateTime<Utc>) -> i64 {
    let secs = t.timestamp();
    secs - secs.rem_euclid(SECS_PER_DAY)
}

/// Snapshot of a user's allowance, as shown by `/limits`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub used: u32,
    pub remaining: u32,
    pub max: u32,
    pub max_file_size_bytes: u64,
    pub resets_in: Duration,
}

/// Counters of the current day, shared with outstanding reservations.
#[derive(Debug)]
struct Ledger {
    /// Unix seconds of the midnight the counters were last cleared at.
    day: RwLock<i64>,
    counters: DashMap<UserId, u32>,
}

impl Ledger {
    fn day(&self) -> RwLockReadGuard<'_, i64> {
        self.day.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give back one slot taken on `day`. Never goes below zero.
    fn release(&self, user: UserId, day: i64) {
        let current = self.day();
        if *current != day {
            debug!(user = %user, "Reservation outlived its day, not released");
            return;
        }
        if let Some(mut used) = self.counters.get_mut(&user) {
            *used = used.saturating_sub(1);
            debug!(user = %user, used = *used, "Released quota slot");
        }
    }
}

/// Tracks files accepted per user since the last UTC midnight.
pub struct QuotaTracker {
    ledger: Arc<Ledger>,
    max_files_per_day: u32,
    max_file_size_bytes: u64,
    clock: Arc<dyn Clock>,
}

impl QuotaTracker {
    pub fn new(max_files_per_day: u32, max_file_size_bytes: u64) -> Self {
        Self::with_clock(max_files_per_day, max_file_size_bytes, Arc::new(SystemClock))
    }

    pub fn with_clock(
        max_files_per_day: u32,
        max_file_size_bytes: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ledger = Ledger {
            day: RwLock::new(midnight_of(clock.now())),
            counters: DashMap::new(),
        };
        Self {
            ledger: Arc::new(ledger),
            max_files_per_day,
            max_file_size_bytes,
            clock,
        }
    }

    pub fn from_config(config: &MergeConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_clock(config.max_files_per_day, config.max_file_size_bytes, clock)
    }

    /// Check the limits for one more file of `size_bytes` and, if allowed,
    /// take a slot.
    ///
    /// The size check runs first and never touches the counter.
    pub fn check_and_reserve(&self, user: UserId, size_bytes: u64) -> Result<Reservation, MergeError> {
        if size_bytes > self.max_file_size_bytes {
            return Err(MergeError::FileTooLarge {
                size: size_bytes,
                max: self.max_file_size_bytes,
            });
        }

        let now = self.clock.now();
        let day = self.current_day(now);

        // The entry guard holds the shard lock: check and increment are atomic per user.
        let mut used = self.ledger.counters.entry(user).or_insert(0);
        if *used >= self.max_files_per_day {
            let used_now = *used;
            drop(used);
            debug!(user = %user, used = used_now, "Quota exhausted");
            return Err(MergeError::QuotaExceeded {
                used: used_now,
                max: self.max_files_per_day,
                resets_in_secs: resets_in(*day, now).as_secs(),
            });
        }
        *used += 1;
        let used_now = *used;
        drop(used);

        debug!(user = %user, used = used_now, max = self.max_files_per_day, "Reserved quota slot");
        Ok(Reservation {
            ledger: Arc::clone(&self.ledger),
            day: *day,
            user,
            used: used_now,
            committed: false,
        })
    }

    /// Give back one slot of the current day. Never goes below zero.
    pub fn rollback(&self, user: UserId) {
        let day = *self.current_day(self.clock.now());
        self.ledger.release(user, day);
    }

    /// Current allowance of `user`, after applying a pending reset.
    pub fn usage(&self, user: UserId) -> QuotaUsage {
        let now = self.clock.now();
        let day = self.current_day(now);
        let used = self.ledger.counters.get(&user).map(|c| *c).unwrap_or(0);
        QuotaUsage {
            used,
            remaining: self.max_files_per_day.saturating_sub(used),
            max: self.max_files_per_day,
            max_file_size_bytes: self.max_file_size_bytes,
            resets_in: resets_in(*day, now),
        }
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_bytes
    }

    /// Shared guard on the day containing `now`, resetting the counters
    /// first if that day has not started yet.
    fn current_day(&self, now: DateTime<Utc>) -> RwLockReadGuard<'_, i64> {
        let day = self.ledger.day();
        if now.timestamp() < *day + SECS_PER_DAY {
            return day;
        }
        drop(day);
        {
            let mut day = self
                .ledger
                .day
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            // Another request may have reset while we waited.
            if now.timestamp() >= *day + SECS_PER_DAY {
                let users = self.ledger.counters.len();
                self.ledger.counters.clear();
                *day = midnight_of(now);
                info!(users, "Daily quotas reset");
            }
        }
        self.ledger.day()
    }
}

fn resets_in(day: i64, now: DateTime<Utc>) -> Duration {
    let secs = (day + SECS_PER_DAY - now.timestamp()).clamp(0, SECS_PER_DAY);
    Duration::from_secs(secs as u64)
}

/// A reserved quota slot.
///
/// Dropping it without [`commit`](Reservation::commit) gives the slot back,
/// so an early return or a cancelled download never leaks quota.
#[derive(Debug)]
#[must_use = "dropping a reservation releases the slot"]
pub struct Reservation {
    ledger: Arc<Ledger>,
    /// Midnight of the day the slot was taken on.
    day: i64,
    user: UserId,
    used: u32,
    committed: bool,
}

impl Reservation {
    /// Counter value including this reservation.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Keep the slot.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.ledger.release(self.user, self.day);
        }
    }
}
