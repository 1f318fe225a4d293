//! Running transfer statistics for one endpoint

use common::metrics::bytes_per_second;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Transfers counted before the clock starts
const SYNC_TRANSFERS: i64 = 2;

/// Statistics shared between a worker and the display
pub type SharedStats = Arc<Mutex<TransferStats>>;

pub fn shared() -> SharedStats {
    Arc::new(Mutex::new(TransferStats::new()))
}

/// Lock shared statistics, recovering from a poisoned lock
pub fn lock(stats: &SharedStats) -> MutexGuard<'_, TransferStats> {
    stats.lock().unwrap_or_else(|e| e.into_inner())
}

/// Counters and timestamps for one endpoint
///
/// The first two transfers after a reset only synchronize; the clock starts
/// on the third so setup latency does not skew the averages.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferStats {
    pub start: Option<Instant>,
    pub last_start: Option<Instant>,
    pub last: Option<Instant>,
    pub total_transferred: u64,
    pub last_transferred: u64,
    pub packets: i64,
    pub short_transfers: u32,
    pub total_timeouts: u32,
    pub running_timeouts: u32,
    pub total_errors: u32,
    pub running_errors: u32,
    pub mismatched_packets: u64,
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start: None,
            last_start: None,
            last: None,
            total_transferred: 0,
            last_transferred: 0,
            packets: -SYNC_TRANSFERS,
            short_transfers: 0,
            total_timeouts: 0,
            running_timeouts: 0,
            total_errors: 0,
            running_errors: 0,
            mismatched_packets: 0,
        }
    }

    /// Restart the averages
    ///
    /// Error totals are kept; the running timeout count is cleared.
    pub fn reset(&mut self) {
        self.start = None;
        self.total_transferred = 0;
        self.packets = -SYNC_TRANSFERS;
        self.last = None;
        self.running_timeouts = 0;
    }

    /// Account one finished transfer of `len` bytes (0 for a failed one)
    pub fn record_transfer(&mut self, len: usize, now: Instant) {
        if self.start.is_none() && self.packets >= 0 {
            self.start = Some(now);
            self.last_start = Some(now);
            self.last = Some(now);
            self.last_transferred = 0;
            self.total_transferred = 0;
            self.packets = 0;
            return;
        }

        if self.last_start.is_none() {
            self.last_start = self.last;
            self.last_transferred = 0;
        }
        self.last = Some(now);
        self.last_transferred += len as u64;
        self.total_transferred += len as u64;
        self.packets += 1;
    }

    pub fn record_timeout(&mut self) {
        self.total_timeouts += 1;
        self.running_timeouts += 1;
    }

    pub fn record_error(&mut self) {
        self.total_errors += 1;
        self.running_errors += 1;
    }

    pub fn record_short(&mut self) {
        self.short_transfers += 1;
    }

    pub fn record_mismatches(&mut self, packets: usize) {
        self.mismatched_packets += packets as u64;
    }

    /// A full-length transfer clears the consecutive failure counts
    pub fn clear_running(&mut self) {
        self.running_errors = 0;
        self.running_timeouts = 0;
    }

    /// Still waiting for the clock to start
    pub fn is_synchronizing(&self) -> bool {
        match (self.start, self.last) {
            (Some(start), Some(last)) => start >= last,
            _ => true,
        }
    }

    /// Time between the first and the latest timed transfer
    pub fn elapsed(&self) -> Option<Duration> {
        match (self.start, self.last) {
            (Some(start), Some(last)) if start < last => Some(last - start),
            _ => None,
        }
    }

    pub fn average_bytes_per_sec(&self) -> f64 {
        match self.elapsed() {
            Some(elapsed) if self.total_transferred > 0 => {
                bytes_per_second(self.total_transferred, elapsed)
            }
            _ => 0.0,
        }
    }

    /// Rate since the last status line
    pub fn current_bytes_per_sec(&self) -> f64 {
        if self.start.is_none() || self.last_transferred == 0 {
            return 0.0;
        }
        match (self.last_start, self.last) {
            (Some(last_start), Some(last)) if last > last_start => {
                bytes_per_second(self.last_transferred, last - last_start)
            }
            _ => 0.0,
        }
    }

    /// Copy for a status line and open a new current-rate window
    pub fn take_status(&mut self) -> TransferStats {
        let snapshot = self.clone();
        if !snapshot.is_synchronizing() {
            self.last_start = None;
        }
        snapshot
    }
}
