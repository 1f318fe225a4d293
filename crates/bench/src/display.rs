//! Console output and keyboard commands

use crate::config::{BenchConfig, TransferMode};
use crate::device::EndpointInfo;
use crate::stats::TransferStats;
use common::metrics::{format_bytes, format_bytes_per_second};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::debug;
use xfer::EndpointKind;

/// Keyboard commands accepted while a test runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    TestInfo,
    TransferInfo,
    ResetAverages,
    Other,
}

impl Command {
    pub fn from_char(c: char) -> Self {
        match c.to_ascii_lowercase() {
            'q' => Command::Quit,
            't' => Command::TestInfo,
            'i' => Command::TransferInfo,
            'r' => Command::ResetAverages,
            _ => Command::Other,
        }
    }
}

pub const KEY_HELP: &str = "\
While the test is running:
Press 'Q' to quit
Press 'T' for test details
Press 'I' for status information
Press 'R' to reset averages";

fn kind_name(kind: EndpointKind) -> &'static str {
    match kind {
        EndpointKind::Bulk => "BULK",
        EndpointKind::Interrupt => "INTERRUPT",
        EndpointKind::Isochronous => "ISOCHRONOUS",
    }
}

pub fn format_test_info(config: &BenchConfig, mode: TransferMode) -> String {
    let device = &config.device;
    let test = &config.test;
    let mut out = String::new();

    let _ = writeln!(out, "{} Test Information", test.test_type);
    let _ = writeln!(out, "\tVid / Pid       : {:04X}h / {:04X}h", device.vid, device.pid);
    let _ = writeln!(out, "\tInterface #     : {:02X}h", device.interface);
    let _ = writeln!(out, "\tTransfer Mode   : {}", mode);
    let _ = writeln!(out, "\tBuffer Size     : {}", test.buffer_size);
    let _ = writeln!(out, "\tBuffer Count    : {}", test.buffer_count);
    let _ = writeln!(out, "\tDisplay Refresh : {} (ms)", test.refresh_ms);
    let _ = writeln!(out, "\tTransfer Timeout: {} (ms)", test.timeout_ms);
    let _ = writeln!(out, "\tRetry Count     : {}", test.retry);
    let _ = writeln!(
        out,
        "\tVerify Data     : {}{}",
        if test.verify { "On" } else { "Off" },
        if test.verify && test.verify_details {
            " (Detailed)"
        } else {
            ""
        }
    );
    out
}

/// Endpoint header plus totals once the clock has started
pub fn format_transfer_info(endpoint: &EndpointInfo, stats: &TransferStats) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "[{:#04x}] {} wMaxPacketSize = 0x{:04X} ({} x {}) [{}]",
        endpoint.address,
        if endpoint.is_in() {
            "Read   (IN)"
        } else {
            "Write (OUT)"
        },
        endpoint.max_packet_size,
        endpoint.packet_bytes(),
        endpoint.transactions(),
        kind_name(endpoint.kind)
    );

    if stats.start.is_none() {
        return out;
    }

    let _ = writeln!(
        out,
        "\tTotal Bytes     : {} ({})",
        stats.total_transferred,
        format_bytes(stats.total_transferred)
    );
    let _ = writeln!(out, "\tTotal Transfers : {}", stats.packets);
    if stats.short_transfers > 0 {
        let _ = writeln!(out, "\tShort Transfers : {}", stats.short_transfers);
    }
    if stats.total_timeouts > 0 {
        let _ = writeln!(out, "\tTimeout Errors  : {}", stats.total_timeouts);
    }
    if stats.total_errors > 0 {
        let _ = writeln!(out, "\tOther Errors    : {}", stats.total_errors);
    }
    if stats.mismatched_packets > 0 {
        let _ = writeln!(out, "\tData Mismatches : {}", stats.mismatched_packets);
    }
    let average = stats.average_bytes_per_sec();
    let _ = writeln!(
        out,
        "\tAvg. Bytes/sec  : {:.2} ({})",
        average,
        format_bytes_per_second(average)
    );
    if let Some(elapsed) = stats.elapsed() {
        let _ = writeln!(
            out,
            "\tElapsed Time    : {:.2} seconds",
            elapsed.as_secs_f64()
        );
    }
    out
}

/// One status line from a snapshot taken with `TransferStats::take_status`
pub fn format_running_status(stats: &TransferStats) -> String {
    if stats.is_synchronizing() {
        return format!("Synchronizing {}..", stats.packets.abs());
    }
    format!(
        "Avg. Bytes/s: {:.2} Transfers: {} Bytes/s: {:.2}",
        stats.average_bytes_per_sec(),
        stats.packets,
        stats.current_bytes_per_sec()
    )
}

/// Keyboard input
///
/// Raw mode is only held while waiting for a key, so regular output keeps
/// its line endings. Without a terminal no keys are ever reported.
pub struct Console {
    interactive: bool,
}

impl Console {
    pub fn new() -> Self {
        let interactive = match terminal::enable_raw_mode() {
            Ok(()) => terminal::disable_raw_mode().is_ok(),
            Err(e) => {
                debug!("Keyboard input unavailable: {}", e);
                false
            }
        };
        Self { interactive }
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Wait up to `timeout` for a key press
    ///
    /// Returns after `timeout` when nothing was pressed, so this doubles as
    /// the refresh sleep.
    pub fn poll_key(&self, timeout: Duration) -> Option<char> {
        if !self.interactive {
            std::thread::sleep(timeout);
            return None;
        }
        self.with_raw_mode(|| {
            let deadline = std::time::Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                if !event::poll(remaining).unwrap_or(false) {
                    return None;
                }
                if let Some(c) = Self::read_char() {
                    // Only one key at a time
                    while event::poll(Duration::ZERO).unwrap_or(false) {
                        let _ = event::read();
                    }
                    return Some(c);
                }
                if remaining.is_zero() {
                    return None;
                }
            }
        })
    }

    /// Block until a key is pressed
    pub fn wait_key(&self) -> Option<char> {
        if !self.interactive {
            return None;
        }
        self.with_raw_mode(|| {
            while event::poll(Duration::ZERO).unwrap_or(false) {
                let _ = event::read();
            }
            loop {
                match event::poll(Duration::from_secs(3600)) {
                    Ok(true) => {
                        if let Some(c) = Self::read_char() {
                            return Some(c);
                        }
                    }
                    Ok(false) => {}
                    Err(_) => return None,
                }
            }
        })
    }

    fn read_char() -> Option<char> {
        match event::read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => match key.code {
                KeyCode::Char(c) => Some(c),
                KeyCode::Enter => Some('\n'),
                KeyCode::Esc => Some('q'),
                _ => None,
            },
            _ => None,
        }
    }

    fn with_raw_mode<T>(&self, f: impl FnOnce() -> Option<T>) -> Option<T> {
        if terminal::enable_raw_mode().is_err() {
            return None;
        }
        let result = f();
        let _ = terminal::disable_raw_mode();
        result
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn endpoint(address: u8) -> EndpointInfo {
        EndpointInfo {
            address,
            kind: EndpointKind::Bulk,
            max_packet_size: 512,
        }
    }

    #[test]
    fn test_commands() {
        assert_eq!(Command::from_char('Q'), Command::Quit);
        assert_eq!(Command::from_char('q'), Command::Quit);
        assert_eq!(Command::from_char('t'), Command::TestInfo);
        assert_eq!(Command::from_char('I'), Command::TransferInfo);
        assert_eq!(Command::from_char('r'), Command::ResetAverages);
        assert_eq!(Command::from_char('x'), Command::Other);
    }

    #[test]
    fn test_running_status_synchronizing() {
        let stats = TransferStats::new();
        assert_eq!(format_running_status(&stats), "Synchronizing 2..");
    }

    #[test]
    fn test_running_status_rates() {
        let mut stats = TransferStats::new();
        let t0 = Instant::now();
        for _ in 0..3 {
            stats.record_transfer(512, t0);
        }
        stats.record_transfer(512, t0 + Duration::from_secs(1));
        assert_eq!(
            format_running_status(&stats),
            "Avg. Bytes/s: 512.00 Transfers: 1 Bytes/s: 512.00"
        );
    }

    #[test]
    fn test_transfer_info_header_only_before_start() {
        let info = format_transfer_info(&endpoint(0x81), &TransferStats::new());
        assert_eq!(
            info,
            "[0x81] Read   (IN) wMaxPacketSize = 0x0200 (512 x 1) [BULK]\n"
        );
    }

    #[test]
    fn test_transfer_info_counters() {
        let mut stats = TransferStats::new();
        let t0 = Instant::now();
        for _ in 0..3 {
            stats.record_transfer(512, t0);
        }
        stats.record_transfer(512, t0 + Duration::from_secs(2));
        stats.record_timeout();

        let info = format_transfer_info(&endpoint(0x02), &stats);
        assert!(info.starts_with("[0x02] Write (OUT)"));
        assert!(info.contains("Total Bytes     : 512 (512 B)"));
        assert!(info.contains("Avg. Bytes/sec  : 256.00 (256 B/s)"));
        assert!(info.contains("Timeout Errors  : 1"));
        assert!(!info.contains("Short Transfers"));
        assert!(!info.contains("Other Errors"));
        assert!(info.contains("Elapsed Time    : 2.00 seconds"));
    }

    #[test]
    fn test_test_info() {
        let mut config = BenchConfig::default();
        config.test.verify = true;
        config.test.verify_details = true;
        let info = format_test_info(&config, TransferMode::Async);
        assert!(info.starts_with("Loop Test Information\n"));
        assert!(info.contains("Vid / Pid       : 0666h / 0001h"));
        assert!(info.contains("Verify Data     : On (Detailed)"));
    }
}
