//! Integration tests for the transfer window and the worker threads
//!
//! Covers:
//! - Slot reuse and submission order of a multi-buffer window
//! - Window bookkeeping under random completion patterns
//! - Verified loop tests end to end against the mock device

use bench::config::BenchConfig;
use bench::device::EndpointInfo;
use bench::pipeline::{EndpointTarget, PipelineWindow, Reaped};
use bench::runner::{self, RunningTest};
use bench::stats;
use bench::verify::fill_pattern;
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use xfer::test_utils::{EndpointBehavior, MockDevice, MockEvents};
use xfer::{EndpointKind, Session, SessionOptions, TransferStatus};

fn session_with(events: &Arc<MockEvents>) -> Session {
    let options = SessionOptions {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    Session::new(events.clone(), options)
}

fn bulk_target(session: &Session, device: &Arc<MockDevice>, endpoint: u8) -> EndpointTarget {
    EndpointTarget {
        session: session.clone(),
        device: device.clone(),
        kind: EndpointKind::Bulk,
        endpoint,
        iso_packet_size: 0,
    }
}

mod window {
    use super::*;

    #[test]
    fn test_three_buffer_window_reuses_slots() {
        let events = Arc::new(MockEvents::new());
        let device = Arc::new(MockDevice::new(&events));
        let session = session_with(&events);
        let mut window = PipelineWindow::new(
            bulk_target(&session, &device, 0x81),
            3,
            512,
            Duration::from_secs(1),
        );

        let first = window.pump().unwrap();
        assert_eq!(first, Reaped { slot: 0, length: 512 });
        assert_eq!(device.allocations(), 3);
        assert_eq!(device.submissions(0x81), 3);
        assert_eq!(window.outstanding(), 2);
        assert_eq!(window.next_index(), 0);
        assert_eq!(window.wait_index(), 1);

        let second = window.pump().unwrap();
        assert_eq!(second, Reaped { slot: 1, length: 512 });
        assert_eq!(device.allocations(), 3);
        assert_eq!(device.submissions(0x81), 4);
        assert_eq!(window.next_index(), 1);
        assert_eq!(window.wait_index(), 2);

        window.drain(false);
        assert_eq!(device.frees(), 3);
        assert_eq!(session.event_thread().fly_count(), 0);
    }

    #[test]
    fn test_short_completion_reports_length() {
        let events = Arc::new(MockEvents::new());
        let device = Arc::new(MockDevice::new(&events));
        device.set_behavior(0x81, EndpointBehavior::CompleteShort(100));
        let session = session_with(&events);
        let mut window = PipelineWindow::new(
            bulk_target(&session, &device, 0x81),
            2,
            512,
            Duration::from_secs(1),
        );

        let reaped = window.pump().unwrap();
        assert_eq!(reaped.length, 100);
        assert_eq!(window.data(reaped).len(), 100);
    }

    #[test]
    fn test_failed_transfer_frees_its_slot() {
        let events = Arc::new(MockEvents::new());
        let device = Arc::new(MockDevice::new(&events));
        device.set_behavior(0x02, EndpointBehavior::Fail(TransferStatus::Stall));
        let session = session_with(&events);
        let mut window = PipelineWindow::new(
            bulk_target(&session, &device, 0x02),
            2,
            512,
            Duration::from_secs(1),
        );

        assert!(window.pump().is_err());
        assert!(!window.is_in_use(0));
        assert_eq!(window.outstanding(), 1);
        assert_eq!(window.wait_index(), 1);
    }

    #[test]
    fn test_prefilled_buffers_are_written() {
        let events = Arc::new(MockEvents::new());
        let device = Arc::new(MockDevice::new(&events));
        let session = session_with(&events);
        let buffers = runner::prefilled_buffers(2, 128, 64);
        let mut window = PipelineWindow::with_buffers(
            bulk_target(&session, &device, 0x02),
            buffers.clone(),
            128,
            Duration::from_secs(1),
        );

        let reaped = window.pump().unwrap();
        assert_eq!(window.data(reaped), &buffers[0][..]);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_window_indices_stay_consistent(
        count in 1usize..=10,
        pumps in 1usize..40,
    ) {
        let events = Arc::new(MockEvents::new());
        let device = Arc::new(MockDevice::new(&events));
        let session = session_with(&events);
        let mut window = PipelineWindow::new(
            bulk_target(&session, &device, 0x81),
            count,
            64,
            Duration::from_secs(1),
        );

        for i in 0..pumps {
            let reaped = window.pump().unwrap();
            prop_assert_eq!(reaped.slot, i % count);
            prop_assert_eq!(window.outstanding(), count - 1);
            // The reaper trails the submitter by the outstanding count
            prop_assert_eq!((window.wait_index() + window.outstanding()) % count, window.next_index());
        }

        prop_assert_eq!(device.allocations(), count);
        prop_assert_eq!(device.submissions(0x81), pumps + count - 1);
        window.drain(true);
        prop_assert_eq!(device.frees(), count);
    }
}

mod workers {
    use super::*;

    fn endpoints() -> Vec<EndpointInfo> {
        vec![
            EndpointInfo {
                address: 0x81,
                kind: EndpointKind::Bulk,
                max_packet_size: 64,
            },
            EndpointInfo {
                address: 0x01,
                kind: EndpointKind::Bulk,
                max_packet_size: 64,
            },
        ]
    }

    /// Firmware-style read data: pattern packets with a key running across transfers
    fn pattern_source(corrupt_transfer: Option<usize>) -> EndpointBehavior {
        let packets = Arc::new(AtomicUsize::new(0));
        let transfers = Arc::new(AtomicUsize::new(0));
        EndpointBehavior::CompleteWith(Arc::new(move |buffer: &mut [u8]| {
            fill_pattern(buffer, 64);
            for packet in buffer.chunks_exact_mut(64) {
                packet[1] = packets.fetch_add(1, Ordering::SeqCst) as u8;
            }
            if corrupt_transfer == Some(transfers.fetch_add(1, Ordering::SeqCst)) {
                buffer[10] ^= 0xFF;
            }
            buffer.len()
        }))
    }

    fn run_loop_test(behavior: EndpointBehavior) -> (Arc<MockDevice>, Vec<stats::TransferStats>) {
        let events = Arc::new(MockEvents::new());
        let device = Arc::new(MockDevice::new(&events));
        device.set_behavior(0x81, behavior);
        let session = session_with(&events);

        let mut config = BenchConfig::default();
        config.test.buffer_size = 512;
        config.test.buffer_count = 3;
        config.test.verify = true;

        let plan = runner::plan_test(&config, &session, device.clone(), &endpoints()).unwrap();
        let mut test = RunningTest::start(plan, &config).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(!test.any_stopped());
        test.stop(true);

        let snapshots = test
            .stats()
            .iter()
            .map(|(_, shared)| stats::lock(shared).clone())
            .collect();
        assert_eq!(session.event_thread().fly_count(), 0);
        (device, snapshots)
    }

    #[test]
    fn test_verified_loop_has_no_mismatches() {
        let (device, snapshots) = run_loop_test(pattern_source(None));
        let read = &snapshots[0];
        let write = &snapshots[1];

        assert!(read.total_transferred > 0);
        assert!(write.total_transferred > 0);
        assert_eq!(read.mismatched_packets, 0);
        assert_eq!(read.total_errors, 0);
        assert_eq!(device.allocations(), device.frees());
    }

    #[test]
    fn test_corrupted_transfer_counts_one_mismatch() {
        let (_, snapshots) = run_loop_test(pattern_source(Some(5)));
        assert_eq!(snapshots[0].mismatched_packets, 1);
        assert_eq!(snapshots[1].mismatched_packets, 0);
    }
}
