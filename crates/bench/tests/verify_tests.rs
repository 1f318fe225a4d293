//! Integration tests for data pattern checking
//!
//! Covers:
//! - Firmware-sized buffers over many transfers
//! - Randomly corrupted packets, each reported once
//! - Arbitrary input never panicking the checker

use bench::verify::{VerifyPattern, fill_pattern};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn test_high_speed_bulk_buffers() {
    let mut buffer = vec![0u8; 512 * 128];
    fill_pattern(&mut buffer, 512);
    let pattern = VerifyPattern::new(512, false);

    for transfer in buffer.chunks(4096) {
        let report = pattern.verify(transfer);
        assert_eq!(report.packets, 8);
        assert_eq!(report.mismatches, 0);
    }
}

#[test]
fn test_random_corruption_reports_each_packet() {
    let mut rng = StdRng::seed_from_u64(0x0666);
    let packet_size = 64;
    let packets = 200;

    for _ in 0..20 {
        let mut buffer = vec![0u8; packet_size * packets];
        fill_pattern(&mut buffer, packet_size);

        let count = rng.random_range(1..10);
        let corrupted = rand::seq::index::sample(&mut rng, packets, count).into_vec();
        for &packet in &corrupted {
            let offset = rng.random_range(2..packet_size);
            let flip = rng.random_range(1..=255u8);
            buffer[packet * packet_size + offset] ^= flip;
        }

        let report = VerifyPattern::new(packet_size, false).verify(&buffer);
        assert_eq!(report.packets, packets);
        assert_eq!(report.mismatches, corrupted.len());
    }
}

#[test]
fn test_key_restart_is_accepted() {
    // A firmware reset restarts keys at zero mid-buffer
    let mut buffer = vec![0u8; 32 * 6];
    fill_pattern(&mut buffer[..32 * 3], 32);
    fill_pattern(&mut buffer[32 * 3..], 32);

    let report = VerifyPattern::new(32, false).verify(&buffer);
    assert_eq!(report.mismatches, 0);
}

#[test]
fn test_buffer_starting_mid_sequence() {
    let mut buffer = vec![0u8; 64 * 10];
    fill_pattern(&mut buffer, 64);

    // First packet seeds the key, whatever it is
    let report = VerifyPattern::new(64, false).verify(&buffer[64 * 4..]);
    assert_eq!(report.packets, 6);
    assert_eq!(report.mismatches, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_arbitrary_data_is_counted(
        data in proptest::collection::vec(any::<u8>(), 0..2048),
        packet_size in 2usize..600,
    ) {
        let report = VerifyPattern::new(packet_size, false).verify(&data);
        prop_assert!(report.mismatches <= report.packets);
        // Every chunk is checked except a lone trailing byte
        let expected = if data.len() % packet_size == 1 {
            data.len() / packet_size
        } else {
            data.len().div_ceil(packet_size)
        };
        prop_assert_eq!(report.packets, expected);
    }
}
