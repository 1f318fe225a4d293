//! Data pattern generation and checking
//!
//! Every packet the firmware sends (and every packet the host writes in a
//! verified loop test) has the layout:
//!
//! ```text
//! [0] [key] 2 3 4 ... 255 1 2 3 ...
//! ```
//!
//! Byte 0 is always zero, byte 1 is a key that increments per packet, and
//! the payload counts up from 2, skipping zero when it wraps.

use tracing::warn;

/// One reference packet of the data pattern
#[derive(Debug, Clone)]
pub struct VerifyPattern {
    packet: Vec<u8>,
    details: bool,
}

/// Result of checking one received buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub packets: usize,
    pub mismatches: usize,
}

fn next_counter(value: u8) -> u8 {
    match value.wrapping_add(1) {
        0 => 1,
        v => v,
    }
}

impl VerifyPattern {
    /// Reference packet of `packet_size` bytes
    ///
    /// With `details` set, every differing byte of a bad packet is logged.
    pub fn new(packet_size: usize, details: bool) -> Self {
        let mut packet = Vec::with_capacity(packet_size);
        let mut value = 0u8;
        for _ in 0..packet_size {
            packet.push(value);
            value = next_counter(value);
        }
        Self { packet, details }
    }

    pub fn packet_size(&self) -> usize {
        self.packet.len()
    }

    /// Check `data` packet by packet
    ///
    /// The key is seeded from the first packet and then expected to
    /// increment (or restart at zero). A mismatch reseeds the key from the
    /// next packet so a single bad packet is reported once.
    pub fn verify(&self, data: &[u8]) -> VerifyReport {
        let mut report = VerifyReport::default();
        if self.packet.len() < 2 {
            return report;
        }

        let mut key = 0u8;
        let mut seed_key = true;
        let mut offset = 0;

        while data.len() - offset > 1 {
            let chunk_len = (data.len() - offset).min(self.packet.len());
            let chunk = &data[offset..offset + chunk_len];

            key = if seed_key {
                chunk[1]
            } else if chunk[1] == 0 {
                0
            } else {
                key.wrapping_add(1)
            };
            seed_key = false;

            if !self.matches(chunk, key) {
                seed_key = true;
                report.mismatches += 1;
                warn!(
                    "Data mismatch packet-index={} data-index={}",
                    report.packets, offset
                );
                if self.details {
                    self.log_differences(chunk, key);
                }
            }

            report.packets += 1;
            offset += chunk_len;
        }

        report
    }

    fn expected(&self, index: usize, key: u8) -> u8 {
        if index == 1 { key } else { self.packet[index] }
    }

    fn matches(&self, chunk: &[u8], key: u8) -> bool {
        chunk[0] == self.packet[0] && chunk[1] == key && chunk[2..] == self.packet[2..chunk.len()]
    }

    fn log_differences(&self, chunk: &[u8], key: u8) {
        for (i, &got) in chunk.iter().enumerate() {
            let expected = self.expected(i, key);
            if got != expected {
                warn!(
                    "packet-offset={} expected {:02X}h got {:02X}h",
                    i, expected, got
                );
            }
        }
    }
}

/// Fill `buffer` with consecutive pattern packets, keys starting at 0
///
/// A trailing partial packet is left untouched.
pub fn fill_pattern(buffer: &mut [u8], packet_size: usize) {
    if packet_size == 0 {
        return;
    }
    for (packet_index, packet) in buffer.chunks_exact_mut(packet_size).enumerate() {
        let mut value = 2u8;
        for (i, byte) in packet.iter_mut().enumerate() {
            *byte = match i {
                0 => 0,
                1 => (packet_index & 0xFF) as u8,
                _ => {
                    let v = value;
                    value = next_counter(value);
                    v
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_packet() {
        let pattern = VerifyPattern::new(260, false);
        assert_eq!(pattern.packet[0], 0);
        assert_eq!(pattern.packet[2], 2);
        assert_eq!(pattern.packet[255], 255);
        // Counter skips zero on wrap
        assert_eq!(pattern.packet[256], 1);
        assert_eq!(pattern.packet[259], 4);
    }

    #[test]
    fn test_fill_pattern_layout() {
        let mut buffer = vec![0xFFu8; 64 * 3];
        fill_pattern(&mut buffer, 64);
        for (i, packet) in buffer.chunks(64).enumerate() {
            assert_eq!(packet[0], 0);
            assert_eq!(packet[1], i as u8);
            assert_eq!(packet[2], 2);
            assert_eq!(packet[63], 63);
        }
    }

    #[test]
    fn test_generator_output_verifies() {
        let mut buffer = vec![0u8; 512 * 8];
        fill_pattern(&mut buffer, 512);
        let report = VerifyPattern::new(512, false).verify(&buffer);
        assert_eq!(report, VerifyReport { packets: 8, mismatches: 0 });
    }

    #[test]
    fn test_key_wraps() {
        let mut buffer = vec![0u8; 8 * 300];
        fill_pattern(&mut buffer, 8);
        assert_eq!(VerifyPattern::new(8, false).verify(&buffer).mismatches, 0);
    }

    #[test]
    fn test_bad_key_reseeds() {
        let mut buffer = vec![0u8; 16 * 4];
        fill_pattern(&mut buffer, 16);
        buffer[16 + 1] = 0x40;
        let report = VerifyPattern::new(16, true).verify(&buffer);
        // Packet 1 is bad; packet 2 reseeds and passes, packet 3 follows it
        assert_eq!(report.mismatches, 1);
    }

    #[test]
    fn test_short_tail_is_checked() {
        let mut buffer = vec![0u8; 16 * 2];
        fill_pattern(&mut buffer, 16);
        let report = VerifyPattern::new(16, false).verify(&buffer[..16 + 5]);
        assert_eq!(report, VerifyReport { packets: 2, mismatches: 0 });
    }

    #[test]
    fn test_single_byte_is_ignored() {
        let report = VerifyPattern::new(16, false).verify(&[0]);
        assert_eq!(report.packets, 0);
    }
}
