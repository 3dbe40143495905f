//! Classification of response frames coming back from the chips.
//!
//! The serial return path carries three things: command responses (chip
//! enumeration replies, PLL readbacks) protected by the 5-bit CRC, nonce
//! frames, and line noise. Classification is stateless; what to do with a
//! frame depends on the mining state and belongs to the device loops.

use super::crc::{bmcrc, check_crc5};
use super::AsicFamily;

/// What a received frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameClass {
    /// A chip answered the enumeration query (lead byte 0x13).
    ChipReply,

    /// PLL readback; `None` when a divisor field was zero ("bad frequency").
    FrequencyReport(Option<f64>),

    /// A nonce candidate.
    Nonce(NonceFrame),

    /// The fixed pattern the cores emit while being opened against zero
    /// work; counts healthy cores during the ramp.
    OpenCoreNonce,

    /// CRC-invalid or unrecognizable. Dropped without touching the
    /// hardware-error counters; those are scored after nonce validation.
    Noise,
}

/// Raw fields of a nonce frame, before ring matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceFrame {
    pub nonce: u32,
    /// Job-id byte as echoed by the chip (family mask not yet applied).
    pub job_id: u8,
    /// Fourth nonce byte; the newer parts leak the producing chip here.
    pub byte3: u8,
}

/// Classify one full frame of `rx_len` bytes.
pub fn classify(family: AsicFamily, rx: &[u8]) -> FrameClass {
    if rx.len() < family.params().rx_len {
        return FrameClass::Noise;
    }

    if check_crc5(rx) {
        return match rx[0] {
            0x13 => FrameClass::ChipReply,
            0x80 => FrameClass::FrequencyReport(report_frequency(family, rx)),
            _ => FrameClass::Noise,
        };
    }

    if rx.len() >= 4 && rx[0] == 0x72 && rx[1] == 0x03 && rx[2] == 0xea && rx[3] == 0x83 {
        return FrameClass::OpenCoreNonce;
    }

    match family {
        AsicFamily::BM1384 => nonce_frame(rx, rx[4] ^ 0x80),
        _ => {
            // Nonce frames on these parts carry an 8-bit-slot CRC in the
            // final byte.
            let bits = 8 * rx.len() as u32 - 8;
            if bmcrc(rx, bits) != rx[rx.len() - 1] & 0x1f {
                return FrameClass::Noise;
            }
            nonce_frame(rx, rx[5])
        }
    }
}

fn nonce_frame(rx: &[u8], job_id: u8) -> FrameClass {
    let nonce = u32::from_be_bytes([rx[0], rx[1], rx[2], rx[3]]);
    FrameClass::Nonce(NonceFrame {
        nonce,
        job_id,
        byte3: rx[3],
    })
}

/// Decode a PLL readback into MHz, or `None` when a divisor is zero.
fn report_frequency(family: AsicFamily, rx: &[u8]) -> Option<f64> {
    match family {
        AsicFamily::BM1384 => {
            let div = (1 + rx[2] as u32) & 0x0f;
            if div == 0 {
                return None;
            }
            let base = (rx[1] as f64 + 1.0) * 6.25 / div as f64
                * 2.0f64.powi(3 - rx[3] as i32);
            Some(base + (rx[2] >> 4) as f64 * 6.25)
        }
        _ => {
            let refdiv = rx[2] as u32;
            let post1 = (rx[3] >> 4) as u32;
            let post2 = (rx[3] & 0x0f) as u32;
            if refdiv == 0 || post1 == 0 || post2 == 0 {
                return None;
            }
            Some(25.0 * rx[1] as f64 / (refdiv * post1 * post2) as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::crc::stamp_crc5;
    use test_case::test_case;

    fn stamped(mut frame: Vec<u8>) -> Vec<u8> {
        let last = frame.len() - 1;
        frame[last] &= 0xe0;
        stamp_crc5(&mut frame);
        frame
    }

    #[test]
    fn chip_reply_needs_valid_crc() {
        let good = stamped(vec![0x13, 0x97, 0x18, 0x00, 0x00]);
        assert_eq!(classify(AsicFamily::BM1384, &good), FrameClass::ChipReply);

        let mut bad = good.clone();
        bad[1] ^= 0x01;
        // corrupted frames fall through to nonce parsing and fail there too
        assert_ne!(classify(AsicFamily::BM1384, &bad), FrameClass::ChipReply);
    }

    #[test]
    fn bm1387_frequency_report() {
        // 25 * 0x70 / (2 * 2 * 1) = 700 MHz
        let frame = stamped(vec![0x80, 0x70, 0x02, 0x21, 0x00, 0x00, 0x00]);
        match classify(AsicFamily::BM1387, &frame) {
            FrameClass::FrequencyReport(Some(freq)) => {
                assert!((freq - 700.0).abs() < 1e-9, "got {freq}");
            }
            other => panic!("expected frequency report, got {other:?}"),
        }
    }

    #[test_case(&[0x80, 0x70, 0x00, 0x21, 0x00, 0x00, 0x00]; "zero refdiv")]
    #[test_case(&[0x80, 0x70, 0x02, 0x01, 0x00, 0x00, 0x00]; "zero postdiv1")]
    #[test_case(&[0x80, 0x70, 0x02, 0x20, 0x00, 0x00, 0x00]; "zero postdiv2")]
    fn bm1387_bad_frequency_report(raw: &[u8]) {
        let frame = stamped(raw.to_vec());
        assert_eq!(
            classify(AsicFamily::BM1387, &frame),
            FrameClass::FrequencyReport(None)
        );
    }

    #[test]
    fn bm1384_nonce_extraction() {
        // Nonce frames are not 5-bit-CRC valid; job id is byte 4 xor 0x80.
        let frame = vec![0xde, 0xad, 0xbe, 0xef, 0x85];
        match classify(AsicFamily::BM1384, &frame) {
            FrameClass::Nonce(n) => {
                assert_eq!(n.nonce, 0xdead_beef);
                assert_eq!(n.job_id, 0x05);
                assert_eq!(n.byte3, 0xef);
            }
            other => panic!("expected nonce, got {other:?}"),
        }
    }

    #[test]
    fn bm1387_nonce_requires_frame_crc() {
        let mut frame = vec![0x12, 0x34, 0x56, 0x78, 0x00, 0x1c, 0x00];
        let crc = crate::asic::crc::bmcrc(&frame, 8 * frame.len() as u32 - 8);
        let last = frame.len() - 1;
        frame[last] = crc;
        match classify(AsicFamily::BM1387, &frame) {
            FrameClass::Nonce(n) => {
                assert_eq!(n.nonce, 0x1234_5678);
                assert_eq!(n.job_id, 0x1c);
            }
            other => panic!("expected nonce, got {other:?}"),
        }

        frame[2] ^= 0xff;
        assert_eq!(classify(AsicFamily::BM1387, &frame), FrameClass::Noise);
    }

    #[test]
    fn open_core_pattern_detected() {
        let frame = vec![0x72, 0x03, 0xea, 0x83, 0x00, 0x00, 0x00];
        assert_eq!(classify(AsicFamily::BM1387, &frame), FrameClass::OpenCoreNonce);
    }

    #[test]
    fn short_frames_are_noise() {
        assert_eq!(classify(AsicFamily::BM1387, &[0x80, 0x01]), FrameClass::Noise);
    }
}
