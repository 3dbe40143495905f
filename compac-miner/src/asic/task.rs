//! Work frame encoding for the supported chip families.
//!
//! A task is what goes down the wire to start a scan. Layouts are fixed per
//! family; multi-byte integers are big-endian and midstates travel
//! byte-reversed. Encoding is a pure function of its inputs so re-encoding
//! the same work yields identical bytes.

use super::crc::{crc16, stamp_crc5};
use super::AsicFamily;
use crate::work::Work;

/// Everything the encoder needs for one frame.
pub struct TaskFrame<'w> {
    pub family: AsicFamily,
    /// True once the device is in the mining state; before that tasks are
    /// ramp filler regardless of `work`.
    pub mining: bool,
    pub job_id: u32,
    pub ticket_mask: u32,
    /// Hash-count number: nonce-range bound handed to the chip.
    pub task_hcn: u32,
    /// AsicBoost enabled for this device.
    pub boost: bool,
    /// Current work, or `None` to emit busy filler that keeps the chip
    /// scanning without submitting anything useful.
    pub work: Option<&'w Work>,
}

impl TaskFrame<'_> {
    /// Frame length for this configuration.
    pub fn frame_len(&self) -> usize {
        let p = self.family.params();
        if self.boost && p.boost_extra > 0 {
            p.task_len + p.boost_extra
        } else {
            p.task_len
        }
    }

    /// Encode the frame.
    pub fn encode(&self) -> Vec<u8> {
        match self.family {
            AsicFamily::BM1384 => self.encode_bm1384(),
            _ => self.encode_bm1387_family(),
        }
    }

    /// BM1384: 64 bytes, 5-bit command CRC is not used on work frames.
    ///
    /// midstate (reversed) @0, ticket-mask byte @39, hash-count-number
    /// big-endian @40, job id @51, header bytes 64..76 (reversed) @52.
    fn encode_bm1384(&self) -> Vec<u8> {
        let mut task = vec![0u8; self.frame_len()];

        if self.mining {
            if let Some(work) = self.work {
                copy_reversed(&mut task[0..32], &work.midstate);
                copy_reversed(&mut task[52..64], &work.data[64..76]);
            }
            task[39] = (self.ticket_mask & 0xff) as u8;
            task[40..44].copy_from_slice(&self.task_hcn.to_be_bytes());
        }
        task[51] = (self.job_id & 0xff) as u8;

        task
    }

    /// BM1387 and successors: `0x21 | len | job_id | flags` header, header
    /// tail (reversed) @8, midstates (reversed) from @20, CRC-16 big-endian
    /// in the trailing two bytes.
    fn encode_bm1387_family(&self) -> Vec<u8> {
        let len = self.frame_len();
        let mut task = vec![0u8; len];
        let p = self.family.params();
        let rolls_midstates = self.boost && p.boost_extra > 0;

        task[0] = 0x21;
        task[1] = len as u8;
        task[2] = (self.job_id & 0xff) as u8;
        task[3] = if rolls_midstates { 0x04 } else { 0x01 };

        match (self.mining, self.work) {
            (true, Some(work)) => {
                copy_reversed(&mut task[8..20], &work.data[64..76]);
                copy_reversed(&mut task[20..52], &work.midstate);
                if rolls_midstates {
                    copy_reversed(&mut task[52..84], &work.midstate1);
                    copy_reversed(&mut task[84..116], &work.midstate2);
                    copy_reversed(&mut task[116..148], &work.midstate3);
                } else if p.version_mask != 0 && work.vmask {
                    // Version-rolling parts carry one midstate and the
                    // permitted rolling window in the reserved header bytes.
                    task[4..8].copy_from_slice(&p.version_mask.to_be_bytes());
                }
            }
            _ => {
                // Busy filler: an impossible header tail keeps the cores
                // scanning and the chip-side watchdog fed.
                task[8..20].fill(0xff);
            }
        }

        let crc = crc16(&task[..len - 2]);
        task[len - 2..].copy_from_slice(&crc.to_be_bytes());
        task
    }
}

/// Chip-count query for the family, CRC already stamped.
pub fn chip_count_query(family: AsicFamily) -> Vec<u8> {
    match family {
        AsicFamily::BM1384 => {
            let mut buf = vec![0x84, 0x00, 0x00, 0x00];
            stamp_crc5(&mut buf);
            buf
        }
        _ => cmd8(family, vec![0x54, 0x05, 0x00, 0x00, 0x00]),
    }
}

/// Frequency/PLL readback ping.
pub fn frequency_ping(family: AsicFamily) -> Vec<u8> {
    match family {
        AsicFamily::BM1384 => {
            let mut buf = vec![0x84, 0x00, 0x04, 0x00];
            stamp_crc5(&mut buf);
            buf
        }
        _ => cmd8(family, vec![0x54, 0x05, 0x00, 0x0c, 0x00]),
    }
}

/// Broadcast chain-inactive followed by per-chip address assignment.
///
/// Returns the command sequence in send order. The BM1387-family repeats
/// the broadcast three times, then addresses each chip, then re-opens the
/// core clock gate with the current baud divider.
pub fn chain_inactive(family: AsicFamily, chips: u32, bauddiv: u8) -> Vec<Vec<u8>> {
    let mut cmds = Vec::new();

    match family {
        AsicFamily::BM1384 => {
            let mut inactive = vec![0x85, 0x00, 0x00, 0x00];
            stamp_crc5(&mut inactive);
            cmds.push(inactive);
            for chip in 0..chips {
                let mut addr = vec![0x01, family.chip_address(chips, chip), 0x00, 0x00];
                stamp_crc5(&mut addr);
                cmds.push(addr);
            }
        }
        _ => {
            let inactive = cmd8(family, vec![0x55, 0x05, 0x00, 0x00, 0x00]);
            cmds.push(inactive.clone());
            cmds.push(inactive.clone());
            cmds.push(inactive);
            for chip in 0..chips {
                cmds.push(cmd8(
                    family,
                    vec![0x41, 0x05, family.chip_address(chips, chip), 0x00, 0x00],
                ));
            }
            // GATEBLK register write; byte 6 carries the baud divider.
            cmds.push(cmd8(
                family,
                vec![0x58, 0x09, 0x00, 0x1c, 0x40, 0x20, 0x80 | bauddiv, 0x80, 0x00],
            ));
        }
    }

    cmds
}

/// PLL programming for the requested frequency. Returns the command
/// sequence and the frequency the silicon will actually run at.
pub fn set_frequency(family: AsicFamily, mhz: f64) -> (Vec<Vec<u8>>, f64) {
    let snapped = family.snap_frequency(mhz);
    let mut cmds = Vec::new();

    match family {
        AsicFamily::BM1384 => {
            // The PLL register wants a divider pair derived from the target;
            // below 100 MHz the encoding switches to a linear low range.
            let pll = if snapped < 100.0 {
                0x0783 - (128.0f64 * (100.0 - snapped) / 6.25) as u32
            } else {
                let r = (snapped / 25.0).log2().floor();
                let r1 = 0x0785 - r as u32;
                let r2 = (512.0f64 / 2.0f64.powf(r)) as u32;
                let r3 = 25.0 * 2.0f64.powf(r);
                let p1 = r1 + (r2 as f64 * (snapped - r3) / 6.25) as u32;
                let p2 = p1 * 2 + 0x7f + r as u32;
                if snapped as u32 % 25 == 0 { p1 } else { p2 }
            };

            let mut buf = vec![0x82, (pll >> 8) as u8, (pll & 0xff) as u8, 0x00];
            stamp_crc5(&mut buf);
            cmds.push(buf);

            // Latch the new clock with a register-4 strobe.
            let mut strobe = vec![0x84, 0x00, 0x04, 0x00];
            stamp_crc5(&mut strobe);
            cmds.push(strobe);
        }
        _ => {
            // Post-divider halves as the frequency range climbs.
            let (postdiv, fbdiv) = if snapped < 400.0 {
                (0x41, (snapped * 8.0 / 25.0) as u8)
            } else if snapped < 600.0 {
                (0x21, (snapped * 4.0 / 25.0) as u8)
            } else {
                (0x11, (snapped * 2.0 / 25.0) as u8)
            };
            cmds.push(cmd8(
                family,
                vec![0x58, 0x09, 0x00, 0x0c, 0x00, fbdiv, 0x02, postdiv, 0x00],
            ));
        }
    }

    (cmds, snapped)
}

/// Stamp an 8-bit-slot command CRC (the checksum still uses the 5-bit
/// polynomial, computed over `8*len - 8` bits).
fn cmd8(family: AsicFamily, mut buf: Vec<u8>) -> Vec<u8> {
    let bits = family.cmd_crc_bits(buf.len());
    let crc = super::crc::bmcrc(&buf, bits);
    let last = buf.len() - 1;
    buf[last] |= crc;
    buf
}

fn copy_reversed(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter().rev()) {
        *d = *s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::testing::stub_work;

    fn frame<'w>(family: AsicFamily, work: Option<&'w Work>) -> TaskFrame<'w> {
        TaskFrame {
            family,
            mining: true,
            job_id: 0x05,
            ticket_mask: 0x0f,
            task_hcn: 0x8000_0000,
            boost: false,
            work,
        }
    }

    #[test]
    fn bm1384_layout() {
        let work = stub_work(3);
        let task = frame(AsicFamily::BM1384, Some(&work)).encode();

        assert_eq!(task.len(), 64);
        // midstate is byte-reversed at the front
        assert_eq!(task[0], work.midstate[31]);
        assert_eq!(task[31], work.midstate[0]);
        assert_eq!(task[39], 0x0f);
        assert_eq!(&task[40..44], &0x8000_0000u32.to_be_bytes());
        assert_eq!(task[51], 0x05);
        // header tail bytes 64..76, reversed
        assert_eq!(task[52], work.data[75]);
        assert_eq!(task[63], work.data[64]);
    }

    #[test]
    fn bm1384_busy_is_job_id_only() {
        let mut f = frame(AsicFamily::BM1384, None);
        f.mining = false;
        let task = f.encode();
        assert_eq!(task[51], 0x05);
        assert!(task[0..51].iter().all(|&b| b == 0));
    }

    #[test]
    fn bm1387_single_midstate_layout() {
        let work = stub_work(9);
        let task = frame(AsicFamily::BM1387, Some(&work)).encode();

        assert_eq!(task.len(), 54);
        assert_eq!(task[0], 0x21);
        assert_eq!(task[1], 54);
        assert_eq!(task[2], 0x05);
        assert_eq!(task[3], 0x01);
        assert_eq!(task[8], work.data[75]);
        assert_eq!(task[19], work.data[64]);
        assert_eq!(task[20], work.midstate[31]);
        // trailing CRC16 verifies over everything before it
        let crc = crc16(&task[..52]);
        assert_eq!(&task[52..54], &crc.to_be_bytes());
    }

    #[test]
    fn bm1387_boost_carries_four_midstates() {
        let work = stub_work(2);
        let mut f = frame(AsicFamily::BM1387, Some(&work));
        f.boost = true;
        let task = f.encode();

        assert_eq!(task.len(), 150);
        assert_eq!(task[3], 0x04);
        assert_eq!(task[52], work.midstate1[31]);
        assert_eq!(task[84], work.midstate2[31]);
        assert_eq!(task[116], work.midstate3[31]);
        let crc = crc16(&task[..148]);
        assert_eq!(&task[148..150], &crc.to_be_bytes());
    }

    #[test]
    fn bm1362_vmask_encodes_rolling_window() {
        let mut work = stub_work(4);
        work.vmask = true;
        let mut f = frame(AsicFamily::BM1362, Some(&work));
        f.boost = true;
        let task = f.encode();

        // this family rolls versions, not midstates: single-midstate frame
        assert_eq!(task.len(), 54);
        assert_eq!(task[3], 0x01);
        assert_eq!(&task[4..8], &0x1fff_e000u32.to_be_bytes());
    }

    #[test]
    fn busy_task_is_well_formed() {
        let task = frame(AsicFamily::BM1387, None).encode();
        assert_eq!(task.len(), 54);
        assert!(task[8..20].iter().all(|&b| b == 0xff));
        let crc = crc16(&task[..52]);
        assert_eq!(&task[52..54], &crc.to_be_bytes());
    }

    #[test]
    fn encoding_is_idempotent() {
        let work = stub_work(11);
        let a = frame(AsicFamily::BM1387, Some(&work)).encode();
        let b = frame(AsicFamily::BM1387, Some(&work)).encode();
        assert_eq!(a, b);
    }

    #[test]
    fn pll_program_matches_known_frequencies() {
        // 250 MHz on the BM1387-family: fbdiv 80, postdiv 0x41
        let (cmds, snapped) = set_frequency(AsicFamily::BM1387, 250.0);
        assert_eq!(snapped, 250.0);
        assert_eq!(cmds.len(), 1);
        assert_eq!(&cmds[0][..4], &[0x58, 0x09, 0x00, 0x0c]);
        assert_eq!(cmds[0][5], 80);
        assert_eq!(cmds[0][7], 0x41);

        // 625 MHz switches to the smallest post divider
        let (cmds, snapped) = set_frequency(AsicFamily::BM1387, 625.0);
        assert_eq!(snapped, 625.0);
        assert_eq!(cmds[0][5], 50);
        assert_eq!(cmds[0][7], 0x11);
    }

    #[test]
    fn chain_inactive_addresses_every_chip() {
        let cmds = chain_inactive(AsicFamily::BM1387, 2, 0x01);
        // 3 broadcasts + 2 address writes + gate
        assert_eq!(cmds.len(), 6);
        assert_eq!(cmds[0][0], 0x55);
        assert_eq!(cmds[3][0], 0x41);
        assert_eq!(cmds[3][2], 0x00);
        assert_eq!(cmds[4][2], 0x80);
        assert_eq!(cmds[5][6], 0x81);
    }
}
