//! ASIC family definitions for the BM13xx / Bitfury parts driven over USB.
//!
//! Each family block collects the constants the rest of the driver needs:
//! serial frame lengths, job-id ring geometry, core counts, health
//! thresholds, and the frequency bounds the PLL will accept.

pub mod crc;
pub mod frame;
pub mod task;

use strum::Display;

/// The silicon family inside a stick. Determines frame formats, job-id
/// geometry and PLL programming.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsicFamily {
    BM1384,
    BM1387,
    BM1397,
    BM1362,
    BM1370,
}

/// Sub-identity of a supported product, as matched from the USB table.
///
/// Several products share a family but differ in defaults (chip count,
/// start frequency, telemetry presence).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SubIdent {
    /// Compac single-chip BM1384 stick
    Bsc,
    /// 2Pac dual-chip BM1384 stick
    Bsd,
    /// Terminus R606 BM1384 pod
    Bse,
    /// NewPac dual-chip BM1387 stick
    Gsh,
    /// R606 BM1397 pod
    Gsf,
    /// CompacF single-chip BM1397 stick
    Gsfm,
    /// R909 BM1362 pod
    Gsa1,
    /// BM1370 pod
    Gsa2,
}

impl SubIdent {
    pub fn family(self) -> AsicFamily {
        match self {
            SubIdent::Bsc | SubIdent::Bsd | SubIdent::Bse => AsicFamily::BM1384,
            SubIdent::Gsh => AsicFamily::BM1387,
            SubIdent::Gsf | SubIdent::Gsfm => AsicFamily::BM1397,
            SubIdent::Gsa1 => AsicFamily::BM1362,
            SubIdent::Gsa2 => AsicFamily::BM1370,
        }
    }

    /// Chips the product is expected to carry; chip enumeration must never
    /// exceed this.
    pub fn expected_chips(self) -> u32 {
        match self {
            SubIdent::Bsc => 1,
            SubIdent::Bsd => 2,
            SubIdent::Bse => 6,
            SubIdent::Gsh => 2,
            SubIdent::Gsf => 6,
            SubIdent::Gsfm => 1,
            SubIdent::Gsa1 => 12,
            SubIdent::Gsa2 => 8,
        }
    }

    /// True when the product carries the auxiliary telemetry MCU on a
    /// second USB interface.
    pub fn has_micro(self) -> bool {
        matches!(self, SubIdent::Gsh | SubIdent::Gsa1 | SubIdent::Gsa2)
    }
}

/// Per-family constants. One static instance per family.
#[derive(Debug)]
pub struct FamilyParams {
    pub family: AsicFamily,
    /// Hashing cores per chip.
    pub cores: u32,
    /// Bytes in a response frame.
    pub rx_len: usize,
    /// Bytes in a work/task frame (without AsicBoost extension).
    pub task_len: usize,
    /// Extra task bytes when AsicBoost midstates are carried.
    pub boost_extra: usize,
    /// Job-id ring: lowest id, highest id, increment between tasks.
    pub min_job_id: u32,
    pub max_job_id: u32,
    pub add_job_id: u32,
    /// Mask applied to the job-id byte echoed in nonces; the low bits carry
    /// a chip offset on the newer parts.
    pub job_id_mask: u8,
    /// Backward job-id offsets to search when matching a nonce.
    pub cur_attempt: &'static [i32],
    /// Rolling-hashrate fraction below which the device counts as sick.
    pub healthy: f64,
    /// PLL frequency bounds in MHz.
    pub min_freq: f64,
    pub max_freq: f64,
    /// Frequencies are rounded up to a multiple of this.
    pub freq_base: f64,
    /// Version-rolling bits the part requires free when AsicBoost is on
    /// (zero when boost rolls midstates instead of versions).
    pub version_mask: u32,
}

pub const BM1384: FamilyParams = FamilyParams {
    family: AsicFamily::BM1384,
    cores: 55,
    rx_len: 5,
    task_len: 64,
    boost_extra: 0,
    min_job_id: 0,
    max_job_id: 0x1f,
    add_job_id: 1,
    job_id_mask: 0xff,
    cur_attempt: &[0, -1, -2, -3],
    healthy: 0.33,
    min_freq: 6.0,
    max_freq: 500.0,
    freq_base: 6.25,
    version_mask: 0,
};

pub const BM1387: FamilyParams = FamilyParams {
    family: AsicFamily::BM1387,
    cores: 114,
    rx_len: 7,
    task_len: 54,
    boost_extra: 96,
    min_job_id: 0,
    max_job_id: 0x7f,
    add_job_id: 1,
    job_id_mask: 0xff,
    cur_attempt: &[0, -1, -2, -3],
    healthy: 0.75,
    min_freq: 50.0,
    max_freq: 900.0,
    freq_base: 6.25,
    version_mask: 0,
};

pub const BM1397: FamilyParams = FamilyParams {
    family: AsicFamily::BM1397,
    cores: 672,
    rx_len: 7,
    task_len: 54,
    boost_extra: 96,
    min_job_id: 0,
    max_job_id: 0x7f,
    add_job_id: 0x04,
    job_id_mask: 0xf8,
    cur_attempt: &[0, -4, -8, -12],
    healthy: 0.75,
    min_freq: 50.0,
    max_freq: 800.0,
    freq_base: 6.25,
    version_mask: 0,
};

pub const BM1362: FamilyParams = FamilyParams {
    family: AsicFamily::BM1362,
    cores: 896,
    rx_len: 7,
    task_len: 54,
    boost_extra: 0,
    min_job_id: 0,
    max_job_id: 0x7f,
    add_job_id: 0x08,
    job_id_mask: 0xf8,
    cur_attempt: &[0, -8, -16, -24],
    healthy: 0.75,
    min_freq: 50.0,
    max_freq: 800.0,
    freq_base: 6.25,
    version_mask: 0x1fffe000,
};

pub const BM1370: FamilyParams = FamilyParams {
    family: AsicFamily::BM1370,
    cores: 2040,
    rx_len: 7,
    task_len: 54,
    boost_extra: 0,
    min_job_id: 0,
    max_job_id: 0x7f,
    add_job_id: 0x18,
    job_id_mask: 0xf0,
    cur_attempt: &[0, -24, -48, -72],
    healthy: 0.75,
    min_freq: 50.0,
    max_freq: 800.0,
    freq_base: 6.25,
    version_mask: 0x1fffe000,
};

impl AsicFamily {
    pub fn params(self) -> &'static FamilyParams {
        match self {
            AsicFamily::BM1384 => &BM1384,
            AsicFamily::BM1387 => &BM1387,
            AsicFamily::BM1397 => &BM1397,
            AsicFamily::BM1362 => &BM1362,
            AsicFamily::BM1370 => &BM1370,
        }
    }

    /// Frames on the BM1384 checksum over `8*len - 5` bits; the later parts
    /// reserve a full byte.
    pub fn cmd_crc_bits(self, len: usize) -> u32 {
        match self {
            AsicFamily::BM1384 => 8 * len as u32 - 5,
            _ => 8 * len as u32 - 8,
        }
    }

    /// Round a requested frequency up to the family's PLL step.
    pub fn snap_frequency(self, mhz: f64) -> f64 {
        let p = self.params();
        let bounded = mhz.clamp(p.min_freq, p.max_freq);
        (100.0 * bounded / 625.0).ceil() * 6.25
    }

    /// Advance a job id by the family stride, rolling inside
    /// `[min_job_id, max_job_id]`.
    pub fn roll_job_id(self, job_id: u32, add: u32) -> u32 {
        let p = self.params();
        let span = p.max_job_id + 1 - p.min_job_id;
        p.min_job_id + (job_id + add - p.min_job_id) % span
    }

    /// Serial address assigned to chip `chip` of `chips` on the chain.
    pub fn chip_address(self, chips: u32, chip: u32) -> u8 {
        if chips == 0 {
            return 0;
        }
        ((0x100 / chips) as u8).wrapping_mul(chip as u8)
    }

    /// Inverse of [`chip_address`](Self::chip_address): which chip produced
    /// a frame with the given address byte.
    pub fn address_to_chip(self, chips: u32, addr: u8) -> u32 {
        if chips == 0 {
            return 0;
        }
        let step = 0x100 / chips;
        if step == 0 {
            return 0;
        }
        (addr as u32) / step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(AsicFamily::BM1384, 190.0, 193.75; "bm1384 rounds up")]
    #[test_case(AsicFamily::BM1387, 400.0, 400.0; "bm1387 exact step")]
    #[test_case(AsicFamily::BM1387, 40.0, 50.0; "bm1387 lower bound")]
    #[test_case(AsicFamily::BM1384, 1000.0, 500.0; "bm1384 upper bound")]
    fn snap_frequency(family: AsicFamily, requested: f64, expected: f64) {
        assert_eq!(family.snap_frequency(requested), expected);
    }

    #[test]
    fn job_id_roll_wraps_in_range() {
        let fam = AsicFamily::BM1397;
        let p = fam.params();
        let mut id = p.min_job_id;
        let span = (p.max_job_id + 1 - p.min_job_id) / p.add_job_id;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..span {
            assert!(seen.insert(id), "job id {id} repeated before a full cycle");
            assert!(id >= p.min_job_id && id <= p.max_job_id);
            id = fam.roll_job_id(id, p.add_job_id);
        }
        assert_eq!(id, p.min_job_id);
    }

    #[test]
    fn chip_addresses_are_even_splits() {
        let fam = AsicFamily::BM1397;
        assert_eq!(fam.chip_address(6, 0), 0x00);
        assert_eq!(fam.chip_address(6, 1), 0x2a);
        assert_eq!(fam.address_to_chip(6, 0x2a), 1);
        assert_eq!(fam.address_to_chip(6, 0x54), 2);
        // degenerate chain
        assert_eq!(fam.chip_address(0, 3), 0);
    }
}
