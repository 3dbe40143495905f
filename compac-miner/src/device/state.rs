//! Mutable state of one miner.
//!
//! Everything the three device loops and the API share lives here, split
//! into independently locked blocks so the sender never waits on the API
//! and vice versa. Counters that only ever increment are plain atomics.

use crate::asic::{AsicFamily, SubIdent};
use crate::stats::{HashRateBuckets, JobBuckets};
use crate::work::Work;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use strum::Display;

/// Lifecycle of a device, driven by the sender loop.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MiningState {
    Init = 1,
    ChipCount,
    ChipCountXx,
    ChipCountOk,
    OpenCore,
    OpenCoreOk,
    Mining,
    MiningDups,
    Shutdown,
    ShutdownOk,
    Reset,
    Reinit,
}

impl MiningState {
    fn from_u8(v: u8) -> MiningState {
        match v {
            1 => MiningState::Init,
            2 => MiningState::ChipCount,
            3 => MiningState::ChipCountXx,
            4 => MiningState::ChipCountOk,
            5 => MiningState::OpenCore,
            6 => MiningState::OpenCoreOk,
            7 => MiningState::Mining,
            8 => MiningState::MiningDups,
            9 => MiningState::Shutdown,
            10 => MiningState::ShutdownOk,
            11 => MiningState::Reset,
            _ => MiningState::Reinit,
        }
    }
}

/// Health of a single chip, judged from its nonce flow.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsicHealth {
    #[default]
    Healthy,
    HalfDead,
    AlmostDead,
    Dead,
}

/// Per-chip bookkeeping.
#[derive(Debug, Clone)]
pub struct AsicInfo {
    pub frequency: f64,
    pub frequency_set: f64,
    pub last_nonce: Instant,
    pub dups: u32,
    pub dupsall: u32,
    pub health: AsicHealth,
    pub prev_nonce: u32,
    pub nonces: u64,
}

impl AsicInfo {
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            frequency_set: frequency,
            last_nonce: Instant::now(),
            dups: 0,
            dupsall: 0,
            health: AsicHealth::Healthy,
            prev_nonce: 0,
            nonces: 0,
        }
    }
}

/// The in-flight work ring, indexed by job id.
///
/// A slot is live iff its `active` flag is set. Flush clears the flags
/// without freeing the slots, so a late nonce can still see "stale" work;
/// readers must tolerate an active flag over an empty slot.
#[derive(Debug)]
pub struct WorkRing {
    pub job_id: u32,
    slots: Vec<Option<Work>>,
    active: Vec<bool>,
    pub prev_nonce: u32,
    /// Length of the current duplicate-nonce run; cleared by a fresh nonce.
    pub run_dups: u32,
    /// Version-rolling granted by the pool of the most recent work.
    pub vmask: bool,
}

impl WorkRing {
    pub fn new(max_job_id: u32) -> Self {
        let len = max_job_id as usize + 1;
        Self {
            job_id: 0,
            slots: (0..len).map(|_| None).collect(),
            active: vec![false; len],
            prev_nonce: 0,
            run_dups: 0,
            vmask: false,
        }
    }

    /// Advance the job id for the next task. The first two families count
    /// linearly with a guard band of three ids below the top; the rest
    /// stride by the family increment across the whole range.
    pub fn advance_job_id(&mut self, family: AsicFamily) -> u32 {
        let p = family.params();
        self.job_id = match family {
            AsicFamily::BM1384 | AsicFamily::BM1387 => (self.job_id + 1) % (p.max_job_id - 3),
            _ => family.roll_job_id(self.job_id, p.add_job_id),
        };
        self.job_id
    }

    /// Put new work into a slot, returning whatever it displaced.
    pub fn stash(&mut self, job_id: u32, work: Work) -> Option<Work> {
        let idx = job_id as usize;
        self.vmask = work.vmask;
        self.active[idx] = true;
        self.slots[idx].replace(work)
    }

    pub fn is_active(&self, job_id: u32) -> bool {
        self.active
            .get(job_id as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn work_at(&self, job_id: u32) -> Option<&Work> {
        if !self.is_active(job_id) {
            return None;
        }
        self.slots.get(job_id as usize).and_then(|s| s.as_ref())
    }

    pub fn work_at_mut(&mut self, job_id: u32) -> Option<&mut Work> {
        if !self.is_active(job_id) {
            return None;
        }
        self.slots.get_mut(job_id as usize).and_then(|s| s.as_mut())
    }

    /// Mark every slot stale without freeing it.
    pub fn flush(&mut self) {
        for flag in &mut self.active {
            *flag = false;
        }
    }

    /// Drain every slot, returning the work for release to the source.
    pub fn drain(&mut self) -> Vec<Work> {
        self.flush();
        self.slots.iter_mut().filter_map(|s| s.take()).collect()
    }
}

/// Frequency, topology and the rates derived from them.
#[derive(Debug, Clone)]
pub struct FreqState {
    pub chips: u32,
    pub cores: u32,
    pub expected_chips: u32,
    pub frequency: f64,
    pub frequency_requested: f64,
    pub frequency_start: f64,
    pub frequency_default: f64,
    pub min_freq: f64,
    pub step_freq: f64,
    pub freq_base: f64,
    pub hr_scale: f64,
    /// chips × cores × frequency × hr_scale, in H/s.
    pub hashrate: u64,
    /// Milliseconds for one full 2³² scan at `hashrate`.
    pub fullscan_ms: f64,
    pub task_hcn: u32,
    pub ticket_mask: u32,
    pub difficulty: u32,
    pub ramping: u32,
    pub bauddiv: u8,
    /// EWMA of the gap between tasks, milliseconds.
    pub task_ms: f64,
}

impl FreqState {
    pub fn new(family: AsicFamily, expected_chips: u32, start: f64, requested: f64) -> Self {
        let p = family.params();
        let mut state = Self {
            chips: 0,
            cores: p.cores,
            expected_chips,
            frequency: start,
            frequency_requested: requested,
            frequency_start: start,
            frequency_default: requested,
            min_freq: p.min_freq,
            step_freq: 6.25,
            freq_base: p.freq_base,
            hr_scale: 1.0,
            hashrate: 0,
            fullscan_ms: f64::MAX,
            task_hcn: 0,
            ticket_mask: 0,
            difficulty: 1,
            ramping: 0,
            bauddiv: 0x19,
            task_ms: 0.0,
        };
        state.update_rates(family);
        state
    }

    /// Recompute everything that hangs off chips/cores/frequency. Called on
    /// every frequency or chip-count change so the identity
    /// `hashrate == chips × cores × frequency × hr_scale` always holds.
    pub fn update_rates(&mut self, family: AsicFamily) {
        self.hashrate =
            (self.chips as f64 * self.cores as f64 * self.frequency * 1_000_000.0 * self.hr_scale)
                as u64;
        if self.hashrate == 0 {
            self.fullscan_ms = f64::MAX;
            self.ticket_mask = 0;
            self.difficulty = 1;
            return;
        }
        self.fullscan_ms = 1000.0 * 4_294_967_296.0 / self.hashrate as f64;

        // Ticket mask: the largest 2^n - 1 that still lets roughly two
        // nonces per second through. The BM1387 reports everything.
        self.ticket_mask = if family == AsicFamily::BM1387 {
            0
        } else {
            let per_sec = self.hashrate as f64 / (2.0 * 4_294_967_296.0);
            if per_sec <= 1.0 {
                0
            } else {
                let n = per_sec.log2().ceil().min(11.0) as u32;
                (1u32 << n) - 1
            }
        };
        self.difficulty = self.ticket_mask + 1;
    }
}

/// Monotonic counters. Zeroed only by the API `zero` command.
#[derive(Debug, Default)]
pub struct Counters {
    pub accepted: AtomicU64,
    pub nonces: AtomicU64,
    pub hw_errors: AtomicU64,
    pub dups: AtomicU64,
    pub dupsall: AtomicU64,
    pub dupsreset: AtomicU64,
    pub low_eff_resets: AtomicU64,
    pub plateau_reset: AtomicU64,
    pub fail_count: AtomicU64,
    pub nonceless: AtomicU64,
    pub zero_check: AtomicU64,
    pub tasks: AtomicU64,
    pub busy_tasks: AtomicU64,
    pub ntimeout: AtomicU64,
    pub ntrigger: AtomicU64,
}

impl Counters {
    pub fn zero_stats(&self) {
        for c in [
            &self.accepted,
            &self.nonces,
            &self.hw_errors,
            &self.dups,
            &self.dupsall,
            &self.dupsreset,
            &self.low_eff_resets,
            &self.plateau_reset,
            &self.nonceless,
            &self.zero_check,
            &self.tasks,
            &self.busy_tasks,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Timestamps the loops consult; all monotonic.
#[derive(Debug, Clone)]
pub struct Timestamps {
    pub start_time: Instant,
    pub monitor_time: Instant,
    pub last_task: Instant,
    pub last_nonce: Instant,
    pub last_frequency_adjust: Instant,
    pub last_frequency_ping: Instant,
    pub last_frequency_report: Instant,
    pub last_micro_ping: Instant,
    pub last_reset: Instant,
    pub last_write_error: Instant,
    pub last_chain_inactive: Instant,
    pub last_pool_lost: Instant,
}

impl Default for Timestamps {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            monitor_time: now,
            last_task: now,
            last_nonce: now,
            last_frequency_adjust: now,
            last_frequency_ping: now,
            last_frequency_report: now,
            last_micro_ping: now,
            last_reset: now,
            last_write_error: now,
            last_chain_inactive: now,
            last_pool_lost: now,
        }
    }
}

/// Telemetry MCU state mirrored for the API.
#[derive(Debug, Default, Clone)]
pub struct TelemetryState {
    pub micro_found: bool,
    pub version: u8,
    pub temp: f32,
    pub temp_max: f32,
    pub vin: f32,
    pub iin: f32,
    pub vcore_mv: u32,
    pub fan_percent: u8,
    pub tach_rpm: u32,
    pub cooldown: bool,
    pub cooldown_count: u32,
    pub regulator_on: bool,
    /// API-requested changes, applied between polls.
    pub want_corev_mv: Option<u32>,
    pub want_fan_percent: Option<u8>,
    pub want_cooldown: Option<bool>,
}

/// Chip attribution of nonces on parts that leak a chip offset in the
/// job-id byte.
#[derive(Debug)]
pub struct ChipMap {
    pub nb2chip: [u16; 256],
    pub counts: [u64; 256],
    pub setup: bool,
}

impl Default for ChipMap {
    fn default() -> Self {
        Self {
            nb2chip: [0; 256],
            counts: [0; 256],
            setup: false,
        }
    }
}

/// All mutable state of one device.
#[derive(Debug)]
pub struct DeviceState {
    pub device_id: usize,
    pub ident: SubIdent,
    pub family: AsicFamily,
    pub serial: String,
    pub boost: bool,

    state: AtomicU8,
    enabled: AtomicBool,
    update_work: AtomicBool,

    pub ring: Mutex<WorkRing>,
    pub freq: Mutex<FreqState>,
    pub counters: Counters,
    pub times: Mutex<Timestamps>,
    pub asics: Mutex<Vec<AsicInfo>>,
    pub telem: Mutex<TelemetryState>,
    pub chipmap: Mutex<ChipMap>,
    pub gh: Mutex<HashRateBuckets>,
    pub jobs: Mutex<JobBuckets>,

    /// Epoch for the estimator time axis.
    pub epoch: Instant,
}

impl DeviceState {
    pub fn new(
        device_id: usize,
        ident: SubIdent,
        serial: String,
        boost: bool,
        start_freq: f64,
        requested_freq: f64,
    ) -> Self {
        let family = ident.family();
        let p = family.params();
        Self {
            device_id,
            ident,
            family,
            serial,
            boost: boost && (p.boost_extra > 0 || p.version_mask != 0),
            state: AtomicU8::new(MiningState::Init as u8),
            enabled: AtomicBool::new(true),
            update_work: AtomicBool::new(false),
            ring: Mutex::new(WorkRing::new(p.max_job_id)),
            freq: Mutex::new(FreqState::new(
                family,
                ident.expected_chips(),
                family.snap_frequency(start_freq),
                family.snap_frequency(requested_freq),
            )),
            counters: Counters::default(),
            times: Mutex::new(Timestamps::default()),
            asics: Mutex::new(Vec::new()),
            telem: Mutex::new(TelemetryState::default()),
            chipmap: Mutex::new(ChipMap::default()),
            gh: Mutex::new(HashRateBuckets::new()),
            jobs: Mutex::new(JobBuckets::new()),
            epoch: Instant::now(),
        }
    }

    pub fn mining_state(&self) -> MiningState {
        MiningState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_mining_state(&self, new: MiningState) {
        self.state.store(new as u8, Ordering::Release);
    }

    /// CAS so two loops racing the same transition don't double-fire the
    /// entry actions.
    pub fn transition(&self, from: MiningState, to: MiningState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn request_update_work(&self) {
        self.update_work.store(true, Ordering::Release);
    }

    pub fn take_update_work(&self) -> bool {
        self.update_work.swap(false, Ordering::AcqRel)
    }

    /// Monotonic time since this device's epoch, for the estimators.
    pub fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Flush in-flight work: mark ring slots stale and ask the sender for
    /// fresh work. Called on pool work-restart.
    pub fn flush_work(&self) {
        self.ring.lock().flush();
        self.request_update_work();
    }

    /// Populate per-chip records once the chip count is known.
    pub fn commit_chips(&self, chips: u32) {
        let mut freq = self.freq.lock();
        freq.chips = chips.min(freq.expected_chips);
        let committed = freq.chips;
        let frequency = freq.frequency;
        freq.update_rates(self.family);
        drop(freq);

        let mut asics = self.asics.lock();
        asics.clear();
        asics.extend((0..committed).map(|_| AsicInfo::new(frequency)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::testing::stub_work;

    fn state() -> DeviceState {
        DeviceState::new(0, SubIdent::Gsh, "test01".into(), false, 100.0, 400.0)
    }

    #[test]
    fn hashrate_identity_tracks_updates() {
        let s = state();
        {
            let mut f = s.freq.lock();
            f.chips = 3;
            f.cores = 114;
            f.frequency = 500.0;
            f.hr_scale = 1.0;
            f.update_rates(AsicFamily::BM1387);
            assert_eq!(f.hashrate, 171_000_000_000);
        }
        s.commit_chips(2);
        let f = s.freq.lock();
        assert_eq!(f.hashrate, 114_000_000_000);
        assert!((f.fullscan_ms - 37.68).abs() < 0.01, "{}", f.fullscan_ms);
    }

    #[test]
    fn ticket_mask_is_power_of_two_minus_one() {
        let mut f = FreqState::new(AsicFamily::BM1362, 12, 100.0, 500.0);
        f.chips = 12;
        for mhz in [50.0, 200.0, 400.0, 800.0] {
            f.frequency = mhz;
            f.update_rates(AsicFamily::BM1362);
            assert_eq!(f.difficulty, f.ticket_mask + 1);
            assert_eq!((f.ticket_mask + 1).count_ones(), 1);
        }
    }

    #[test]
    fn bm1387_never_masks_tickets() {
        let mut f = FreqState::new(AsicFamily::BM1387, 2, 100.0, 700.0);
        f.chips = 2;
        f.frequency = 700.0;
        f.update_rates(AsicFamily::BM1387);
        assert_eq!(f.ticket_mask, 0);
        assert_eq!(f.difficulty, 1);
    }

    #[test]
    fn job_ids_cycle_without_repeats() {
        let mut ring = WorkRing::new(0x7f);
        let mut seen = std::collections::HashSet::new();
        let first = ring.advance_job_id(AsicFamily::BM1387);
        seen.insert(first);
        loop {
            let id = ring.advance_job_id(AsicFamily::BM1387);
            assert!(id < 0x7f - 3);
            if !seen.insert(id) {
                // every id in range must have been visited first
                assert_eq!(seen.len(), (0x7f - 3) as usize);
                break;
            }
        }
    }

    #[test]
    fn flush_marks_slots_stale_without_freeing() {
        let mut ring = WorkRing::new(0x1f);
        ring.stash(4, stub_work(42));
        assert!(ring.work_at(4).is_some());
        ring.flush();
        assert!(ring.work_at(4).is_none(), "stale slot must read as absent");
        // but the work is still there for drain to release
        let drained = ring.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, 42);
    }

    #[test]
    fn stash_returns_displaced_work() {
        let mut ring = WorkRing::new(0x1f);
        assert!(ring.stash(7, stub_work(1)).is_none());
        let old = ring.stash(7, stub_work(2)).expect("displaced");
        assert_eq!(old.id, 1);
    }

    #[test]
    fn chip_commit_caps_at_expected() {
        let s = state();
        s.commit_chips(50);
        assert_eq!(s.freq.lock().chips, 2, "GSH carries two chips at most");
    }

    #[test]
    fn zero_stats_resets_all_counters() {
        let s = state();
        s.counters.nonces.store(10, Ordering::Relaxed);
        s.counters.dups.store(3, Ordering::Relaxed);
        s.counters.accepted.store(9, Ordering::Relaxed);
        s.counters.zero_stats();
        assert_eq!(s.counters.nonces.load(Ordering::Relaxed), 0);
        assert_eq!(s.counters.dups.load(Ordering::Relaxed), 0);
        assert_eq!(s.counters.accepted.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn state_transitions_are_compare_and_swap() {
        let s = state();
        assert_eq!(s.mining_state(), MiningState::Init);
        assert!(s.transition(MiningState::Init, MiningState::ChipCount));
        assert!(!s.transition(MiningState::Init, MiningState::ChipCount));
        assert_eq!(s.mining_state(), MiningState::ChipCount);
    }
}
