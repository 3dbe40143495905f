//! The nonce-dispatch loop.
//!
//! Consumes raw nonce frames from the receiver, finds the in-flight work
//! they belong to, validates AsicBoost variants, and submits results
//! through the work source. Duplicate and hardware-error accounting lives
//! here because both need the match result.

use super::state::{DeviceState, MiningState};
use super::DeviceHooks;
use crate::asic::frame::NonceFrame;
use crate::asic::AsicFamily;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// A nonce frame with its capture time (device-epoch relative).
#[derive(Debug, Clone, Copy)]
pub struct NonceEvent {
    pub frame: NonceFrame,
    pub when: Duration,
}

/// What became of one nonce event. Returned for tests; the loop only logs.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// No live slot matched the echoed job id.
    Stale,
    /// Same 32-bit value as the previous nonce.
    Duplicate,
    Accepted,
    Rejected,
}

pub async fn run(
    state: Arc<DeviceState>,
    hooks: DeviceHooks,
    mut rx: mpsc::Receiver<NonceEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            e = rx.recv() => match e {
                Some(e) => e,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let outcome = dispatch(&state, &hooks, event);
        trace!(device = state.device_id, "nonce outcome: {outcome:?}");
    }

    debug!(device = state.device_id, "nonce dispatcher stopped");
}

/// Match, validate and submit a single nonce.
pub fn dispatch(state: &DeviceState, hooks: &DeviceHooks, event: NonceEvent) -> Outcome {
    let family = state.family;
    let p = family.params();
    let nonce = event.frame.nonce;
    let echoed = (event.frame.job_id & p.job_id_mask) as u32;

    if echoed > p.max_job_id {
        return Outcome::Stale;
    }

    let difficulty = state.freq.lock().difficulty as u64;

    let mut ring = state.ring.lock();

    // candidate slots: the echoed id and the family's backward offsets
    let span = (p.max_job_id + 1) as i64;
    let candidate = p
        .cur_attempt
        .iter()
        .map(|off| (((echoed as i64 + *off as i64) % span + span) % span) as u32)
        .find(|id| ring.is_active(*id));

    let Some(job_id) = candidate else {
        return Outcome::Stale;
    };

    // live-range check against the sender's current position; the bound is
    // the magnitude of the largest backward offset
    let dist = ((ring.job_id as i64 - job_id as i64) % span + span) % span;
    let reach = (p.cur_attempt.len() as i64 - 1) * p.add_job_id as i64;
    if dist > reach {
        return Outcome::Stale;
    }

    if nonce == ring.prev_nonce {
        state.counters.dups.fetch_add(1, Ordering::Relaxed);
        state.counters.dupsall.fetch_add(1, Ordering::Relaxed);
        ring.run_dups += 1;
        if ring.run_dups == 1 {
            info!(
                device = state.device_id,
                "duplicate nonce {nonce:08x} @ {job_id:02x}"
            );
            state.transition(MiningState::Mining, MiningState::MiningDups);
        }
        return Outcome::Duplicate;
    }
    ring.run_dups = 0;
    ring.prev_nonce = nonce;

    state.counters.nonces.fetch_add(1, Ordering::Relaxed);
    state.counters.nonceless.store(0, Ordering::Relaxed);
    state.times.lock().last_nonce = Instant::now();
    state.gh.lock().add_nonce(event.when, difficulty);

    // chip attribution for parts that echo a chip offset
    let chips = state.freq.lock().chips;
    if p.job_id_mask != 0xff && chips > 0 {
        let chip = family.address_to_chip(chips, event.frame.job_id & !p.job_id_mask);
        let mut map = state.chipmap.lock();
        map.counts[event.frame.byte3 as usize] += 1;
        map.nb2chip[event.frame.byte3 as usize] = chip as u16;
        map.setup = true;
        drop(map);
        let mut asics = state.asics.lock();
        if let Some(asic) = asics.get_mut(chip as usize) {
            asic.last_nonce = Instant::now();
            asic.nonces += 1;
        }
    }

    let vmask = ring.vmask;
    let boosted = vmask && family == AsicFamily::BM1387 && state.boost;

    // AsicBoost: find which midstate actually produced the hash and patch
    // the rolled version bits into the header before submitting.
    if boosted {
        let mut matched = false;
        for (k, off) in p.cur_attempt.iter().enumerate() {
            let cand = (((echoed as i64 + *off as i64) % span + span) % span) as u32;
            if let Some(work) = ring.work_at_mut(cand) {
                work.apply_version(k);
                if hooks.source.test_nonce(work, nonce) {
                    trace!(device = state.device_id, "boost nonce via midstate{k}");
                    matched = true;
                    break;
                }
            }
        }
        if !matched {
            debug!(
                device = state.device_id,
                "boost nonce {nonce:08x} matched no midstate"
            );
        }
    }

    let Some(work) = ring.work_at_mut(job_id) else {
        return Outcome::Stale;
    };
    work.device_diff = difficulty;

    let hw_before = hooks.source.hw_errors();
    let accepted = hooks.source.submit_nonce(state.device_id, work, nonce);
    drop(ring);

    if accepted {
        state.counters.accepted.fetch_add(1, Ordering::Relaxed);
        Outcome::Accepted
    } else {
        if hooks.source.hw_errors() != hw_before {
            state.counters.hw_errors.fetch_add(1, Ordering::Relaxed);
        }
        Outcome::Rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::SubIdent;
    use crate::work::testing::{stub_work, QueueSource};
    use crate::work::WorkSource;

    fn setup(accepting: bool) -> (Arc<DeviceState>, DeviceHooks) {
        let state = Arc::new(DeviceState::new(
            0,
            SubIdent::Gsh,
            "t1".into(),
            false,
            100.0,
            400.0,
        ));
        state.commit_chips(2);
        state.set_mining_state(MiningState::Mining);
        let source: Arc<dyn WorkSource> = if accepting {
            Arc::new(QueueSource::new(vec![]))
        } else {
            Arc::new(QueueSource::rejecting(vec![]))
        };
        (state, DeviceHooks { source })
    }

    fn event(nonce: u32, job_id: u8) -> NonceEvent {
        NonceEvent {
            frame: NonceFrame {
                nonce,
                job_id,
                byte3: (nonce & 0xff) as u8,
            },
            when: Duration::from_secs(1),
        }
    }

    #[test]
    fn stale_job_ids_are_dropped() {
        let (state, hooks) = setup(true);
        // nothing stashed: every job id is stale
        assert_eq!(dispatch(&state, &hooks, event(0x1111, 0x05)), Outcome::Stale);
        assert_eq!(state.counters.nonces.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn matched_nonce_submits_and_counts() {
        let (state, hooks) = setup(true);
        {
            let mut ring = state.ring.lock();
            ring.job_id = 5;
            ring.stash(5, stub_work(99));
        }
        assert_eq!(dispatch(&state, &hooks, event(0xabcd, 0x05)), Outcome::Accepted);
        assert_eq!(state.counters.nonces.load(Ordering::Relaxed), 1);
        assert_eq!(state.counters.accepted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn duplicate_run_counts_once_as_nonce() {
        let (state, hooks) = setup(true);
        {
            let mut ring = state.ring.lock();
            ring.job_id = 5;
            ring.stash(5, stub_work(99));
        }
        assert_eq!(dispatch(&state, &hooks, event(0x7777, 0x05)), Outcome::Accepted);
        assert_eq!(dispatch(&state, &hooks, event(0x7777, 0x05)), Outcome::Duplicate);
        assert_eq!(dispatch(&state, &hooks, event(0x7777, 0x05)), Outcome::Duplicate);

        assert_eq!(state.counters.nonces.load(Ordering::Relaxed), 1);
        assert_eq!(state.counters.dups.load(Ordering::Relaxed), 2);
        assert_eq!(state.counters.dupsall.load(Ordering::Relaxed), 2);
        // the first duplicate of the run flips the state
        assert_eq!(state.mining_state(), MiningState::MiningDups);
    }

    #[test]
    fn accepted_does_not_grow_on_duplicates() {
        let (state, hooks) = setup(true);
        {
            let mut ring = state.ring.lock();
            ring.job_id = 3;
            ring.stash(3, stub_work(1));
        }
        dispatch(&state, &hooks, event(0x42, 0x03));
        let accepted = state.counters.accepted.load(Ordering::Relaxed);
        dispatch(&state, &hooks, event(0x42, 0x03));
        assert_eq!(state.counters.accepted.load(Ordering::Relaxed), accepted);
    }

    #[test]
    fn rejection_scores_hw_error() {
        let (state, hooks) = setup(false);
        {
            let mut ring = state.ring.lock();
            ring.job_id = 2;
            ring.stash(2, stub_work(1));
        }
        assert_eq!(dispatch(&state, &hooks, event(0x1234, 0x02)), Outcome::Rejected);
        assert_eq!(state.counters.hw_errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn backward_offsets_recover_recent_slots() {
        let (state, hooks) = setup(true);
        {
            let mut ring = state.ring.lock();
            ring.job_id = 7;
            ring.stash(6, stub_work(2));
        }
        // job id 7 has no slot, but 7-1=6 does
        assert_eq!(dispatch(&state, &hooks, event(0x9999, 0x07)), Outcome::Accepted);
    }

    #[test]
    fn flushed_ring_treats_everything_as_stale() {
        let (state, hooks) = setup(true);
        {
            let mut ring = state.ring.lock();
            ring.job_id = 4;
            ring.stash(4, stub_work(3));
        }
        state.flush_work();
        assert_eq!(dispatch(&state, &hooks, event(0x5555, 0x04)), Outcome::Stale);
    }
}
