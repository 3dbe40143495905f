//! The receiver loop: bounded reads, frame handoff, liveness timers.
//!
//! Reads are cancellable so a pool work-restart can interrupt a blocked
//! wait; cancellation is indistinguishable from an ordinary timeout here.
//! Classification results either mutate shared state directly (chip
//! replies, frequency reports) or go to the nonce dispatcher's queue.

use super::nonce::NonceEvent;
use super::state::{DeviceState, MiningState};
use super::{telemetry, Tunables};
use crate::asic::frame::{classify, FrameClass};
use crate::error::UsbError;
use crate::usb::{ReadOptions, Session};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const READ_TIMEOUT: Duration = Duration::from_millis(200);

const MICRO_PING_INTERVAL: Duration = Duration::from_secs(5);

pub async fn run(
    state: Arc<DeviceState>,
    session: Arc<Session>,
    nonce_tx: mpsc::Sender<NonceEvent>,
    tunables: Tunables,
    cancel: CancellationToken,
) {
    let rx_len = state.family.params().rx_len;
    let mut last_chip_reply = Instant::now();

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match state.mining_state() {
            MiningState::Shutdown | MiningState::ShutdownOk => break,
            _ => {}
        }

        let opts = ReadOptions {
            once: true,
            cancellable: true,
            terminator: None,
        };
        match session.read_default(rx_len, READ_TIMEOUT, opts).await {
            Ok(bytes) if bytes.len() >= rx_len => {
                trace!(
                    device = state.device_id,
                    "RX: {}",
                    hex::encode(&bytes[..rx_len])
                );
                handle_frame(&state, &nonce_tx, &bytes[..rx_len], &mut last_chip_reply);
            }
            Ok(_) => {
                idle_chores(&state, &session, &tunables, last_chip_reply).await;
            }
            Err(UsbError::NoDevice) => {
                warn!(device = state.device_id, "device lost");
                state.set_mining_state(MiningState::ShutdownOk);
                break;
            }
            Err(e) if e.is_fatal() => {
                warn!(device = state.device_id, "receive failed: {e}");
                state.set_mining_state(MiningState::ShutdownOk);
                break;
            }
            Err(_) => {
                idle_chores(&state, &session, &tunables, last_chip_reply).await;
            }
        }
    }

    debug!(device = state.device_id, "receiver loop stopped");
}

fn handle_frame(
    state: &DeviceState,
    nonce_tx: &mpsc::Sender<NonceEvent>,
    rx: &[u8],
    last_chip_reply: &mut Instant,
) {
    match classify(state.family, rx) {
        FrameClass::ChipReply => {
            if matches!(
                state.mining_state(),
                MiningState::ChipCount | MiningState::ChipCountXx
            ) {
                state.freq.lock().chips += 1;
                state.set_mining_state(MiningState::ChipCountXx);
                *last_chip_reply = Instant::now();
            }
        }

        FrameClass::FrequencyReport(Some(reported)) => {
            state.times.lock().last_frequency_report = Instant::now();
            let mut freq = state.freq.lock();
            if (reported - freq.frequency).abs() > f64::EPSILON {
                warn!(
                    device = state.device_id,
                    "frequency changed {:.2}MHz -> {reported:.2}MHz", freq.frequency
                );
                freq.frequency = reported;
                freq.update_rates(state.family);
            } else {
                trace!(
                    device = state.device_id,
                    "chip reported frequency of {reported:.2}MHz"
                );
            }
        }

        FrameClass::FrequencyReport(None) => {
            state.times.lock().last_frequency_report = Instant::now();
            warn!(device = state.device_id, "bad frequency");
        }

        FrameClass::OpenCoreNonce => {
            if state.mining_state() == MiningState::OpenCore {
                state.counters.zero_check.fetch_add(1, Ordering::Relaxed);
            }
        }

        FrameClass::Nonce(frame) => {
            if state.mining_state() == MiningState::Mining {
                let event = NonceEvent {
                    frame,
                    when: state.now(),
                };
                match nonce_tx.try_send(event) {
                    Ok(()) => {
                        state.counters.ntrigger.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        state.counters.ntimeout.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        FrameClass::Noise => {}
    }
}

/// Quiet since the last chip reply for the whole idle window: the chain
/// has answered in full, commit the count.
fn maybe_commit_chips(state: &DeviceState, chip_idle: Duration, last_chip_reply: Instant) -> bool {
    if state.mining_state() != MiningState::ChipCountXx
        || last_chip_reply.elapsed() <= chip_idle
    {
        return false;
    }
    let chips = state.freq.lock().chips;
    warn!(device = state.device_id, "found {chips} chip(s)");
    state.commit_chips(chips);
    state.set_mining_state(MiningState::ChipCountOk);
    true
}

/// Nothing on the line: commit pending chip counts and squeeze in an MCU
/// temperature poll when the wire has settled.
async fn idle_chores(
    state: &DeviceState,
    session: &Session,
    tunables: &Tunables,
    last_chip_reply: Instant,
) {
    if maybe_commit_chips(state, tunables.chip_idle, last_chip_reply) {
        return;
    }

    // On the CBUS-muxed models the MCU shares the mining wire, so only
    // poll in the shadow of a finished task write.
    if state.ident.has_micro() && state.telem.lock().micro_found {
        let (micro_age, task_age) = {
            let times = state.times.lock();
            (
                times.last_micro_ping.elapsed(),
                times.last_task.elapsed(),
            )
        };
        if micro_age > MICRO_PING_INTERVAL
            && task_age > Duration::from_millis(1)
            && task_age < Duration::from_millis(3)
        {
            telemetry::poll_temperature(state, session).await;
            state.times.lock().last_micro_ping = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::crc::stamp_crc5;
    use crate::asic::SubIdent;

    fn bm1384_state() -> Arc<DeviceState> {
        let state = Arc::new(DeviceState::new(
            0,
            SubIdent::Bse,
            "t".into(),
            false,
            100.0,
            200.0,
        ));
        state.set_mining_state(MiningState::ChipCount);
        state
    }

    fn chip_reply() -> Vec<u8> {
        let mut frame = vec![0x13, 0x84, 0x00, 0x00, 0x00];
        stamp_crc5(&mut frame);
        frame
    }

    #[tokio::test]
    async fn chip_enumeration_counts_replies_then_commits() {
        let state = bm1384_state();
        let (tx, _rx) = mpsc::channel(4);
        let mut last_reply = Instant::now();

        for _ in 0..3 {
            handle_frame(&state, &tx, &chip_reply(), &mut last_reply);
        }
        assert_eq!(state.mining_state(), MiningState::ChipCountXx);
        assert_eq!(state.freq.lock().chips, 3);

        // inside the idle window nothing commits
        assert!(!maybe_commit_chips(&state, Duration::from_millis(50), Instant::now()));
        assert_eq!(state.mining_state(), MiningState::ChipCountXx);

        // once the window expires the count is final
        let stale = Instant::now() - Duration::from_millis(60);
        assert!(maybe_commit_chips(&state, Duration::from_millis(50), stale));
        assert_eq!(state.mining_state(), MiningState::ChipCountOk);
        assert_eq!(state.freq.lock().chips, 3);
        assert_eq!(state.asics.lock().len(), 3);
    }

    #[tokio::test]
    async fn chip_replies_outside_enumeration_are_ignored() {
        let state = bm1384_state();
        state.set_mining_state(MiningState::Mining);
        let (tx, _rx) = mpsc::channel(4);
        let mut last_reply = Instant::now();
        handle_frame(&state, &tx, &chip_reply(), &mut last_reply);
        assert_eq!(state.freq.lock().chips, 0);
    }

    #[tokio::test]
    async fn frequency_report_updates_rates() {
        let state = Arc::new(DeviceState::new(
            0,
            SubIdent::Gsh,
            "t".into(),
            false,
            100.0,
            400.0,
        ));
        state.commit_chips(2);
        state.set_mining_state(MiningState::Mining);
        let (tx, _rx) = mpsc::channel(4);
        let mut last_reply = Instant::now();

        // 25 * 0x40 / (2 * 2 * 1) = 400 MHz
        let mut frame = vec![0x80, 0x40, 0x02, 0x21, 0x00, 0x00, 0x00];
        stamp_crc5(&mut frame);
        handle_frame(&state, &tx, &frame, &mut last_reply);

        let freq = state.freq.lock();
        assert_eq!(freq.frequency, 400.0);
        assert_eq!(
            freq.hashrate,
            (2.0 * 114.0 * 400.0 * 1_000_000.0) as u64
        );
    }

    #[tokio::test]
    async fn mining_nonces_reach_the_dispatcher() {
        let state = Arc::new(DeviceState::new(
            0,
            SubIdent::Bse,
            "t".into(),
            false,
            100.0,
            200.0,
        ));
        state.set_mining_state(MiningState::Mining);
        let (tx, mut rx) = mpsc::channel(4);
        let mut last_reply = Instant::now();

        // BM1384 nonce frame (not CRC5-valid on purpose)
        handle_frame(&state, &tx, &[0xde, 0xad, 0xbe, 0xef, 0x85], &mut last_reply);
        let event = rx.try_recv().expect("nonce queued");
        assert_eq!(event.frame.nonce, 0xdead_beef);
        assert_eq!(state.counters.ntrigger.load(Ordering::Relaxed), 1);
    }
}
