//! The sender loop: task pacing, health checks, frequency management.
//!
//! One iteration inspects the state machine, possibly sends one task, and
//! sleeps a fraction of the full-scan time. The loop is also the only
//! writer of frequency changes, so the chip observes task and PLL traffic
//! in a single order.

use super::machine::{Machine, Tick};
use super::state::MiningState;
use crate::asic::task::TaskFrame;
use crate::asic::AsicFamily;
use crate::error::UsbError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grace period after (re)start before nonce-flow health checks fire.
const MONITOR_GRACE: Duration = Duration::from_secs(30);

/// Rolling-rate health checks need this much history.
const HEALTH_WINDOW: Duration = Duration::from_secs(3 * 60);

/// No PLL readback for this long means the chain dropped off the wire.
const FREQ_REPORT_LIMIT: Duration = Duration::from_millis(22_500);

const FREQ_PING_INTERVAL: Duration = Duration::from_secs(5);

pub async fn run(machine: Machine, cancel: CancellationToken) {
    raise_priority(machine.state.device_id);

    let state = Arc::clone(&machine.state);
    let family = state.family;
    let wait_factor = if machine.state.boost && family == AsicFamily::BM1387 {
        1.8
    } else {
        0.6
    };

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match state.mining_state() {
            MiningState::Shutdown | MiningState::ShutdownOk => break,
            _ => {}
        }

        match machine.tick().await {
            Ok(Tick::Continue) => {}
            Ok(Tick::DeviceGone) => {
                state.set_mining_state(MiningState::ShutdownOk);
                break;
            }
            Err(UsbError::NoDevice) => {
                state.set_mining_state(MiningState::ShutdownOk);
                break;
            }
            Err(e) if e.is_fatal() => {
                warn!(device = state.device_id, "usb failure ({e})");
                state.set_mining_state(MiningState::Reset);
                continue;
            }
            Err(_) => {}
        }

        if !state.is_enabled()
            || machine.session.nodev()
            || state.mining_state() != MiningState::Mining
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        }

        let fullscan_ms = state.freq.lock().fullscan_ms;
        let max_task_wait = (wait_factor * fullscan_ms).clamp(1.0, 3.0 * fullscan_ms);
        let sleep_ms = ((max_task_wait / 8.0).ceil()).clamp(1.0, 200.0) as u64;

        let now = Instant::now();
        let due = {
            let times = state.times.lock();
            now.duration_since(times.last_task).as_millis() as f64 > max_task_wait
        };

        if state.take_update_work() || due {
            if health_checks(&machine, now).await {
                continue;
            }
            if let Err(e) = step_frequency(&machine, now).await {
                if matches!(e, UsbError::NoDevice) {
                    state.set_mining_state(MiningState::ShutdownOk);
                    break;
                }
            }
            match send_one_task(&machine, now).await {
                Ok(()) => {}
                Err(UsbError::NoDevice) => {
                    state.set_mining_state(MiningState::ShutdownOk);
                    break;
                }
                Err(e) if e.is_fatal() => {
                    warn!(device = state.device_id, "usb failure ({e})");
                    state.set_mining_state(MiningState::Reset);
                    continue;
                }
                Err(_) => {}
            }
        }

        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
    }

    // Parting courtesy: drop BM1384 sticks back to a cool clock. The
    // BM1387-family regulator is zeroed by the telemetry task.
    if family == AsicFamily::BM1384 && !machine.session.nodev() {
        let current = state.freq.lock().frequency;
        if current as u32 != 100 {
            let _ = machine.set_frequency(100.0).await;
        }
    }

    debug!(device = state.device_id, "sender loop stopped");
}

/// Nonce-flow and liveness checks. Returns true when a reset was queued.
async fn health_checks(machine: &Machine, now: Instant) -> bool {
    let state = &machine.state;
    let (monitor_age, nonce_age, ping_age, report_age) = {
        let times = state.times.lock();
        (
            now.duration_since(times.monitor_time),
            now.duration_since(times.last_nonce),
            now.duration_since(times.last_frequency_ping),
            now.duration_since(times.last_frequency_report),
        )
    };

    if monitor_age > MONITOR_GRACE {
        let requested = state.freq.lock().frequency_requested;
        let max_nononce = Duration::from_millis((3000.0 * (200.0 / requested)) as u64);
        if nonce_age > max_nononce {
            warn!(device = state.device_id, "missing nonces");
            state.set_mining_state(MiningState::Reset);
            return true;
        }
    }

    if ping_age > FREQ_PING_INTERVAL {
        let ping = crate::asic::task::frequency_ping(state.family);
        if machine.send_cmd(&ping).await.is_ok() {
            state.times.lock().last_frequency_ping = Instant::now();
        }

        let (hashrate, healthy) = {
            let freq = state.freq.lock();
            (freq.hashrate, state.family.params().healthy)
        };
        let rate_1m = state.gh.lock().rate(state.now(), 60);

        if monitor_age > HEALTH_WINDOW {
            if let Some(rate) = rate_1m {
                if rate < healthy * hashrate as f64 {
                    warn!(device = state.device_id, "unhealthy miner");
                    state.set_mining_state(MiningState::Reset);
                    return true;
                }
            }

            // expected-rate tuner: persistent shortfall steps the request
            // down, surplus lets it climb back toward the configured clock
            if let Some(rate_5m) = state.gh.lock().rate(state.now(), 300) {
                let mut freq = state.freq.lock();
                let expected = freq.hashrate as f64;
                if rate_5m < machine.tunables.ghrequire * expected {
                    let lowered = (freq.frequency_requested - freq.step_freq).max(freq.min_freq);
                    if lowered < freq.frequency_requested {
                        info!(
                            device = state.device_id,
                            "tuning down to {lowered:.2}MHz (rate {:.1}GH/s)",
                            rate_5m / 1e9
                        );
                        freq.frequency_requested = lowered;
                        drop(freq);
                        state.counters.low_eff_resets.fetch_add(1, Ordering::Relaxed);
                        state.set_mining_state(MiningState::Reset);
                        return true;
                    }
                } else if rate_5m > machine.tunables.tune_up * expected
                    && freq.frequency_requested < freq.frequency_default
                {
                    let raised =
                        (freq.frequency_requested + freq.step_freq).min(freq.frequency_default);
                    info!(device = state.device_id, "tuning up to {raised:.2}MHz");
                    freq.frequency_requested = raised;
                }
            }
        }

        if report_age > FREQ_REPORT_LIMIT {
            warn!(device = state.device_id, "asic(s) went offline");
            state.set_mining_state(MiningState::Reset);
            return true;
        }

        grade_chip_health(state, now);
    }

    false
}

/// Per-chip health from nonce recency. Only meaningful on parts whose
/// nonces identify their chip; the others keep every chip at the device's
/// aggregate health.
fn grade_chip_health(state: &super::state::DeviceState, now: Instant) {
    use super::state::AsicHealth;

    if state.family.params().job_id_mask == 0xff {
        return;
    }
    let mut asics = state.asics.lock();
    for asic in asics.iter_mut() {
        let silent = now.duration_since(asic.last_nonce);
        let graded = if silent > Duration::from_secs(180) {
            AsicHealth::Dead
        } else if silent > Duration::from_secs(120) {
            AsicHealth::AlmostDead
        } else if silent > Duration::from_secs(60) {
            AsicHealth::HalfDead
        } else {
            AsicHealth::Healthy
        };
        if graded != asic.health {
            debug!(
                device = state.device_id,
                "chip health {:?} -> {:?}", asic.health, graded
            );
            asic.health = graded;
        }
    }
}

/// Walk `frequency` toward `frequency_requested` one step per delay window.
async fn step_frequency(machine: &Machine, now: Instant) -> Result<(), UsbError> {
    let state = &machine.state;

    let ready = {
        let times = state.times.lock();
        let accepted = state.counters.accepted.load(Ordering::Relaxed);
        accepted > 10
            && now.duration_since(times.last_frequency_ping) > Duration::from_millis(100)
            && times.last_nonce >= times.last_frequency_adjust
            && now.duration_since(times.last_frequency_adjust) >= machine.tunables.step_delay
    };
    if !ready {
        return Ok(());
    }

    let target = {
        let freq = state.freq.lock();
        next_step(
            freq.frequency,
            freq.frequency_requested,
            machine.tunables.step_freq,
        )
    };

    if let Some(mhz) = target {
        machine.set_frequency(mhz).await?;
        machine.send_chain_inactive().await?;
        state.counters.accepted.store(0, Ordering::Relaxed);
        state.request_update_work();
    }
    state.times.lock().last_frequency_adjust = Instant::now();
    Ok(())
}

/// Pop one work item (or fall back to busy filler) and put it on the wire.
async fn send_one_task(machine: &Machine, now: Instant) -> Result<(), UsbError> {
    let state = &machine.state;
    let family = state.family;

    let (ticket_mask, task_hcn) = {
        let freq = state.freq.lock();
        (freq.ticket_mask, freq.task_hcn)
    };

    let work = machine.hooks.source.get_queued(state.device_id);
    let busy = work.is_none();

    let (bytes, displaced) = {
        let mut ring = state.ring.lock();
        match work {
            Some(new_work) => {
                let job_id = ring.advance_job_id(family);
                let displaced = ring.stash(job_id, new_work);
                let frame = TaskFrame {
                    family,
                    mining: true,
                    job_id,
                    ticket_mask,
                    task_hcn,
                    boost: state.boost,
                    work: ring.work_at(job_id),
                };
                (frame.encode(), displaced)
            }
            None => {
                let frame = TaskFrame {
                    family,
                    mining: true,
                    job_id: ring.job_id,
                    ticket_mask,
                    task_hcn,
                    boost: state.boost,
                    work: None,
                };
                (frame.encode(), None)
            }
        }
    };

    let timeout = Duration::from_millis(machine.session.descriptor.timeout_ms);
    let task_len = bytes.len();
    match machine.session.write_default(&bytes, timeout).await {
        Ok(sent) if sent != task_len => {
            let mut times = state.times.lock();
            if now.duration_since(times.last_write_error) > Duration::from_secs(5) {
                warn!(
                    device = state.device_id,
                    "usb write error [{sent}:{task_len}]"
                );
                times.last_write_error = Instant::now();
            }
        }
        Ok(_) => {}
        Err(UsbError::Timeout { partial }) => {
            let mut times = state.times.lock();
            if now.duration_since(times.last_write_error) > Duration::from_secs(5) {
                warn!(
                    device = state.device_id,
                    "usb write error [{partial}:{task_len}]"
                );
                times.last_write_error = Instant::now();
            }
        }
        Err(e) => return Err(e),
    }

    if let Some(old) = displaced {
        machine.hooks.source.work_completed(state.device_id, old);
    }

    state.counters.tasks.fetch_add(1, Ordering::Relaxed);
    if busy {
        state.counters.busy_tasks.fetch_add(1, Ordering::Relaxed);
        // busy filler keeps the monitor window open instead of the chips
        state.times.lock().monitor_time = Instant::now();
    } else {
        state.jobs.lock().add_job(state.now());
    }

    {
        let mut times = state.times.lock();
        let elapsed = now.duration_since(times.last_task).as_millis() as f64;
        times.last_task = Instant::now();
        drop(times);
        let mut freq = state.freq.lock();
        freq.task_ms = (freq.task_ms * 9.0 + elapsed) / 10.0;
    }

    Ok(())
}

/// One step of the walk from `current` toward `requested`, never
/// overshooting. `None` once they meet.
fn next_step(current: f64, requested: f64, step: f64) -> Option<f64> {
    if current == requested {
        None
    } else if current < requested {
        Some((current + step).min(requested))
    } else {
        Some((current - step).max(requested))
    }
}

/// Best-effort scheduling boost; the pacing math assumes the sender wakes
/// on time.
fn raise_priority(device_id: usize) {
    match rustix::process::nice(-15) {
        Ok(nice) => debug!(device = device_id, "sender niceness {nice}"),
        Err(e) => debug!(device = device_id, "cannot raise priority: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::next_step;

    #[test]
    fn ramp_reaches_target_in_expected_steps() {
        // 100 MHz start, 400 MHz requested, 6.25 MHz steps: 48 adjustments
        let mut current = 100.0;
        let mut steps = 0;
        while let Some(next) = next_step(current, 400.0, 6.25) {
            current = next;
            steps += 1;
            assert!(steps <= 48, "ramp must converge");
        }
        assert_eq!(current, 400.0);
        assert_eq!(steps, 48);
    }

    #[test]
    fn downward_steps_never_overshoot() {
        assert_eq!(next_step(400.0, 396.0, 6.25), Some(396.0));
        assert_eq!(next_step(400.0, 200.0, 6.25), Some(393.75));
        assert_eq!(next_step(200.0, 200.0, 6.25), None);
    }

    #[test]
    fn pacing_clamps() {
        // max_task_wait and sleep_ms bounds from the loop
        let fullscan_ms: f64 = 37.68;
        let wait = (0.6 * fullscan_ms).clamp(1.0, 3.0 * fullscan_ms);
        assert!((wait - 22.608).abs() < 1e-9);
        let sleep = ((wait / 8.0).ceil()).clamp(1.0, 200.0) as u64;
        assert_eq!(sleep, 3);
    }
}
