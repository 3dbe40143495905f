//! Auxiliary MCU channel: temperature, power, fan and regulator control.
//!
//! On the stick models the MCU shares the mining serial link behind the
//! FTDI CBUS mux, so every exchange reprograms the lines, settles, talks,
//! and restores them. The pod models expose the MCU on a second USB
//! interface and skip the dance. API-requested changes (core voltage, fan,
//! cool-down) are applied here, between polls, never concurrently with
//! them.

use super::state::{DeviceState, MiningState};
use crate::usb::{ReadOptions, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Command byte layout: opcode in the top five bits, channel in the low
/// three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MicroCommand {
    GetFan = 0x00 << 3,
    GetRpm = 0x01 << 3,
    GetVin = 0x02 << 3,
    GetIin = 0x03 << 3,
    GetTemp = 0x04 << 3,
    GetVnode0 = 0x05 << 3,

    ClrBen = 0x08 << 3,
    SetBen = 0x09 << 3,
    ClrLed = 0x0a << 3,
    SetLed = 0x0b << 3,
    ClrRst = 0x0c << 3,
    SetRst = 0x0d << 3,

    SetFan = 0x18 << 3,
    SetVcore = 0x1c << 3,
}

/// Core voltage encoding: millivolts above the 300 mV base in 2 mV steps.
pub fn vcore_byte(mv: u32) -> u8 {
    let mv = mv.clamp(300, 810);
    ((mv as f64 / 1000.0 - 0.3) / 0.002) as u8
}

/// Raw temperature to °C for the V1 micro. Later MCU revisions use a
/// different transform, so callers go through [`temp_c`].
fn temp_c_v1(raw: u8) -> f32 {
    32.0 + 1.8 * raw as f32
}

/// Per-model raw-to-°C conversion.
pub fn temp_c(version: u8, raw: u8) -> f32 {
    match version & 0xf0 {
        0x20 => raw as f32,
        _ => temp_c_v1(raw),
    }
}

/// Cool-down thresholds: enter above, leave below.
const COOLDOWN_ENTER_C: f32 = 85.0;
const COOLDOWN_LEAVE_C: f32 = 75.0;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Which interface carries the MCU, and whether CBUS muxing is needed.
fn micro_route(session: &Session) -> (usize, bool) {
    if session.descriptor.interfaces.len() > 1 {
        (1, false)
    } else {
        (0, true)
    }
}

/// One command/response exchange with the MCU. Returns the reply byte, or
/// `None` when the MCU stayed silent.
pub async fn micro_send(
    state: &DeviceState,
    session: &Session,
    cmd: MicroCommand,
    channel: u8,
    value: u8,
) -> Option<u8> {
    let (iface, cbus) = micro_route(session);

    if cbus {
        // hand the serial lines to the MCU and let them settle
        if session.ftdi_set_cbus(0xf3).await.is_err() {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let reply = micro_exchange(session, iface, cmd, channel, value).await;

    if cbus {
        let _ = session.ftdi_set_cbus(0xf2).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    match &reply {
        Some(byte) => debug!(device = state.device_id, "(micro) RX: {byte:02x}"),
        None => debug!(device = state.device_id, "(micro) no reply"),
    }
    reply
}

async fn micro_exchange(
    session: &Session,
    iface: usize,
    cmd: MicroCommand,
    channel: u8,
    value: u8,
) -> Option<u8> {
    // stale bytes from before the mux switch would shift the reply
    let _ = session
        .read(iface, 0, 255, Duration::from_millis(1), ReadOptions::default())
        .await;

    let mut frame = vec![cmd as u8 | channel];
    if value != 0 || cmd == MicroCommand::SetVcore {
        frame.push(value);
    }
    session
        .write(iface, 1, &frame, Duration::from_millis(100))
        .await
        .ok()?;

    let reply = session
        .read(iface, 0, 1, Duration::from_millis(5), ReadOptions::default())
        .await
        .ok()?;
    reply.first().copied()
}

/// Probe for the MCU; absence is not an error, the stick just runs without
/// telemetry ("dummy mode").
pub async fn detect(state: &DeviceState, session: &Session, vcore_mv: u32) -> bool {
    state.telem.lock().micro_found = true; // so micro_send doesn't bail

    let found = micro_send(state, session, MicroCommand::GetTemp, 0, 0)
        .await
        .is_some();

    let vcore = {
        let mut telem = state.telem.lock();
        telem.micro_found = found;
        telem.version = if session.descriptor.interfaces.len() > 1 {
            0x20
        } else {
            0x10
        };

        if found {
            telem.vcore_mv = vcore_mv.clamp(300, 810);
            let vcc = vcore_byte(telem.vcore_mv);
            Some((vcc, telem.vcore_mv))
        } else {
            None
        }
    };

    if let Some((vcc, mv)) = vcore {
        info!(
            device = state.device_id,
            "requesting vcore of {mv}mV ({vcc:#x})"
        );
        micro_send(state, session, MicroCommand::SetVcore, 0, vcc).await;
        state.telem.lock().regulator_on = true;
    } else {
        info!(device = state.device_id, "micro not found : dummy mode");
    }
    found
}

/// Read the temperature and fold it into shared state. Called from the
/// receiver's idle window on muxed models and from the poll loop on pod
/// models.
pub async fn poll_temperature(state: &DeviceState, session: &Session) {
    let Some(raw) = micro_send(state, session, MicroCommand::GetTemp, 0, 0).await else {
        return;
    };
    let version = state.telem.lock().version;
    let celsius = temp_c(version, raw);

    let mut telem = state.telem.lock();
    if (celsius - telem.temp).abs() >= 1.0 {
        warn!(
            device = state.device_id,
            "micro temp changed to {celsius:.1}°C"
        );
    }
    telem.temp = celsius;
    if celsius > telem.temp_max {
        telem.temp_max = celsius;
    }
}

/// The telemetry task. Detects the MCU, applies API requests, polls the
/// sensors on pod models, and manages cool-down.
pub async fn run(
    state: Arc<DeviceState>,
    session: Arc<Session>,
    vcore_mv: u32,
    cancel: CancellationToken,
) {
    detect(&state, &session, vcore_mv).await;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }
        if !state.telem.lock().micro_found {
            continue;
        }
        match state.mining_state() {
            MiningState::Shutdown | MiningState::ShutdownOk => break,
            _ => {}
        }

        apply_requests(&state, &session).await;

        // pod models poll on their private interface; muxed sticks are
        // polled from the receiver's idle window instead
        if !micro_route(&session).1 {
            poll_temperature(&state, &session).await;
            if let Some(raw) = micro_send(&state, &session, MicroCommand::GetVin, 0, 0).await {
                state.telem.lock().vin = raw as f32 / 10.0;
            }
            if let Some(raw) = micro_send(&state, &session, MicroCommand::GetRpm, 0, 0).await {
                state.telem.lock().tach_rpm = raw as u32 * 60;
            }
        }

        cooldown_check(&state, &session).await;

        // regulator re-arm is what lets a REINIT pass restart mining
        if state.mining_state() == MiningState::Reinit && !state.telem.lock().regulator_on {
            micro_send(&state, &session, MicroCommand::SetBen, 0, 0).await;
            state.telem.lock().regulator_on = true;
        }
    }

    // zero the core voltage on the way out so an idle stick doesn't cook
    if state.telem.lock().micro_found && !session.nodev() {
        micro_send(&state, &session, MicroCommand::SetVcore, 0, 0).await;
    }
    debug!(device = state.device_id, "telemetry stopped");
}

/// Apply corev/fan/cool-down changes queued by the API.
async fn apply_requests(state: &DeviceState, session: &Session) {
    let (want_corev, want_fan, want_cooldown) = {
        let mut telem = state.telem.lock();
        (
            telem.want_corev_mv.take(),
            telem.want_fan_percent.take(),
            telem.want_cooldown.take(),
        )
    };

    if let Some(mv) = want_corev {
        let vcc = vcore_byte(mv);
        info!(device = state.device_id, "api: vcore -> {mv}mV");
        if micro_send(state, session, MicroCommand::SetVcore, 0, vcc)
            .await
            .is_some()
        {
            state.telem.lock().vcore_mv = mv.clamp(300, 810);
        }
    }

    if let Some(percent) = want_fan {
        let duty = percent.min(100);
        info!(device = state.device_id, "api: fan -> {duty}%");
        if micro_send(state, session, MicroCommand::SetFan, 0, duty)
            .await
            .is_some()
        {
            state.telem.lock().fan_percent = duty;
        }
    }

    if let Some(cool) = want_cooldown {
        set_cooldown(state, session, cool).await;
    }
}

async fn cooldown_check(state: &DeviceState, session: &Session) {
    let (temp, cooling) = {
        let telem = state.telem.lock();
        (telem.temp, telem.cooldown)
    };
    if !cooling && temp >= COOLDOWN_ENTER_C {
        warn!(device = state.device_id, "overheating ({temp:.1}°C), cooling down");
        set_cooldown(state, session, true).await;
    } else if cooling && temp <= COOLDOWN_LEAVE_C {
        info!(device = state.device_id, "cooled to {temp:.1}°C, resuming");
        set_cooldown(state, session, false).await;
    }
}

async fn set_cooldown(state: &DeviceState, session: &Session, on: bool) {
    let cmd = if on {
        MicroCommand::ClrBen
    } else {
        MicroCommand::SetBen
    };
    micro_send(state, session, cmd, 0, 0).await;
    let mut telem = state.telem.lock();
    telem.cooldown = on;
    telem.regulator_on = !on;
    if on {
        telem.cooldown_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(300, 0x00; "floor")]
    #[test_case(400, 0x32; "default 400mV")]
    #[test_case(810, 0xff; "ceiling")]
    #[test_case(200, 0x00; "clamped low")]
    #[test_case(900, 0xff; "clamped high")]
    fn vcore_encoding(mv: u32, expect: u8) {
        assert_eq!(vcore_byte(mv), expect);
    }

    #[test]
    fn v1_temperature_transform() {
        assert_eq!(temp_c(0x10, 0), 32.0);
        assert!((temp_c(0x10, 100) - 212.0).abs() < 0.001);
    }

    #[test]
    fn v2_reports_celsius_directly() {
        assert_eq!(temp_c(0x20, 44), 44.0);
        assert_eq!(temp_c(0x21, 44), 44.0);
    }
}
