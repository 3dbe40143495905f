//! Per-device lifecycle driving.
//!
//! The sender loop owns the machine and calls [`Machine::tick`] every
//! iteration; the receiver only posts events (chip replies, frequency
//! reports, nonces) into shared state. All wire commands funnel through
//! here so ordering follows the session's write gate.

use super::{DeviceHooks, Tunables};
use crate::asic::task::{self, TaskFrame};
use crate::asic::AsicFamily;
use crate::device::state::{DeviceState, MiningState};
use crate::error::UsbError;
use crate::usb::descriptor::Bridge;
use crate::usb::Session;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a tick decided about the device's future.
#[derive(Debug, PartialEq, Eq)]
pub enum Tick {
    /// Keep looping.
    Continue,
    /// The device is unrecoverable (or the family treats reset as fatal);
    /// the registry should release it back to hotplug.
    DeviceGone,
}

/// Baud divider used after init on the BM1387-family serial link (1.5 Mbps).
const FAST_BAUDDIV: u8 = 0x01;

pub struct Machine {
    pub state: Arc<DeviceState>,
    pub session: Arc<Session>,
    pub tunables: Tunables,
    pub hooks: DeviceHooks,
}

impl Machine {
    /// Send one pre-checksummed command frame.
    pub async fn send_cmd(&self, bytes: &[u8]) -> Result<(), UsbError> {
        // breathe between commands so back-to-back register writes do not
        // overrun the bridge FIFO
        tokio::time::sleep(Duration::from_millis(1)).await;
        let timeout = Duration::from_millis(self.session.descriptor.timeout_ms);
        self.session.write_default(bytes, timeout).await?;
        Ok(())
    }

    /// Program the PLL and refresh every derived rate.
    pub async fn set_frequency(&self, mhz: f64) -> Result<(), UsbError> {
        let family = self.state.family;
        let (cmds, snapped) = task::set_frequency(family, mhz);
        warn!(
            device = self.state.device_id,
            "setting frequency to {snapped:.2}MHz"
        );
        for cmd in cmds {
            self.send_cmd(&cmd).await?;
        }

        let mut freq = self.state.freq.lock();
        freq.frequency = snapped;
        freq.update_rates(family);
        Ok(())
    }

    /// Broadcast chain-inactive and re-address every chip. Outside the
    /// mining state this doubles as the open-core entry point.
    pub async fn send_chain_inactive(&self) -> Result<(), UsbError> {
        let (chips, bauddiv, frequency) = {
            let freq = self.state.freq.lock();
            (freq.chips, freq.bauddiv, freq.frequency)
        };
        info!(
            device = self.state.device_id,
            "sending chain inactive for {chips} chip(s)"
        );
        for cmd in task::chain_inactive(self.state.family, chips, bauddiv) {
            self.send_cmd(&cmd).await?;
        }
        self.state.times.lock().last_chain_inactive = std::time::Instant::now();

        if self.state.mining_state() != MiningState::Mining {
            info!(
                device = self.state.device_id,
                "open cores @ {frequency:.2}MHz"
            );
            self.state.counters.zero_check.store(0, std::sync::atomic::Ordering::Relaxed);
            self.state.freq.lock().task_hcn = 0;
            self.state.set_mining_state(MiningState::OpenCore);
        }
        Ok(())
    }

    /// Bridge and link bring-up after acquire or reset.
    ///
    /// Raises the serial link to its fast rate, then probes the telemetry
    /// MCU so the device runs in dummy mode when none answers.
    pub async fn prepare(&self) -> Result<(), UsbError> {
        match self.state.family {
            AsicFamily::BM1384 => {
                // CP210x sticks talk at the default rate; nothing to raise.
                self.session.init_bridge(0).await?;
            }
            _ => {
                // Tell every chip about the faster baud rate, then move the
                // FTDI side to match.
                let mut baud = vec![0x58, 0x09, 0x00, 0x1c, 0x00, 0x20, FAST_BAUDDIV, 0x00, 0x00];
                let bits = self.state.family.cmd_crc_bits(baud.len());
                let crc = crate::asic::crc::bmcrc(&baud, bits);
                *baud.last_mut().expect("fixed frame") |= crc;
                self.send_cmd(&baud).await?;
                tokio::time::sleep(Duration::from_millis(1)).await;
                self.session
                    .init_bridge((FAST_BAUDDIV + 1) as u16)
                    .await?;
                self.state.freq.lock().bauddiv = FAST_BAUDDIV;
            }
        }
        Ok(())
    }

    /// One state-machine iteration, called from every sender-loop pass.
    pub async fn tick(&self) -> Result<Tick, UsbError> {
        let now = std::time::Instant::now();

        match self.state.mining_state() {
            MiningState::Init => {
                {
                    let mut freq = self.state.freq.lock();
                    freq.chips = 0;
                    freq.ramping = 0;
                }
                self.state.set_mining_state(MiningState::ChipCount);
                let query = task::chip_count_query(self.state.family);
                self.send_cmd(&query).await?;
                self.send_cmd(&query).await?;
            }

            MiningState::ChipCount => {
                let last_reset = self.state.times.lock().last_reset;
                if now.duration_since(last_reset) > Duration::from_secs(5) {
                    warn!(device = self.state.device_id, "found 0 chip(s)");
                    self.state.set_mining_state(MiningState::Reset);
                }
            }

            MiningState::ChipCountXx => {
                // the receiver commits the count after its idle window
            }

            MiningState::ChipCountOk => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let start = self.state.freq.lock().frequency_start;
                self.set_frequency(start).await?;
                self.send_chain_inactive().await?;
            }

            MiningState::OpenCore => {
                let (ramping, cores, chips) = {
                    let freq = self.state.freq.lock();
                    (freq.ramping, freq.cores, freq.chips)
                };
                let job_id = {
                    let mut ring = self.state.ring.lock();
                    ring.job_id = ramping % self.state.family.params().max_job_id;
                    ring.job_id
                };

                let frame = TaskFrame {
                    family: self.state.family,
                    mining: false,
                    job_id,
                    ticket_mask: 0,
                    task_hcn: 0,
                    boost: self.state.boost,
                    work: None,
                };
                let timeout = Duration::from_millis(self.session.descriptor.timeout_ms);
                self.session.write_default(&frame.encode(), timeout).await?;

                if ramping > cores {
                    self.state.set_mining_state(MiningState::OpenCoreOk);
                    let mut freq = self.state.freq.lock();
                    freq.task_hcn = if chips > 0 { u32::MAX / chips } else { u32::MAX };
                } else {
                    self.state.freq.lock().ramping += 1;
                    self.state.times.lock().last_task = now;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }

            MiningState::OpenCoreOk => {
                let frequency = self.state.freq.lock().frequency;
                info!(
                    device = self.state.device_id,
                    "start work @ {frequency:.2}MHz"
                );
                {
                    let mut times = self.state.times.lock();
                    times.start_time = now;
                    times.monitor_time = now;
                    times.last_frequency_adjust = now;
                    times.last_frequency_ping = now;
                    times.last_frequency_report = now;
                    times.last_micro_ping = now;
                    times.last_nonce = now;
                }
                self.session.flush_input().await;
                self.state.set_mining_state(MiningState::Mining);
            }

            MiningState::Mining => {
                // pacing and health checks belong to the sender loop
            }

            MiningState::MiningDups => {
                self.state.set_mining_state(MiningState::Mining);
                self.state
                    .counters
                    .dupsreset
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let frequency = self.state.freq.lock().frequency;
                if frequency as u32 == 200 {
                    // pinned at the reset-default clock: assume the chain
                    // lost its addressing and rebuild it
                    self.set_frequency(frequency).await?;
                    self.send_chain_inactive().await?;
                    self.state.times.lock().last_frequency_adjust = now;
                } else {
                    // otherwise just confirm the link is alive
                    self.send_cmd(&task::frequency_ping(self.state.family)).await?;
                    self.state.times.lock().last_frequency_ping = now;
                }
            }

            MiningState::Reset => {
                self.state
                    .counters
                    .plateau_reset
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                match self.session.descriptor.bridge {
                    Bridge::Ftdi => {
                        debug!(device = self.state.device_id, "toggle reset");
                        // release ring work before the chips forget it
                        let stale = self.state.ring.lock().drain();
                        for work in stale {
                            self.hooks.source.work_completed(self.state.device_id, work);
                        }
                        self.session.ftdi_toggle_reset().await?;
                        self.session.flush_input().await;
                        self.prepare().await?;
                        self.state
                            .counters
                            .fail_count
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        self.state.times.lock().last_reset = std::time::Instant::now();
                        self.state.set_mining_state(if self.tunables.reset_reinit {
                            MiningState::Reinit
                        } else {
                            MiningState::Init
                        });
                    }
                    Bridge::Cp210x => {
                        // no reset line on these sticks: hand the device
                        // back to hotplug
                        return Ok(Tick::DeviceGone);
                    }
                }
            }

            MiningState::Reinit => {
                // telemetry re-arms the regulator, then mining restarts
                if self.state.telem.lock().regulator_on {
                    self.state.set_mining_state(MiningState::Init);
                }
            }

            MiningState::Shutdown | MiningState::ShutdownOk => {}
        }

        Ok(Tick::Continue)
    }
}
