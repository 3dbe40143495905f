//! Device registry and per-device task wiring.
//!
//! Every acquired miner gets an arena slot and four cooperating tasks:
//! sender, receiver, nonce dispatcher, and (on models with the auxiliary
//! MCU) telemetry. The registry owns the arena and the `(bus, address)`
//! in-use/blacklist sets; everything else reaches devices through handles.

pub mod machine;
pub mod nonce;
pub mod receiver;
pub mod sender;
pub mod state;
pub mod telemetry;

use crate::asic::SubIdent;
use crate::usb::descriptor::{self, UsbSelector};
use crate::usb::{self, Session};
use crate::work::WorkSource;
use machine::Machine;
use parking_lot::{Mutex, RwLock};
use slotmap::SlotMap;
use state::{DeviceState, MiningState};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

slotmap::new_key_type! {
    /// Stable arena key for a device.
    pub struct DeviceKey;
}

/// Driver tunables, mostly from the `--gekko-*` CLI surface.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub start_freq: f64,
    pub step_freq: f64,
    pub step_delay: Duration,
    /// Fraction of the expected rate above which the requested clock may
    /// climb back toward its configured value.
    pub tune_up: f64,
    /// Fraction of the expected hash rate below which auto-tune steps the
    /// requested frequency down (and resets).
    pub ghrequire: f64,
    /// Idle window that commits the chip count.
    pub chip_idle: Duration,
    pub boost: bool,
    pub gsh_freq: f64,
    pub gsh_vcore_mv: u32,
    pub reset_reinit: bool,
    /// Only devices whose serial contains this are claimed.
    pub serial_filter: Option<String>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            start_freq: 100.0,
            step_freq: 6.25,
            step_delay: Duration::from_secs(1),
            tune_up: 0.97,
            ghrequire: 0.65,
            chip_idle: Duration::from_millis(50),
            boost: false,
            gsh_freq: 200.0,
            gsh_vcore_mv: 400,
            reset_reinit: false,
            serial_filter: None,
        }
    }
}

/// Collaborator handles threaded into each device task.
#[derive(Clone)]
pub struct DeviceHooks {
    pub source: Arc<dyn WorkSource>,
}

/// One registered device and its running tasks.
pub struct DeviceEntry {
    pub state: Arc<DeviceState>,
    pub session: Arc<Session>,
    pub driver: &'static str,
    /// Cancelling this asks every loop of the device to exit.
    pub cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceEntry {
    /// Ask the loops to stop and wait for them.
    pub async fn shutdown(&self) {
        self.state.set_mining_state(MiningState::Shutdown);
        self.cancel.cancel();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.state.set_mining_state(MiningState::ShutdownOk);
    }
}

/// Arena of live devices plus the position sets that gate hotplug.
pub struct DeviceRegistry {
    devices: RwLock<SlotMap<DeviceKey, Arc<DeviceEntry>>>,
    in_use: Mutex<HashSet<(u8, u8)>>,
    blacklist: Mutex<HashSet<(u8, u8)>>,
    next_device_id: AtomicUsize,
    pub selector: UsbSelector,
}

impl DeviceRegistry {
    pub fn new(selector: UsbSelector) -> Self {
        Self {
            devices: RwLock::new(SlotMap::with_key()),
            in_use: Mutex::new(HashSet::new()),
            blacklist: Mutex::new(HashSet::new()),
            next_device_id: AtomicUsize::new(0),
            selector,
        }
    }

    pub fn snapshot(&self) -> Vec<(DeviceKey, Arc<DeviceEntry>)> {
        self.devices
            .read()
            .iter()
            .map(|(k, v)| (k, Arc::clone(v)))
            .collect()
    }

    pub fn get(&self, key: DeviceKey) -> Option<Arc<DeviceEntry>> {
        self.devices.read().get(key).cloned()
    }

    /// Device by its display id (the `ASC` number in the API).
    pub fn by_device_id(&self, id: usize) -> Option<Arc<DeviceEntry>> {
        self.devices
            .read()
            .values()
            .find(|e| e.state.device_id == id)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.devices.read().len()
    }

    pub fn driver_count(&self, driver: &str) -> usize {
        self.devices
            .read()
            .values()
            .filter(|e| e.driver == driver)
            .count()
    }

    /// Is this position already claimed or banned?
    pub fn position_known(&self, pos: (u8, u8)) -> bool {
        self.in_use.lock().contains(&pos) || self.blacklist.lock().contains(&pos)
    }

    pub fn blacklist_position(&self, pos: (u8, u8)) {
        self.blacklist.lock().insert(pos);
    }

    fn insert(&self, entry: Arc<DeviceEntry>) -> DeviceKey {
        self.in_use.lock().insert(entry.session.info.position());
        self.devices.write().insert(entry)
    }

    /// Tear a device down and free its position for hotplug.
    pub async fn remove(&self, key: DeviceKey) {
        let entry = self.devices.write().remove(key);
        if let Some(entry) = entry {
            entry.shutdown().await;
            entry.session.release();
            self.in_use.lock().remove(&entry.session.info.position());
            info!(
                device = entry.state.device_id,
                "released {}", entry.session.info.product
            );
        }
    }

    /// Work-restart from the pool: stale the rings, interrupt blocked
    /// reads, and let the senders push fresh tasks.
    pub fn restart_work(&self) {
        for (_, entry) in self.snapshot() {
            entry.state.flush_work();
            entry.session.cancel_reads();
        }
    }

    pub fn next_device_id(&self) -> usize {
        self.next_device_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Enable or disable a device by display id. Held under the arena
    /// write lock so the flip cannot race a concurrent removal.
    pub fn set_enabled(&self, device_id: usize, enabled: bool) -> bool {
        let devices = self.devices.write();
        for entry in devices.values() {
            if entry.state.device_id == device_id {
                entry.state.set_enabled(enabled);
                return true;
            }
        }
        false
    }
}

/// Build the state block and spawn the per-device tasks.
pub fn spawn_device(
    registry: &DeviceRegistry,
    session: Session,
    hooks: DeviceHooks,
    tunables: Tunables,
) -> DeviceKey {
    let descriptor = session.descriptor;
    let ident = descriptor.ident;
    let device_id = registry.next_device_id();

    // BM1384 sticks start straight at their requested clock; the rest ramp
    // from the configured start frequency.
    let requested = tunables.gsh_freq;
    let start = match ident {
        SubIdent::Bsc => requested,
        _ => tunables.start_freq.min(requested),
    };

    let state = Arc::new(DeviceState::new(
        device_id,
        ident,
        session.info.serial.clone(),
        tunables.boost,
        start,
        requested,
    ));
    let session = Arc::new(session);
    let cancel = CancellationToken::new();

    let (nonce_tx, nonce_rx) = tokio::sync::mpsc::channel(256);

    let machine = Machine {
        state: Arc::clone(&state),
        session: Arc::clone(&session),
        tunables: tunables.clone(),
        hooks: hooks.clone(),
    };

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(sender::run(machine, cancel.clone())));
    tasks.push(tokio::spawn(receiver::run(
        Arc::clone(&state),
        Arc::clone(&session),
        nonce_tx,
        tunables.clone(),
        cancel.clone(),
    )));
    tasks.push(tokio::spawn(nonce::run(
        Arc::clone(&state),
        hooks.clone(),
        nonce_rx,
        cancel.clone(),
    )));
    if ident.has_micro() {
        tasks.push(tokio::spawn(telemetry::run(
            Arc::clone(&state),
            Arc::clone(&session),
            tunables.gsh_vcore_mv,
            cancel.clone(),
        )));
    }

    info!(
        device = device_id,
        "{} ({}) online as {}",
        session.info.product,
        session.info.serial,
        descriptor.driver
    );

    let entry = Arc::new(DeviceEntry {
        state,
        session,
        driver: descriptor.driver,
        cancel,
        tasks: Mutex::new(tasks),
    });
    registry.insert(entry)
}

/// Periodic bus scan: find new table devices, acquire, and spawn them.
///
/// Runs until cancelled. Devices held by other instances, string-mismatched
/// entries, and blacklisted positions are skipped quietly. `interval_secs`
/// is shared with the API's `hotplug` command and re-read every cycle; zero
/// stops scanning for new devices (gone ones are still reaped) until it is
/// raised again.
pub async fn hotplug_scan(
    ctx: rusb::Context,
    registry: Arc<DeviceRegistry>,
    hooks: DeviceHooks,
    tunables: Tunables,
    interval_secs: Arc<AtomicU32>,
    cancel: CancellationToken,
) {
    loop {
        let secs = interval_secs.load(Ordering::Relaxed);
        if secs > 0 {
            scan_once(&ctx, &registry, &hooks, &tunables);
        }

        // reap devices whose loops declared them gone
        let gone: Vec<DeviceKey> = registry
            .snapshot()
            .into_iter()
            .filter(|(_, e)| {
                e.session.nodev() || e.state.mining_state() == MiningState::ShutdownOk
            })
            .map(|(k, _)| k)
            .collect();
        for key in gone {
            registry.remove(key).await;
        }

        // while disabled, wake often enough to notice re-enabling
        let sleep = Duration::from_secs(if secs > 0 { secs as u64 } else { 1 });
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

fn scan_once(
    ctx: &rusb::Context,
    registry: &DeviceRegistry,
    hooks: &DeviceHooks,
    tunables: &Tunables,
) {
    for (device, info) in usb::list_devices(ctx) {
        let pos = info.position();
        if registry.position_known(pos) || !registry.selector.position_allowed(pos.0, pos.1) {
            continue;
        }
        let Some(desc) = descriptor::find_descriptor(
            info.vendor_id,
            info.product_id,
            &info.manufacturer,
            &info.product,
        ) else {
            continue;
        };
        if let Some(filter) = &tunables.serial_filter {
            if !info.serial.contains(filter.as_str()) {
                continue;
            }
        }
        if !registry.selector.driver_allowed(
            desc.driver,
            registry.driver_count(desc.driver),
            registry.count(),
        ) {
            continue;
        }

        match Session::acquire(&device, info.clone(), desc) {
            Ok(session) => {
                spawn_device(registry, session, hooks.clone(), tunables.clone());
            }
            Err(crate::error::UsbError::InUse) => {
                // another instance owns it; try again next scan
            }
            Err(crate::error::UsbError::Ignore(reason)) => {
                tracing::debug!("{}:{} ignored: {reason}", pos.0, pos.1);
            }
            Err(e) => {
                warn!("acquire {:04x}:{:04x} failed: {e}", info.vendor_id, info.product_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_positions() {
        let reg = DeviceRegistry::new(UsbSelector::default());
        assert!(!reg.position_known((1, 4)));
        reg.blacklist_position((1, 4));
        assert!(reg.position_known((1, 4)));
        assert!(!reg.position_known((1, 5)));
    }

    #[test]
    fn device_ids_are_sequential() {
        let reg = DeviceRegistry::new(UsbSelector::default());
        assert_eq!(reg.next_device_id(), 0);
        assert_eq!(reg.next_device_id(), 1);
    }

    #[test]
    fn tunables_default_matches_driver_defaults() {
        let t = Tunables::default();
        assert_eq!(t.step_freq, 6.25);
        assert_eq!(t.ghrequire, 0.65);
        assert_eq!(t.chip_idle, Duration::from_millis(50));
    }
}
