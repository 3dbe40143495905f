//! USB transport sessions.
//!
//! A thin, async-friendly layer over libusb. Each acquired device gets a
//! [`Session`] that owns the handle, the claimed interfaces, a spill buffer
//! for oversized reads, and the cross-process device lock. Blocking libusb
//! calls run on the blocking pool; the wall-clock timeout enforced here is
//! authoritative, with the native transfer timeout kept shorter so a
//! cancelled wait never strands a callback.

pub mod descriptor;

use crate::error::UsbError;
use descriptor::{Bridge, DeviceDescriptor, EndpointKind, DEFAULT_EP_IN, DEFAULT_EP_OUT};
use parking_lot::Mutex;
use rusb::{Direction, Recipient, RequestType, TransferType, UsbContext};
use std::fs::{File, OpenOptions};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Identity of a physical device, gathered without claiming it.
#[derive(Debug, Clone, Default)]
pub struct UsbDeviceInfo {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
}

impl UsbDeviceInfo {
    pub fn position(&self) -> (u8, u8) {
        (self.bus, self.address)
    }
}

/// Options for a single read.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Return after the first chunk instead of filling the buffer.
    pub once: bool,
    /// Allow `cancel_reads` to abort this transfer early.
    pub cancellable: bool,
    /// Read until the buffer contains this byte (or timeout).
    pub terminator: Option<u8>,
}

/// Native per-attempt timeout. Kept short so cancellation and the
/// authoritative deadline are honored promptly.
const SLICE_TIMEOUT: Duration = Duration::from_millis(50);

/// Stall/IO retry budget, after which the error escapes.
const MAX_RETRIES: u32 = 5;

/// Minimum spacing between writes on full/low-speed links, emulating the
/// hub transaction translator.
const LOW_SPEED_WRITE_GAP: Duration = Duration::from_millis(1);

const FTDI_STATUS_BYTES: usize = 2;

// FTDI vendor requests
const FTDI_REQUEST_RESET: u8 = 0;
const FTDI_REQUEST_FLOW: u8 = 2;
const FTDI_REQUEST_BAUD: u8 = 3;
const FTDI_REQUEST_DATA: u8 = 4;
const FTDI_REQUEST_LATENCY: u8 = 9;
const FTDI_REQUEST_BITMODE: u8 = 11;
const FTDI_VALUE_RESET: u16 = 0;
const FTDI_VALUE_PURGE_RX: u16 = 1;
const FTDI_VALUE_PURGE_TX: u16 = 2;
const FTDI_VALUE_DATA: u16 = 8;
const FTDI_VALUE_FLOW: u16 = 0;
const FTDI_VALUE_BAUD: u16 = 0x001a;
const FTDI_INDEX_BAUD: u16 = 0x0000;
const FTDI_BITMODE_CBUS: u16 = 0x20;

// CP210x interface requests
const CP210X_REQUEST_IFC_ENABLE: u8 = 0x00;
const CP210X_REQUEST_DATA: u8 = 0x07;
const CP210X_REQUEST_BAUD: u8 = 0x1e;
const CP210X_SET_LINE_CTL: u8 = 0x03;
const CP210X_VALUE_UART_ENABLE: u16 = 0x0001;
const CP210X_VALUE_DATA: u16 = 0x0303;
const CP210X_DATA_BAUD: u32 = 115_200;
const CP210X_BITS_DATA_8_MARK: u16 = 0x0800 | 0x0030;

/// Fresh libusb context for enumeration and sessions.
pub fn context() -> Result<rusb::Context, rusb::Error> {
    rusb::Context::new()
}

/// Enumerate the bus without opening anything beyond a transient handle for
/// descriptor strings.
pub fn list_devices(ctx: &rusb::Context) -> Vec<(rusb::Device<rusb::Context>, UsbDeviceInfo)> {
    let mut found = Vec::new();
    let devices = match ctx.devices() {
        Ok(d) => d,
        Err(e) => {
            warn!("usb enumeration failed: {e}");
            return found;
        }
    };

    for device in devices.iter() {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        let mut info = UsbDeviceInfo {
            bus: device.bus_number(),
            address: device.address(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            ..Default::default()
        };

        // Strings need a transient open; devices we cannot open are still
        // listed so --usb-list-all shows them.
        if let Ok(handle) = device.open() {
            let timeout = Duration::from_millis(100);
            if let Ok(langs) = handle.read_languages(timeout) {
                if let Some(lang) = langs.first().copied() {
                    info.manufacturer = handle
                        .read_manufacturer_string(lang, &desc, timeout)
                        .unwrap_or_default();
                    info.product = handle
                        .read_product_string(lang, &desc, timeout)
                        .unwrap_or_default();
                    info.serial = handle
                        .read_serial_number_string(lang, &desc, timeout)
                        .unwrap_or_default();
                }
            }
        }

        found.push((device, info));
    }
    found
}

/// An acquired, claimed device.
pub struct Session {
    handle: Arc<rusb::DeviceHandle<rusb::Context>>,
    pub descriptor: &'static DeviceDescriptor,
    pub info: UsbDeviceInfo,
    claimed: Vec<u8>,
    /// Cross-process lock on (bus, address); released on drop.
    _lockfile: File,
    nodev: AtomicBool,
    /// Serialises wire writes and control transfers.
    write_gate: tokio::sync::Mutex<WriteGate>,
    /// Serialises the receive path.
    read_gate: tokio::sync::Mutex<SpillBuffer>,
    /// Current read-cancellation token; replaced after each cancel.
    cancel: Mutex<CancellationToken>,
    low_speed: bool,
}

#[derive(Debug)]
struct WriteGate {
    last_write: Instant,
}

#[derive(Debug, Default)]
struct SpillBuffer {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("bus", &self.info.bus)
            .field("address", &self.info.address)
            .field("product", &self.info.product)
            .finish()
    }
}

fn lockfile_path(bus: u8, address: u8) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("compac-usb-{bus}-{address}.lock"))
}

impl Session {
    /// Acquire a device against a table entry.
    ///
    /// Follows the fixed step order; any failure unwinds the steps already
    /// taken. [`UsbError::Ignore`] means the strings did not match and
    /// another table entry may still claim the device.
    pub fn acquire(
        device: &rusb::Device<rusb::Context>,
        info: UsbDeviceInfo,
        descriptor: &'static DeviceDescriptor,
    ) -> Result<Session, UsbError> {
        // 1. cross-process device lock
        let lockfile = OpenOptions::new()
            .create(true)
            .write(true)
            .open(lockfile_path(info.bus, info.address))?;
        rustix::fs::flock(
            &lockfile,
            rustix::fs::FlockOperation::NonBlockingLockExclusive,
        )
        .map_err(|_| UsbError::InUse)?;

        // 2. open
        let handle = device.open()?;

        // 3. descriptor string comparison
        if let Some(want) = descriptor.manufacturer {
            if !info.manufacturer.contains(want) {
                return Err(UsbError::Ignore(format!(
                    "manufacturer '{}' != '{want}'",
                    info.manufacturer
                )));
            }
        }
        if let Some(want) = descriptor.product {
            if !info.product.contains(want) {
                return Err(UsbError::Ignore(format!(
                    "product '{}' != '{want}'",
                    info.product
                )));
            }
        }

        // 4. detach kernel drivers, best effort
        let _ = handle.set_auto_detach_kernel_driver(true);
        for iface in descriptor.interfaces {
            match handle.kernel_driver_active(iface.number) {
                Ok(true) => {
                    if let Err(e) = handle.detach_kernel_driver(iface.number) {
                        debug!("detach on interface {} failed: {e}", iface.number);
                    }
                }
                _ => {}
            }
        }

        // 5. configuration
        let current = handle.active_configuration()?;
        if current != descriptor.config {
            handle
                .set_active_configuration(descriptor.config)
                .map_err(|e| match e {
                    rusb::Error::Busy => UsbError::Busy("set_configuration"),
                    other => UsbError::from(other),
                })?;
        }

        // 6. every declared endpoint must exist in the active config
        Self::match_endpoints(device, descriptor)?;

        // 7. claim, rolling back on failure
        let mut claimed = Vec::new();
        for iface in descriptor.interfaces {
            match handle.claim_interface(iface.number) {
                Ok(()) => claimed.push(iface.number),
                Err(e) => {
                    for nr in claimed {
                        let _ = handle.release_interface(nr);
                    }
                    return Err(e.into());
                }
            }
        }

        // 8. the configuration must not have drifted underneath us
        if handle.active_configuration()? != descriptor.config {
            for nr in &claimed {
                let _ = handle.release_interface(*nr);
            }
            return Err(UsbError::Busy("configuration changed during acquire"));
        }

        let low_speed = matches!(
            device.speed(),
            rusb::Speed::Low | rusb::Speed::Full | rusb::Speed::Unknown
        );

        let session = Session {
            handle: Arc::new(handle),
            descriptor,
            info,
            claimed,
            _lockfile: lockfile,
            nodev: AtomicBool::new(false),
            write_gate: tokio::sync::Mutex::new(WriteGate {
                last_write: Instant::now(),
            }),
            read_gate: tokio::sync::Mutex::new(SpillBuffer::default()),
            cancel: Mutex::new(CancellationToken::new()),
            low_speed,
        };
        Ok(session)
    }

    fn match_endpoints(
        device: &rusb::Device<rusb::Context>,
        descriptor: &DeviceDescriptor,
    ) -> Result<(), UsbError> {
        let config = device.active_config_descriptor()?;

        for iface in descriptor.interfaces {
            for wanted in iface.endpoints {
                let mut found = false;
                'search: for intf in config.interfaces() {
                    for setting in intf.descriptors() {
                        for ep in setting.endpoint_descriptors() {
                            let kind_matches = matches!(
                                (wanted.kind, ep.transfer_type()),
                                (EndpointKind::Bulk, TransferType::Bulk)
                                    | (EndpointKind::Interrupt, TransferType::Interrupt)
                            );
                            if kind_matches
                                && ep.address() == wanted.address
                                && ep.max_packet_size() == wanted.max_packet
                            {
                                found = true;
                                break 'search;
                            }
                        }
                    }
                }
                if !found {
                    return Err(UsbError::MissingEndpoint(wanted.address));
                }
            }
        }
        Ok(())
    }

    /// True once the device has vanished; the owner should tear down.
    pub fn nodev(&self) -> bool {
        self.nodev.load(Ordering::Acquire)
    }

    fn mark_gone(&self) {
        self.nodev.store(true, Ordering::Release);
    }

    /// Abort all cancellable reads currently blocked. Used on work-restart
    /// so a fresh task reaches the device without waiting out a read.
    pub fn cancel_reads(&self) {
        let mut slot = self.cancel.lock();
        slot.cancel();
        *slot = CancellationToken::new();
    }

    fn current_cancel(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    fn endpoint(&self, iface: usize, ep: usize) -> u8 {
        self.descriptor.interfaces[iface].endpoints[ep].address
    }

    /// Read up to `len` bytes from an IN endpoint.
    ///
    /// The spill buffer from a previous over-long transfer is drained
    /// first. On a pipe stall the halt is cleared and the read retried; on
    /// timeout whatever arrived is returned without error.
    pub async fn read(
        &self,
        iface: usize,
        ep: usize,
        len: usize,
        timeout: Duration,
        opts: ReadOptions,
    ) -> Result<Vec<u8>, UsbError> {
        let mut gate = self.read_gate.lock().await;
        let endpoint = self.endpoint(iface, ep);
        let deadline = Instant::now() + timeout;
        let cancel = opts.cancellable.then(|| self.current_cancel());

        let mut out = Vec::with_capacity(len);

        // previous overflow first
        if !gate.bytes.is_empty() {
            let take = gate.bytes.len().min(len);
            out.extend(gate.bytes.drain(..take));
            if out.len() >= len || opts.once || contains_terminator(&out, opts.terminator) {
                return Ok(out);
            }
        }

        let strip = self.descriptor.bridge == Bridge::Ftdi;
        let mut stalls = 0u32;
        let mut io_errors = 0u32;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let slice = SLICE_TIMEOUT.min(deadline - now);

            let handle = Arc::clone(&self.handle);
            let want = (len - out.len()).max(1) + if strip { FTDI_STATUS_BYTES } else { 0 };
            let blocking = tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; want.min(512)];
                // native timeout slightly above the slice so the wrapper
                // deadline, not libusb, decides
                let r = handle.read_bulk(endpoint, &mut buf, slice + Duration::from_millis(10));
                (buf, r)
            });

            let joined = if let Some(token) = &cancel {
                tokio::select! {
                    j = blocking => j,
                    _ = token.cancelled() => {
                        trace!("read on {endpoint:#04x} cancelled");
                        break;
                    }
                }
            } else {
                blocking.await
            };

            let (buf, result) = joined.map_err(|e| UsbError::Io(io::Error::other(e)))?;
            match result {
                Ok(mut n) => {
                    let mut chunk = &buf[..n];
                    if strip {
                        if n <= FTDI_STATUS_BYTES {
                            // status-only chunk: line idle
                            if opts.once && !out.is_empty() {
                                break;
                            }
                            continue;
                        }
                        chunk = &buf[FTDI_STATUS_BYTES..n];
                        n -= FTDI_STATUS_BYTES;
                    }

                    let room = len - out.len();
                    if n > room {
                        out.extend_from_slice(&chunk[..room]);
                        gate.bytes.extend_from_slice(&chunk[room..]);
                        break;
                    }
                    out.extend_from_slice(chunk);

                    if out.len() >= len
                        || (opts.once && !out.is_empty())
                        || contains_terminator(&out, opts.terminator)
                    {
                        break;
                    }
                }
                Err(rusb::Error::Timeout) => {
                    if opts.once && !out.is_empty() {
                        break;
                    }
                    // keep waiting until the authoritative deadline
                }
                Err(rusb::Error::Pipe) => {
                    stalls += 1;
                    if stalls > MAX_RETRIES {
                        return Err(UsbError::Rusb(rusb::Error::Pipe));
                    }
                    let handle = Arc::clone(&self.handle);
                    let _ = tokio::task::spawn_blocking(move || handle.clear_halt(endpoint)).await;
                }
                Err(rusb::Error::Io) => {
                    io_errors += 1;
                    if io_errors > MAX_RETRIES {
                        return Err(UsbError::Rusb(rusb::Error::Io));
                    }
                }
                Err(rusb::Error::NoDevice) => {
                    self.mark_gone();
                    return Err(UsbError::NoDevice);
                }
                Err(e) => {
                    // other errors end the read with whatever arrived
                    debug!("read on {endpoint:#04x}: {e}");
                    break;
                }
            }
        }

        Ok(out)
    }

    /// Read from the default IN endpoint of interface 0.
    pub async fn read_default(
        &self,
        len: usize,
        timeout: Duration,
        opts: ReadOptions,
    ) -> Result<Vec<u8>, UsbError> {
        self.read(0, DEFAULT_EP_IN, len, timeout, opts).await
    }

    /// Write `data` to an OUT endpoint, honoring the low-speed write gap.
    /// Returns the number of bytes the device took.
    pub async fn write(
        &self,
        iface: usize,
        ep: usize,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let mut gate = self.write_gate.lock().await;
        let endpoint = self.endpoint(iface, ep);

        if self.low_speed {
            let since = gate.last_write.elapsed();
            if since < LOW_SPEED_WRITE_GAP {
                tokio::time::sleep(LOW_SPEED_WRITE_GAP - since).await;
            }
        }

        let deadline = Instant::now() + timeout;
        let mut sent = 0usize;
        let mut io_errors = 0u32;
        let mut stalls = 0u32;

        while sent < data.len() {
            let now = Instant::now();
            if now >= deadline {
                return Err(UsbError::Timeout { partial: sent });
            }
            let slice = SLICE_TIMEOUT.min(deadline - now);

            let handle = Arc::clone(&self.handle);
            let chunk = data[sent..].to_vec();
            let result = tokio::task::spawn_blocking(move || {
                handle.write_bulk(endpoint, &chunk, slice + Duration::from_millis(10))
            })
            .await
            .map_err(|e| UsbError::Io(io::Error::other(e)))?;

            match result {
                Ok(n) => sent += n,
                Err(rusb::Error::Timeout) => {}
                Err(rusb::Error::Pipe) => {
                    stalls += 1;
                    if stalls > MAX_RETRIES {
                        return Err(UsbError::Rusb(rusb::Error::Pipe));
                    }
                    let handle = Arc::clone(&self.handle);
                    let _ = tokio::task::spawn_blocking(move || handle.clear_halt(endpoint)).await;
                }
                Err(rusb::Error::Io) => {
                    io_errors += 1;
                    if io_errors > MAX_RETRIES {
                        return Err(UsbError::Rusb(rusb::Error::Io));
                    }
                }
                Err(rusb::Error::NoDevice) => {
                    self.mark_gone();
                    return Err(UsbError::NoDevice);
                }
                Err(e) => return Err(e.into()),
            }
        }

        gate.last_write = Instant::now();
        trace!("TX {}: {}", endpoint, hex::encode(data));
        Ok(sent)
    }

    /// Write to the default OUT endpoint of interface 0.
    pub async fn write_default(&self, data: &[u8], timeout: Duration) -> Result<usize, UsbError> {
        self.write(0, DEFAULT_EP_OUT, data, timeout).await
    }

    /// Vendor/class control transfer, serialised under the write gate so a
    /// device-state change never races a wire write.
    pub async fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let _gate = self.write_gate.lock().await;
        let handle = Arc::clone(&self.handle);
        let data = data.to_vec();
        let result = tokio::task::spawn_blocking(move || {
            handle.write_control(request_type, request, value, index, &data, timeout)
        })
        .await
        .map_err(|e| UsbError::Io(io::Error::other(e)))?;

        match result {
            Ok(n) => Ok(n),
            Err(rusb::Error::NoDevice) => {
                self.mark_gone();
                Err(UsbError::NoDevice)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Port reset; the device re-enumerates with the same handle when it
    /// survives.
    pub async fn reset(&self) -> Result<(), UsbError> {
        let _gate = self.write_gate.lock().await;
        let handle = Arc::clone(&self.handle);
        let result = tokio::task::spawn_blocking(move || handle.reset()).await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(rusb::Error::NoDevice)) => {
                self.mark_gone();
                Err(UsbError::NoDevice)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(UsbError::Io(io::Error::other(e))),
        }
    }

    /// Release every claimed interface. The handle close and the device
    /// lock release happen when the session drops; this makes the claim
    /// teardown explicit (and safe to repeat) at shutdown time.
    pub fn release(&self) {
        for nr in &self.claimed {
            let _ = self.handle.release_interface(*nr);
        }
    }

    // --- bridge helpers -------------------------------------------------

    fn vendor_out() -> u8 {
        rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device)
    }

    fn cp210x_out() -> u8 {
        rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Interface)
    }

    /// FTDI latency timer, in milliseconds.
    pub async fn ftdi_set_latency(&self, ms: u8) -> Result<(), UsbError> {
        self.control_out(
            Self::vendor_out(),
            FTDI_REQUEST_LATENCY,
            ms as u16,
            self.ctrl_index(),
            &[],
            Duration::from_millis(100),
        )
        .await
        .map(|_| ())
    }

    fn ctrl_index(&self) -> u16 {
        self.descriptor.interfaces[0].ctrl_interface as u16
    }

    /// Program the FTDI CBUS pins: high nibble = direction mask, low
    /// nibble = levels.
    pub async fn ftdi_set_cbus(&self, mask: u8) -> Result<(), UsbError> {
        let value = (FTDI_BITMODE_CBUS << 8) | mask as u16;
        self.control_out(
            Self::vendor_out(),
            FTDI_REQUEST_BITMODE,
            value,
            self.ctrl_index(),
            &[],
            Duration::from_millis(100),
        )
        .await
        .map(|_| ())
    }

    /// FTDI serial-engine setup: reset, 8N1, baud, no flow control, purge.
    pub async fn ftdi_init(&self, baud_divisor: u16) -> Result<(), UsbError> {
        let t = Duration::from_millis(100);
        let idx = self.ctrl_index();
        let out = Self::vendor_out();
        self.control_out(out, FTDI_REQUEST_RESET, FTDI_VALUE_RESET, idx, &[], t)
            .await?;
        self.control_out(out, FTDI_REQUEST_DATA, FTDI_VALUE_DATA, idx, &[], t)
            .await?;
        self.control_out(out, FTDI_REQUEST_BAUD, baud_divisor, FTDI_INDEX_BAUD | idx, &[], t)
            .await?;
        self.control_out(out, FTDI_REQUEST_FLOW, FTDI_VALUE_FLOW, idx, &[], t)
            .await?;
        self.control_out(out, FTDI_REQUEST_RESET, FTDI_VALUE_PURGE_TX, idx, &[], t)
            .await?;
        self.control_out(out, FTDI_REQUEST_RESET, FTDI_VALUE_PURGE_RX, idx, &[], t)
            .await?;
        Ok(())
    }

    /// Toggle the ASIC nRST line through CBUS: high, low, high, with
    /// settle time between edges.
    pub async fn ftdi_toggle_reset(&self) -> Result<(), UsbError> {
        self.ftdi_init(FTDI_VALUE_BAUD).await?;
        for mask in [0xf2, 0xf0, 0xf2] {
            self.ftdi_set_cbus(mask).await?;
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        Ok(())
    }

    /// CP210x UART bring-up: enable, 8 data bits with mark parity, baud.
    pub async fn cp210x_init(&self) -> Result<(), UsbError> {
        let t = Duration::from_millis(100);
        let idx = self.ctrl_index();
        let out = Self::cp210x_out();
        self.control_out(out, CP210X_REQUEST_IFC_ENABLE, CP210X_VALUE_UART_ENABLE, idx, &[], t)
            .await?;
        self.control_out(out, CP210X_REQUEST_DATA, CP210X_VALUE_DATA, idx, &[], t)
            .await?;
        self.control_out(
            out,
            CP210X_REQUEST_BAUD,
            0,
            idx,
            &CP210X_DATA_BAUD.to_le_bytes(),
            t,
        )
        .await?;
        self.control_out(out, CP210X_SET_LINE_CTL, CP210X_BITS_DATA_8_MARK, idx, &[], t)
            .await?;
        Ok(())
    }

    /// Per-bridge initialisation after acquire.
    pub async fn init_bridge(&self, baud_divisor: u16) -> Result<(), UsbError> {
        match self.descriptor.bridge {
            Bridge::Ftdi => {
                self.ftdi_init(baud_divisor).await?;
                if let Some(ms) = self.descriptor.latency_ms {
                    self.ftdi_set_latency(ms).await?;
                }
                Ok(())
            }
            Bridge::Cp210x => self.cp210x_init().await,
        }
    }

    /// Drain anything buffered on the device side.
    pub async fn flush_input(&self) {
        loop {
            match self
                .read_default(32, Duration::from_millis(1), ReadOptions::default())
                .await
            {
                Ok(bytes) if !bytes.is_empty() => continue,
                _ => break,
            }
        }
    }
}

fn contains_terminator(buf: &[u8], terminator: Option<u8>) -> bool {
    match terminator {
        Some(t) => buf.contains(&t),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_detection() {
        assert!(contains_terminator(b"status\n", Some(b'\n')));
        assert!(!contains_terminator(b"status", Some(b'\n')));
        assert!(!contains_terminator(b"status\n", None));
    }

    #[test]
    fn lockfile_paths_are_per_position() {
        assert_ne!(lockfile_path(1, 2), lockfile_path(1, 3));
        assert_ne!(lockfile_path(1, 2), lockfile_path(2, 2));
    }

    #[test]
    fn read_options_default_is_plain_read() {
        let opts = ReadOptions::default();
        assert!(!opts.once);
        assert!(!opts.cancellable);
        assert!(opts.terminator.is_none());
    }
}
