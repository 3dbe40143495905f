//! Static model table for supported USB devices.
//!
//! Lookup is first-match in table order: a `(vendor, product)` pair can fan
//! out to several products distinguished by their descriptor strings, so a
//! string mismatch skips only that entry and lets a later one claim the
//! device.

use crate::asic::SubIdent;
use crate::error::Error;
use std::collections::HashMap;

/// USB transfer type of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// A declared endpoint the device must expose. Index 0 of an interface's
/// endpoint list is always the default IN, index 1 the default OUT.
#[derive(Debug, Clone, Copy)]
pub struct EndpointDescriptor {
    pub kind: EndpointKind,
    pub direction: Direction,
    /// Endpoint address including the direction bit.
    pub address: u8,
    pub max_packet: u16,
}

pub const DEFAULT_EP_IN: usize = 0;
pub const DEFAULT_EP_OUT: usize = 1;

#[derive(Debug, Clone, Copy)]
pub struct InterfaceDescriptor {
    pub number: u8,
    /// Interface index used for control transfers targeting this interface.
    pub ctrl_interface: u8,
    pub endpoints: &'static [EndpointDescriptor],
}

/// Which serial bridge sits between USB and the chip chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bridge {
    /// FTDI FT232R-class: bulk reads carry 2 leading status bytes, CBUS
    /// bitbang drives reset and the telemetry mux.
    Ftdi,
    /// Silicon Labs CP210x.
    Cp210x,
}

/// One row of the model table.
#[derive(Debug, Clone, Copy)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// When set, the device's manufacturer string must contain this.
    pub manufacturer: Option<&'static str>,
    /// When set, the device's product string must contain this.
    pub product: Option<&'static str>,
    /// Driver family name as shown in the API (`devs` Name field).
    pub driver: &'static str,
    pub ident: SubIdent,
    /// Default transfer timeout.
    pub timeout_ms: u64,
    /// FTDI latency timer, when the bridge supports one.
    pub latency_ms: Option<u8>,
    /// Configuration number the device must be in.
    pub config: u8,
    pub interfaces: &'static [InterfaceDescriptor],
    pub bridge: Bridge,
}

const FTDI_EPS: &[EndpointDescriptor] = &[
    EndpointDescriptor {
        kind: EndpointKind::Bulk,
        direction: Direction::In,
        address: 0x81,
        max_packet: 64,
    },
    EndpointDescriptor {
        kind: EndpointKind::Bulk,
        direction: Direction::Out,
        address: 0x02,
        max_packet: 64,
    },
];

const FTDI_IFACE: &[InterfaceDescriptor] = &[InterfaceDescriptor {
    number: 0,
    ctrl_interface: 0,
    endpoints: FTDI_EPS,
}];

const CP210X_EPS: &[EndpointDescriptor] = &[
    EndpointDescriptor {
        kind: EndpointKind::Bulk,
        direction: Direction::In,
        address: 0x82,
        max_packet: 64,
    },
    EndpointDescriptor {
        kind: EndpointKind::Bulk,
        direction: Direction::Out,
        address: 0x01,
        max_packet: 64,
    },
];

const CP210X_IFACE: &[InterfaceDescriptor] = &[InterfaceDescriptor {
    number: 0,
    ctrl_interface: 0,
    endpoints: CP210X_EPS,
}];

/// Pods with a discrete telemetry MCU expose it on a second interface.
const FTDI_TELEM_EPS: &[EndpointDescriptor] = &[
    EndpointDescriptor {
        kind: EndpointKind::Bulk,
        direction: Direction::In,
        address: 0x83,
        max_packet: 64,
    },
    EndpointDescriptor {
        kind: EndpointKind::Bulk,
        direction: Direction::Out,
        address: 0x04,
        max_packet: 64,
    },
];

const FTDI_DUAL_IFACE: &[InterfaceDescriptor] = &[
    InterfaceDescriptor {
        number: 0,
        ctrl_interface: 0,
        endpoints: FTDI_EPS,
    },
    InterfaceDescriptor {
        number: 1,
        ctrl_interface: 1,
        endpoints: FTDI_TELEM_EPS,
    },
];

/// The model table, in match-priority order.
pub static DEVICE_TABLE: &[DeviceDescriptor] = &[
    DeviceDescriptor {
        vendor_id: 0x10c4,
        product_id: 0xea60,
        manufacturer: None,
        product: Some("Compac"),
        driver: "GSX",
        ident: SubIdent::Bsc,
        timeout_ms: 200,
        latency_ms: None,
        config: 1,
        interfaces: CP210X_IFACE,
        bridge: Bridge::Cp210x,
    },
    DeviceDescriptor {
        vendor_id: 0x10c4,
        product_id: 0xea60,
        manufacturer: None,
        product: Some("2Pac"),
        driver: "GSX",
        ident: SubIdent::Bsd,
        timeout_ms: 200,
        latency_ms: None,
        config: 1,
        interfaces: CP210X_IFACE,
        bridge: Bridge::Cp210x,
    },
    DeviceDescriptor {
        vendor_id: 0x10c4,
        product_id: 0xea60,
        manufacturer: None,
        product: Some("Terminus"),
        driver: "GSX",
        ident: SubIdent::Bse,
        timeout_ms: 200,
        latency_ms: None,
        config: 1,
        interfaces: CP210X_IFACE,
        bridge: Bridge::Cp210x,
    },
    DeviceDescriptor {
        vendor_id: 0x0403,
        product_id: 0x6015,
        manufacturer: None,
        product: Some("NewPac"),
        driver: "GSX",
        ident: SubIdent::Gsh,
        timeout_ms: 200,
        latency_ms: Some(1),
        config: 1,
        interfaces: FTDI_IFACE,
        bridge: Bridge::Ftdi,
    },
    DeviceDescriptor {
        vendor_id: 0x0403,
        product_id: 0x6015,
        manufacturer: None,
        product: Some("R606"),
        driver: "GSX",
        ident: SubIdent::Gsf,
        timeout_ms: 200,
        latency_ms: Some(1),
        config: 1,
        interfaces: FTDI_IFACE,
        bridge: Bridge::Ftdi,
    },
    DeviceDescriptor {
        vendor_id: 0x0403,
        product_id: 0x6015,
        manufacturer: None,
        product: Some("CompacF"),
        driver: "GSX",
        ident: SubIdent::Gsfm,
        timeout_ms: 200,
        latency_ms: Some(1),
        config: 1,
        interfaces: FTDI_IFACE,
        bridge: Bridge::Ftdi,
    },
    DeviceDescriptor {
        vendor_id: 0x0403,
        product_id: 0x6015,
        manufacturer: None,
        product: Some("R909"),
        driver: "GSX",
        ident: SubIdent::Gsa1,
        timeout_ms: 200,
        latency_ms: Some(1),
        config: 1,
        interfaces: FTDI_DUAL_IFACE,
        bridge: Bridge::Ftdi,
    },
    DeviceDescriptor {
        vendor_id: 0x0403,
        product_id: 0x6015,
        manufacturer: None,
        product: None,
        driver: "GSX",
        ident: SubIdent::Gsa2,
        timeout_ms: 200,
        latency_ms: Some(1),
        config: 1,
        interfaces: FTDI_DUAL_IFACE,
        bridge: Bridge::Ftdi,
    },
];

/// Find the table entry for a device. String mismatches skip only the
/// offending entry.
pub fn find_descriptor(
    vendor: u16,
    product: u16,
    manufacturer: &str,
    product_string: &str,
) -> Option<&'static DeviceDescriptor> {
    DEVICE_TABLE.iter().find(|d| {
        d.vendor_id == vendor
            && d.product_id == product
            && d.manufacturer.is_none_or(|m| manufacturer.contains(m))
            && d.product.is_none_or(|p| product_string.contains(p))
    })
}

/// Device caps parsed from `--usb`.
///
/// `:N` caps the total device count, `DRV:N` caps one driver family, and
/// `bus:dev[,bus:dev...]` restricts scanning to the listed positions.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UsbSelector {
    pub total_limit: Option<usize>,
    pub driver_limits: HashMap<String, usize>,
    pub allowed_positions: Option<Vec<(u8, u8)>>,
}

impl UsbSelector {
    pub fn parse(spec: &str) -> Result<Self, Error> {
        let mut selector = UsbSelector::default();
        let bad = || Error::InvalidUsbSelector(spec.to_string());

        if let Some(count) = spec.strip_prefix(':') {
            selector.total_limit = Some(count.parse().map_err(|_| bad())?);
            return Ok(selector);
        }

        let mut positions = Vec::new();
        for part in spec.split(',') {
            let (left, right) = part.split_once(':').ok_or_else(bad)?;
            if left.chars().all(|c| c.is_ascii_digit()) {
                let bus = left.parse().map_err(|_| bad())?;
                let dev = right.parse().map_err(|_| bad())?;
                positions.push((bus, dev));
            } else {
                let limit = right.parse().map_err(|_| bad())?;
                selector.driver_limits.insert(left.to_uppercase(), limit);
            }
        }
        if !positions.is_empty() {
            selector.allowed_positions = Some(positions);
        }
        Ok(selector)
    }

    /// May a device at this bus position be considered at all?
    pub fn position_allowed(&self, bus: u8, address: u8) -> bool {
        match &self.allowed_positions {
            Some(list) => list.contains(&(bus, address)),
            None => true,
        }
    }

    /// May another device of `driver` be acquired, given current counts?
    pub fn driver_allowed(&self, driver: &str, current: usize, total: usize) -> bool {
        if let Some(cap) = self.total_limit {
            if total >= cap {
                return false;
            }
        }
        match self.driver_limits.get(&driver.to_uppercase()) {
            Some(cap) => current < *cap,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn product_string_fans_out_shared_ids() {
        let compac = find_descriptor(0x10c4, 0xea60, "Silicon Labs", "GekkoScience Compac")
            .expect("compac entry");
        assert_eq!(compac.ident, SubIdent::Bsc);

        let twopac = find_descriptor(0x10c4, 0xea60, "Silicon Labs", "GekkoScience 2Pac")
            .expect("2pac entry");
        assert_eq!(twopac.ident, SubIdent::Bsd);
    }

    #[test]
    fn ftdi_fallback_entry_catches_unknown_products() {
        let desc = find_descriptor(0x0403, 0x6015, "FTDI", "Some Future Pod").expect("fallback");
        assert_eq!(desc.ident, SubIdent::Gsa2);
    }

    #[test]
    fn unknown_ids_find_nothing() {
        assert!(find_descriptor(0x1234, 0x5678, "", "").is_none());
    }

    #[test]
    fn default_endpoints_are_in_then_out() {
        for desc in DEVICE_TABLE {
            for iface in desc.interfaces {
                assert_eq!(iface.endpoints[DEFAULT_EP_IN].direction, Direction::In);
                assert_eq!(iface.endpoints[DEFAULT_EP_OUT].direction, Direction::Out);
            }
        }
    }

    #[test]
    fn selector_total_cap() {
        let sel = UsbSelector::parse(":3").unwrap();
        assert_eq!(sel.total_limit, Some(3));
        assert!(sel.driver_allowed("GSX", 0, 2));
        assert!(!sel.driver_allowed("GSX", 0, 3));
    }

    #[test]
    fn selector_driver_cap() {
        let sel = UsbSelector::parse("GSX:2").unwrap();
        assert!(sel.driver_allowed("GSX", 1, 10));
        assert!(!sel.driver_allowed("gsx", 2, 10));
        assert!(sel.driver_allowed("OTHER", 99, 99));
    }

    #[test]
    fn selector_bus_positions() {
        let sel = UsbSelector::parse("1:4,2:7").unwrap();
        assert!(sel.position_allowed(1, 4));
        assert!(sel.position_allowed(2, 7));
        assert!(!sel.position_allowed(1, 5));
    }

    #[test_case(""; "empty")]
    #[test_case("1"; "no colon")]
    #[test_case(":x"; "bad count")]
    #[test_case("1:x"; "bad device")]
    fn selector_rejects_garbage(spec: &str) {
        assert!(UsbSelector::parse(spec).is_err());
    }
}
