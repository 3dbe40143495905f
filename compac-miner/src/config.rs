//! CLI surface.
//!
//! Only the options the driver core consumes live here; pool URLs are
//! passed through to the work-source collaborator untouched.

use crate::api::ApiOptions;
use crate::device::Tunables;
use crate::error::Error;
use crate::usb::descriptor::UsbSelector;
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "compac-minerd",
    version,
    about = "Mining daemon for USB-attached BM13xx ASIC sticks"
)]
pub struct Options {
    /// Device selection: `:N` caps the total, `DRV:N` caps one driver,
    /// `bus:dev[,bus:dev...]` allows only those positions.
    #[arg(long)]
    pub usb: Option<String>,

    /// Dump the descriptor of every matched device at startup.
    #[arg(long = "usb-dump")]
    pub usb_dump: bool,

    /// List every USB device visible on the bus, then exit.
    #[arg(long = "usb-list-all")]
    pub usb_list_all: bool,

    /// Enable the TCP API listener.
    #[arg(long = "api-listen")]
    pub api_listen: bool,

    #[arg(long = "api-host", default_value = "127.0.0.1")]
    pub api_host: String,

    #[arg(long = "api-port", default_value_t = 4028)]
    pub api_port: u16,

    /// `[G:]IP[/prefix][,...]` allow list; absent means loopback only.
    #[arg(long = "api-allow")]
    pub api_allow: Option<String>,

    /// Accept API connections from any host (read-only) when no allow
    /// list is given.
    #[arg(long = "api-network")]
    pub api_network: bool,

    /// `G:cmd1:cmd2[,...]` privilege groups referenced from the allow list.
    #[arg(long = "api-groups")]
    pub api_groups: Option<String>,

    /// Free-text banner carried in every STATUS record.
    #[arg(long = "api-description", default_value = "")]
    pub api_description: String,

    /// Enable the UDP multicast discovery responder.
    #[arg(long = "api-mcast")]
    pub api_mcast: bool,

    #[arg(long = "api-mcast-addr", default_value = "224.0.0.75")]
    pub api_mcast_addr: String,

    #[arg(long = "api-mcast-port", default_value_t = 4028)]
    pub api_mcast_port: u16,

    /// Code probes must carry to get an answer.
    #[arg(long = "api-mcast-code", default_value = "FTW")]
    pub api_mcast_code: String,

    /// Description appended to multicast replies.
    #[arg(long = "api-mcast-des", default_value = "")]
    pub api_mcast_des: String,

    /// Hotplug scan interval in seconds; 0 disables scanning.
    #[arg(long, default_value_t = 5)]
    pub hotplug: u32,

    /// Ramp start frequency in MHz.
    #[arg(long = "gekko-start-freq", default_value_t = 100.0)]
    pub gekko_start_freq: f64,

    /// Frequency step in MHz.
    #[arg(long = "gekko-step-freq", default_value_t = 6.25)]
    pub gekko_step_freq: f64,

    /// Seconds between frequency steps.
    #[arg(long = "gekko-step-delay", default_value_t = 1)]
    pub gekko_step_delay: u64,

    /// Raise the requested clock when the rolling rate exceeds this
    /// fraction of the expected rate.
    #[arg(long = "gekko-tune-up", default_value_t = 0.97)]
    pub gekko_tune_up: f64,

    /// Lower the requested clock when the rolling rate falls below this
    /// fraction of the expected rate.
    #[arg(long = "gekko-tune-down", default_value_t = 0.65)]
    pub gekko_tune_down: f64,

    /// Target frequency for BM1387-class sticks, MHz.
    #[arg(long = "gekko-gsh-freq", default_value_t = 200.0)]
    pub gekko_gsh_freq: f64,

    /// Core voltage in millivolts (300-810).
    #[arg(long = "gekko-gsh-vcore", default_value_t = 400)]
    pub gekko_gsh_vcore: u32,

    /// Only claim devices whose serial contains this string.
    #[arg(long = "gekko-serial")]
    pub gekko_serial: Option<String>,

    /// Enable AsicBoost midstate rolling where the silicon supports it.
    #[arg(long = "gekko-boost")]
    pub gekko_boost: bool,

    /// Idle window (ms) that ends chip enumeration.
    #[arg(long = "gekko-chip-idle-ms", default_value_t = 50)]
    pub gekko_chip_idle_ms: u64,

    /// Run device resets through the re-init path instead of a bare
    /// restart.
    #[arg(long = "gekko-reset-reinit")]
    pub gekko_reset_reinit: bool,

    /// Pool definition `url,user,pass`; repeatable. The pool client
    /// itself is external, these seed its view.
    #[arg(long = "pool")]
    pub pools: Vec<String>,
}

impl Options {
    pub fn usb_selector(&self) -> Result<UsbSelector, Error> {
        match &self.usb {
            Some(spec) => UsbSelector::parse(spec),
            None => Ok(UsbSelector::default()),
        }
    }

    pub fn tunables(&self) -> Tunables {
        Tunables {
            start_freq: self.gekko_start_freq,
            step_freq: self.gekko_step_freq,
            step_delay: Duration::from_secs(self.gekko_step_delay.clamp(1, 600)),
            tune_up: self.gekko_tune_up,
            ghrequire: self.gekko_tune_down.clamp(0.0, 0.8),
            chip_idle: Duration::from_millis(self.gekko_chip_idle_ms),
            boost: self.gekko_boost,
            gsh_freq: self.gekko_gsh_freq,
            gsh_vcore_mv: self.gekko_gsh_vcore.clamp(300, 810),
            reset_reinit: self.gekko_reset_reinit,
            serial_filter: self.gekko_serial.clone(),
        }
    }

    pub fn api_options(&self) -> ApiOptions {
        ApiOptions {
            listen: self.api_listen,
            host: self.api_host.clone(),
            port: self.api_port,
            allow: self.api_allow.clone(),
            network: self.api_network,
            groups: self.api_groups.clone(),
            description: self.api_description.clone(),
            mcast: self.api_mcast,
            mcast_addr: self.api_mcast_addr.clone(),
            mcast_port: self.api_mcast_port,
            mcast_code: self.api_mcast_code.clone(),
            mcast_des: self.api_mcast_des.clone(),
        }
    }
}
