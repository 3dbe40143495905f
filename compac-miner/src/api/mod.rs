//! JSON/text API server (TCP) with optional multicast discovery.
//!
//! The server holds a [`CoreContext`] view over the device registry and the
//! pool collaborator; every command handler reads or mutates through it.

pub mod command;
pub mod groups;
pub mod mcast;
pub mod response;
pub mod server;

use crate::device::DeviceRegistry;
use groups::AccessControl;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// API protocol version reported by `version`.
pub const API_VERSION: &str = "3.7";

/// Server options from the `--api-*` CLI surface.
#[derive(Debug, Clone)]
pub struct ApiOptions {
    pub listen: bool,
    pub host: String,
    pub port: u16,
    pub allow: Option<String>,
    pub network: bool,
    pub groups: Option<String>,
    pub description: String,
    pub mcast: bool,
    pub mcast_addr: String,
    pub mcast_port: u16,
    pub mcast_code: String,
    pub mcast_des: String,
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            listen: false,
            host: "127.0.0.1".into(),
            port: 4028,
            allow: None,
            network: false,
            groups: None,
            description: String::new(),
            mcast: false,
            mcast_addr: "224.0.0.75".into(),
            mcast_port: 4028,
            mcast_code: "FTW".into(),
            mcast_des: String::new(),
        }
    }
}

/// One pool as the API presents it.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub idx: usize,
    pub url: String,
    pub user: String,
    pub alive: bool,
    pub enabled: bool,
    pub priority: u32,
    pub quota: u32,
    pub getworks: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub stale: u64,
    pub stratum_active: bool,
    pub has_vmask: bool,
}

/// The pool collaborator as seen by API mutation commands.
///
/// The real Stratum client lives outside the driver core; anything that
/// manages pools implements this seam.
pub trait PoolControl: Send + Sync {
    fn pools(&self) -> Vec<PoolSnapshot>;
    fn switch_pool(&self, idx: usize) -> Result<PoolSnapshot, String>;
    fn add_pool(&self, url: &str, user: &str, pass: &str) -> Result<usize, String>;
    fn remove_pool(&self, idx: usize) -> Result<(), String>;
    fn enable_pool(&self, idx: usize, enable: bool) -> Result<bool, String>;
    fn set_priority(&self, order: &[usize]) -> Result<(), String>;
    fn set_quota(&self, idx: usize, quota: u32) -> Result<(), String>;
    /// Persist the collaborator's config; returns the filename written.
    fn save_config(&self, path: Option<&str>) -> Result<String, String>;
}

/// In-memory [`PoolControl`] used when no external pool manager is wired
/// in (and by the tests).
#[derive(Default)]
pub struct StaticPools {
    pools: Mutex<Vec<PoolSnapshot>>,
}

impl StaticPools {
    pub fn new(pools: Vec<PoolSnapshot>) -> Self {
        Self {
            pools: Mutex::new(pools),
        }
    }
}

impl PoolControl for StaticPools {
    fn pools(&self) -> Vec<PoolSnapshot> {
        self.pools.lock().clone()
    }

    fn switch_pool(&self, idx: usize) -> Result<PoolSnapshot, String> {
        let mut pools = self.pools.lock();
        if idx >= pools.len() {
            return Err(format!("invalid pool id {idx}"));
        }
        for (i, pool) in pools.iter_mut().enumerate() {
            pool.priority = if i == idx { 0 } else { pool.priority.max(1) };
        }
        Ok(pools[idx].clone())
    }

    fn add_pool(&self, url: &str, user: &str, _pass: &str) -> Result<usize, String> {
        let mut pools = self.pools.lock();
        let idx = pools.len();
        pools.push(PoolSnapshot {
            idx,
            url: url.to_string(),
            user: user.to_string(),
            alive: false,
            enabled: true,
            priority: idx as u32,
            quota: 1,
            getworks: 0,
            accepted: 0,
            rejected: 0,
            stale: 0,
            stratum_active: false,
            has_vmask: false,
        });
        Ok(idx)
    }

    fn remove_pool(&self, idx: usize) -> Result<(), String> {
        let mut pools = self.pools.lock();
        if idx >= pools.len() {
            return Err(format!("invalid pool id {idx}"));
        }
        if pools.len() == 1 {
            return Err("cannot remove the last pool".into());
        }
        pools.remove(idx);
        for (i, pool) in pools.iter_mut().enumerate() {
            pool.idx = i;
        }
        Ok(())
    }

    fn enable_pool(&self, idx: usize, enable: bool) -> Result<bool, String> {
        let mut pools = self.pools.lock();
        let pool = pools
            .get_mut(idx)
            .ok_or_else(|| format!("invalid pool id {idx}"))?;
        let changed = pool.enabled != enable;
        pool.enabled = enable;
        Ok(changed)
    }

    fn set_priority(&self, order: &[usize]) -> Result<(), String> {
        let mut pools = self.pools.lock();
        for idx in order {
            if *idx >= pools.len() {
                return Err(format!("invalid pool id {idx}"));
            }
        }
        for (prio, idx) in order.iter().enumerate() {
            pools[*idx].priority = prio as u32;
        }
        Ok(())
    }

    fn set_quota(&self, idx: usize, quota: u32) -> Result<(), String> {
        let mut pools = self.pools.lock();
        pools
            .get_mut(idx)
            .ok_or_else(|| format!("invalid pool id {idx}"))?
            .quota = quota;
        Ok(())
    }

    fn save_config(&self, path: Option<&str>) -> Result<String, String> {
        Ok(path.unwrap_or("compac-miner.conf").to_string())
    }
}

/// Everything the command handlers can see and touch.
pub struct CoreContext {
    pub registry: Arc<DeviceRegistry>,
    pub pools: Arc<dyn PoolControl>,
    pub options: ApiOptions,
    pub access: AccessControl,
    pub started: Instant,
    /// Cancelling this ends the accept loops and the whole process run.
    pub shutdown: CancellationToken,
    /// Set (before `shutdown`) when the exit should re-exec instead.
    pub restart_requested: AtomicBool,
    /// Hotplug scan interval in seconds; 0 disables scanning. Shared with
    /// the running scan loop, so the `hotplug` command takes effect on the
    /// next cycle.
    pub hotplug_secs: Arc<AtomicU32>,
    pub debug_enabled: AtomicBool,
    /// Historical-field compatibility for the stats dump.
    pub lockgets_compat: bool,
}

impl CoreContext {
    pub fn request_quit(&self) {
        self.shutdown.cancel();
    }

    pub fn request_restart(&self) {
        self.restart_requested.store(true, Ordering::Release);
        self.shutdown.cancel();
    }
}
