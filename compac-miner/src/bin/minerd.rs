//! Process entry point: wiring, lifecycle, exit codes.

use anyhow::Context;
use clap::Parser;
use compac_miner::api::{self, groups::AccessControl, CoreContext, PoolSnapshot, StaticPools};
use compac_miner::config::Options;
use compac_miner::device::{self, DeviceHooks, DeviceRegistry};
use compac_miner::usb;
use compac_miner::work::IdleSource;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn pool_snapshots(options: &Options) -> Vec<PoolSnapshot> {
    options
        .pools
        .iter()
        .enumerate()
        .filter_map(|(idx, spec)| {
            let mut parts = spec.splitn(3, ',');
            let url = parts.next()?.to_string();
            let user = parts.next().unwrap_or("").to_string();
            Some(PoolSnapshot {
                idx,
                url,
                user,
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
            })
        })
        .collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let options = Options::parse();

    match run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(options: Options) -> anyhow::Result<()> {
    let selector = options.usb_selector().context("invalid --usb selector")?;
    let access = AccessControl::from_options(
        options.api_allow.as_deref(),
        options.api_groups.as_deref(),
        options.api_network,
    )
    .context("invalid API access configuration")?;

    let ctx = usb::context().context("libusb init failed")?;

    if options.usb_list_all {
        for (_, info) in usb::list_devices(&ctx) {
            println!(
                "{:03}:{:03} {:04x}:{:04x} {} {} {}",
                info.bus,
                info.address,
                info.vendor_id,
                info.product_id,
                info.manufacturer,
                info.product,
                info.serial
            );
        }
        return Ok(());
    }

    if options.usb_dump {
        for (_, info) in usb::list_devices(&ctx) {
            if let Some(desc) = usb::descriptor::find_descriptor(
                info.vendor_id,
                info.product_id,
                &info.manufacturer,
                &info.product,
            ) {
                println!("{:03}:{:03} {} -> {desc:#?}", info.bus, info.address, info.product);
            }
        }
    }

    let registry = Arc::new(DeviceRegistry::new(selector));
    let hooks = DeviceHooks {
        source: Arc::new(IdleSource),
    };
    let tunables = options.tunables();

    let shutdown = CancellationToken::new();
    let hotplug_secs = Arc::new(AtomicU32::new(options.hotplug));
    let core = Arc::new(CoreContext {
        registry: Arc::clone(&registry),
        pools: Arc::new(StaticPools::new(pool_snapshots(&options))),
        options: options.api_options(),
        access,
        started: Instant::now(),
        shutdown: shutdown.clone(),
        restart_requested: AtomicBool::new(false),
        hotplug_secs: Arc::clone(&hotplug_secs),
        debug_enabled: AtomicBool::new(false),
        lockgets_compat: false,
    });

    let scan = tokio::spawn(device::hotplug_scan(
        ctx,
        Arc::clone(&registry),
        hooks,
        tunables,
        hotplug_secs,
        shutdown.clone(),
    ));

    let mut api_task = None;
    let mut mcast_task = None;
    if core.options.listen {
        let listener = api::server::bind(&core.options.host, core.options.port)
            .await
            .context("API bind failed")?;
        api_task = Some(tokio::spawn(api::server::run(
            Arc::clone(&core),
            listener,
        )));

        if core.options.mcast {
            let mcast_core = Arc::clone(&core);
            mcast_task = Some(tokio::spawn(async move {
                if let Err(e) = api::mcast::run(mcast_core).await {
                    warn!("multicast listener failed: {e}");
                }
            }));
        }
    }

    info!("compac-minerd {} running", env!("CARGO_PKG_VERSION"));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {
            // API quit/restart
        }
    }

    // orderly teardown: every device releases its interfaces and, where it
    // can, parks the silicon cold
    for (key, _) in registry.snapshot() {
        registry.remove(key).await;
    }
    let _ = scan.await;
    if let Some(task) = api_task {
        let _ = task.await;
    }
    if let Some(task) = mcast_task {
        task.abort();
    }

    if core.restart_requested.load(Ordering::Acquire) {
        info!("restart requested; exiting for the supervisor to relaunch");
    }
    Ok(())
}
