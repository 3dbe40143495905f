//! Command parsing and dispatch.
//!
//! Requests arrive as a single text line (`cmd[|param]`) or a JSON object
//! (`{"command":..,"parameter":..}`); commands may be joined with `+`.
//! Replies mirror the request family. Write-mode commands are gated by the
//! caller's group before their handler runs.

use super::response::{codes::*, *};
use super::{CoreContext, API_VERSION};
use crate::device::state::MiningState;
use serde_json::Value;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// One entry of the command table.
#[derive(Debug, Clone, Copy)]
pub struct CommandDef {
    pub name: &'static str,
    pub write_mode: bool,
}

const fn query(name: &'static str) -> CommandDef {
    CommandDef {
        name,
        write_mode: false,
    }
}

const fn write(name: &'static str) -> CommandDef {
    CommandDef {
        name,
        write_mode: true,
    }
}

/// Every command the server understands, write-mode tagged.
pub static COMMANDS: &[CommandDef] = &[
    query("version"),
    query("config"),
    query("summary"),
    query("devs"),
    query("edevs"),
    query("pools"),
    query("notify"),
    query("devdetails"),
    query("stats"),
    query("estats"),
    query("dbgstats"),
    query("coin"),
    query("lcd"),
    query("asccount"),
    query("pgacount"),
    query("usbstats"),
    query("check"),
    write("switchpool"),
    write("addpool"),
    write("removepool"),
    write("enablepool"),
    write("disablepool"),
    write("poolpriority"),
    write("poolquota"),
    write("save"),
    write("restart"),
    write("quit"),
    write("ascset"),
    write("ascenable"),
    write("ascdisable"),
    write("ascidentify"),
    write("zero"),
    write("hotplug"),
    write("debug"),
    write("setconfig"),
];

pub fn find_command(name: &str) -> Option<&'static CommandDef> {
    COMMANDS.iter().find(|d| d.name == name)
}

/// Which reply family the client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

/// A parsed request: one or more commands sharing a parameter.
#[derive(Debug)]
pub struct Request {
    pub commands: Vec<String>,
    pub parameter: Option<String>,
    pub format: Format,
}

impl Request {
    /// Parse a request line. Errors come back as ready-to-send responses
    /// in the detected family.
    pub fn parse(line: &str) -> Result<Request, (Response, Format)> {
        let line = line.trim_end_matches(['\0', '\n', '\r']);

        if line.trim_start().starts_with('{') {
            let value: Value = serde_json::from_str(line).map_err(|_| {
                (
                    Response::error(MSG_INVJSON, "Invalid JSON".into(), String::new()),
                    Format::Json,
                )
            })?;
            let command = value
                .get("command")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    (
                        Response::error(
                            MSG_MISCMD,
                            "Missing JSON 'command'".into(),
                            String::new(),
                        ),
                        Format::Json,
                    )
                })?;
            let parameter = value.get("parameter").map(|p| match p {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            Ok(Request {
                commands: command.split('+').map(str::to_string).collect(),
                parameter,
                format: Format::Json,
            })
        } else {
            let (command, parameter) = match line.split_once('|') {
                Some((c, p)) if !p.is_empty() => (c, Some(p.to_string())),
                Some((c, _)) => (c, None),
                None => (line, None),
            };
            Ok(Request {
                commands: command.split('+').map(str::to_string).collect(),
                parameter,
                format: Format::Text,
            })
        }
    }
}

/// A complete reply, possibly the bare BYE/RESTART acknowledgements.
#[derive(Debug)]
pub enum Reply {
    Single(Response),
    Multi(MultiResponse),
    /// `quit`/`restart` acknowledge with a bare word before the listener
    /// shuts down.
    Raw(&'static str),
}

/// Handle one request for a caller in `group`.
pub fn handle(ctx: &CoreContext, request: &Request, group: char) -> Reply {
    if request.commands.len() == 1 {
        return handle_one(ctx, &request.commands[0], request.parameter.as_deref(), group);
    }

    let mut multi = MultiResponse::default();
    for cmd in &request.commands {
        match handle_one(ctx, cmd, request.parameter.as_deref(), group) {
            Reply::Single(response) => multi.push(cmd, response),
            // quit/restart end a joined request immediately
            raw @ Reply::Raw(_) => return raw,
            Reply::Multi(_) => unreachable!("joined commands never nest"),
        }
    }
    Reply::Multi(multi)
}

fn handle_one(ctx: &CoreContext, cmd: &str, param: Option<&str>, group: char) -> Reply {
    let description = ctx.options.description.clone();

    let Some(def) = find_command(cmd) else {
        info!("API: invalid command '{cmd}'");
        // probes get no banner back
        return Reply::Single(Response::error(
            MSG_INVCMD,
            "Invalid command".into(),
            String::new(),
        ));
    };

    if !ctx.access.is_allowed(group, def.name) {
        warn!("API: access denied to '{cmd}' for group {group}");
        return Reply::Single(Response::error(
            MSG_ACCDENY,
            format!("Access denied to '{cmd}' command"),
            description,
        ));
    }

    match def.name {
        "quit" => {
            ctx.request_quit();
            return Reply::Raw("BYE");
        }
        "restart" => {
            ctx.request_restart();
            return Reply::Raw("RESTART");
        }
        _ => {}
    }

    Reply::Single(dispatch(ctx, def.name, param, group, description))
}

fn dispatch(
    ctx: &CoreContext,
    cmd: &str,
    param: Option<&str>,
    group: char,
    description: String,
) -> Response {
    match cmd {
        "version" => version(description),
        "config" => config(ctx, description),
        "summary" => summary(ctx, description),
        "devs" | "edevs" => devs(ctx, description),
        "pools" => pools(ctx, description),
        "notify" => notify(ctx, description),
        "devdetails" => devdetails(ctx, description),
        "stats" | "estats" | "dbgstats" => stats(ctx, description),
        "coin" => coin(description),
        "lcd" => lcd(ctx, description),
        "asccount" => Response::ok(
            "ASCS",
            vec![CountBody {
                count: ctx.registry.count() as u32,
            }],
            MSG_NUMASC,
            "ASC count".into(),
            description,
        ),
        "pgacount" => Response::ok(
            "PGAS",
            vec![CountBody { count: 0 }],
            MSG_NUMPGA,
            "PGA count".into(),
            description,
        ),
        "usbstats" => usbstats(ctx, description),
        "check" => check(ctx, param, group, description),
        "switchpool" => switchpool(ctx, param, description),
        "addpool" => addpool(ctx, param, description),
        "removepool" => removepool(ctx, param, description),
        "enablepool" => enablepool(ctx, param, true, description),
        "disablepool" => enablepool(ctx, param, false, description),
        "poolpriority" => poolpriority(ctx, param, description),
        "poolquota" => poolquota(ctx, param, description),
        "save" => save(ctx, param, description),
        "ascenable" => asc_enable(ctx, param, true, description),
        "ascdisable" => asc_enable(ctx, param, false, description),
        "ascidentify" => asc_identify(ctx, param, description),
        "ascset" => ascset(ctx, param, description),
        "zero" => zero(ctx, param, description),
        "hotplug" => hotplug(ctx, param, description),
        "debug" => debug_cmd(ctx, description),
        "setconfig" => setconfig(param, description),
        other => Response::error(MSG_INVCMD, format!("Invalid command '{other}'"), description),
    }
}

// --- query handlers -----------------------------------------------------

fn version(description: String) -> Response {
    Response::ok(
        "VERSION",
        vec![VersionBody {
            miner: format!("compac-miner {}", env!("CARGO_PKG_VERSION")),
            api: API_VERSION.into(),
        }],
        MSG_VERSION,
        "Miner versions".into(),
        description,
    )
}

fn config(ctx: &CoreContext, description: String) -> Response {
    let hotplug = ctx.hotplug_secs.load(Ordering::Relaxed);
    Response::ok(
        "CONFIG",
        vec![ConfigBody {
            asc_count: ctx.registry.count() as u32,
            pga_count: 0,
            pool_count: ctx.pools.pools().len() as u32,
            strategy: "Failover".into(),
            log_interval: 5,
            device_code: "GSX".into(),
            os: std::env::consts::OS.into(),
            hotplug: if hotplug == 0 {
                "Disabled".into()
            } else {
                format!("{hotplug}s")
            },
        }],
        MSG_MINECONFIG,
        "Miner config".into(),
        description,
    )
}

fn summary(ctx: &CoreContext, description: String) -> Response {
    let mut accepted = 0u64;
    let mut rejected = 0u64;
    let mut hw = 0u64;
    let mut mhs_1m = 0.0;
    let mut mhs_5m = 0.0;
    let mut total_diff = 0u64;

    for (_, entry) in ctx.registry.snapshot() {
        let s = &entry.state;
        accepted += s.counters.accepted.load(Ordering::Relaxed);
        hw += s.counters.hw_errors.load(Ordering::Relaxed);
        rejected += s.counters.nonces.load(Ordering::Relaxed)
            - s.counters.accepted.load(Ordering::Relaxed).min(s.counters.nonces.load(Ordering::Relaxed));
        total_diff += s.counters.nonces.load(Ordering::Relaxed)
            * s.freq.lock().difficulty as u64;
        let now = s.now();
        mhs_1m += s.gh.lock().rate(now, 60).unwrap_or(0.0) / 1e6;
        mhs_5m += s.gh.lock().rate(now, 300).unwrap_or(0.0) / 1e6;
    }

    let elapsed = ctx.started.elapsed().as_secs();
    let utility = if elapsed > 0 {
        accepted as f64 * 60.0 / elapsed as f64
    } else {
        0.0
    };
    let denom = accepted + hw;
    Response::ok(
        "SUMMARY",
        vec![SummaryBody {
            elapsed,
            mhs_av: if elapsed > 0 {
                total_diff as f64 * 4_294_967_296.0 / 1e6 / elapsed as f64
            } else {
                0.0
            },
            mhs_1m,
            mhs_5m,
            accepted,
            rejected,
            hardware_errors: hw,
            utility,
            total_mh: total_diff as f64 * 4_294_967_296.0 / 1e6,
            found_blocks: 0,
            device_hardware_percent: if denom > 0 {
                100.0 * hw as f64 / denom as f64
            } else {
                0.0
            },
        }],
        MSG_SUMM,
        "Summary".into(),
        description,
    )
}

fn asc_status(entry: &crate::device::DeviceEntry) -> AscStatus {
    match entry.state.mining_state() {
        MiningState::Mining | MiningState::MiningDups => AscStatus::Alive,
        MiningState::ShutdownOk | MiningState::Shutdown => AscStatus::Dead,
        MiningState::Reset | MiningState::Reinit => AscStatus::Sick,
        _ => AscStatus::Initialising,
    }
}

fn devs(ctx: &CoreContext, description: String) -> Response {
    let mut list = Vec::new();
    for (_, entry) in ctx.registry.snapshot() {
        let s = &entry.state;
        let now = s.now();
        let freq = s.freq.lock().clone();
        let telem = s.telem.lock().clone();
        let last_nonce = s.times.lock().last_nonce;
        list.push(AscBody {
            asc: s.device_id as u32,
            name: entry.driver.to_string(),
            id: s.device_id as u32,
            enabled: if s.is_enabled() { "Y".into() } else { "N".into() },
            status: asc_status(&entry),
            temperature: telem.temp as f64,
            frequency: freq.frequency,
            chips: freq.chips,
            mhs_av: freq.hashrate as f64 / 1e6,
            mhs_1m: s.gh.lock().rate(now, 60).unwrap_or(0.0) / 1e6,
            mhs_5m: s.gh.lock().rate(now, 300).unwrap_or(0.0) / 1e6,
            accepted: s.counters.accepted.load(Ordering::Relaxed),
            rejected: 0,
            hardware_errors: s.counters.hw_errors.load(Ordering::Relaxed),
            duplicates: s.counters.dupsall.load(Ordering::Relaxed),
            last_share_time: last_nonce.elapsed().as_secs(),
            serial: s.serial.clone(),
        });
    }
    let count = list.len();
    if count == 0 {
        return Response::error(MSG_NODEVS, "No ASCs".into(), description);
    }
    Response::ok("DEVS", list, MSG_DEVS, format!("{count} ASC(s)"), description)
}

fn pools(ctx: &CoreContext, description: String) -> Response {
    let list: Vec<PoolBody> = ctx
        .pools
        .pools()
        .into_iter()
        .map(|p| PoolBody {
            pool: p.idx as u32,
            url: p.url,
            status: if !p.enabled {
                "Disabled".into()
            } else if p.alive {
                "Alive".into()
            } else {
                "Dead".into()
            },
            priority: p.priority,
            quota: p.quota,
            getworks: p.getworks,
            accepted: p.accepted,
            rejected: p.rejected,
            stale: p.stale,
            user: p.user,
            stratum_active: p.stratum_active,
            has_vmask: p.has_vmask,
        })
        .collect();
    let count = list.len();
    if count == 0 {
        return Response::error(MSG_NOPOOL, "No pools".into(), description);
    }
    Response::ok("POOLS", list, MSG_POOL, format!("{count} Pool(s)"), description)
}

fn notify(ctx: &CoreContext, description: String) -> Response {
    let mut list = Vec::new();
    for (_, entry) in ctx.registry.snapshot() {
        let s = &entry.state;
        let fails = s.counters.fail_count.load(Ordering::Relaxed);
        list.push(NotifyBody {
            notify: s.device_id as u32,
            name: entry.driver.to_string(),
            id: s.device_id as u32,
            last_not_well: if fails > 0 {
                s.times.lock().last_reset.elapsed().as_secs()
            } else {
                0
            },
            reason_not_well: if fails > 0 {
                "Device reset".into()
            } else {
                "None".into()
            },
            thread_fail_init: 0,
            dev_over_heat: s.telem.lock().cooldown_count as u64,
            dev_comms_error: fails,
        });
    }
    Response::ok("NOTIFY", list, MSG_NOTIFY, "Notify".into(), description)
}

fn devdetails(ctx: &CoreContext, description: String) -> Response {
    let mut list = Vec::new();
    for (_, entry) in ctx.registry.snapshot() {
        let info = &entry.session.info;
        list.push(DevDetailBody {
            devdetails: entry.state.device_id as u32,
            name: entry.driver.to_string(),
            id: entry.state.device_id as u32,
            driver: entry.driver.to_string(),
            kernel: String::new(),
            model: info.product.clone(),
            device_path: format!("{}:{}", info.bus, info.address),
        });
    }
    Response::ok(
        "DEVDETAILS",
        list,
        MSG_DEVDETAILS,
        "Device Details".into(),
        description,
    )
}

fn stats(ctx: &CoreContext, description: String) -> Response {
    let mut list = Vec::new();
    for (_, entry) in ctx.registry.snapshot() {
        let s = &entry.state;
        let freq = s.freq.lock().clone();
        let job = s.jobs.lock().summary();
        list.push(StatsBody {
            stats: s.device_id as u32,
            id: format!("{}{}", entry.driver, s.device_id),
            elapsed: s.times.lock().start_time.elapsed().as_secs(),
            chips: freq.chips,
            frequency: freq.frequency,
            freq_req: freq.frequency_requested,
            ticket_mask: freq.ticket_mask,
            tasks: s.counters.tasks.load(Ordering::Relaxed),
            busy_tasks: s.counters.busy_tasks.load(Ordering::Relaxed),
            nonces: s.counters.nonces.load(Ordering::Relaxed),
            dups_all: s.counters.dupsall.load(Ordering::Relaxed),
            fail_count: s.counters.fail_count.load(Ordering::Relaxed),
            low_eff_resets: s.counters.low_eff_resets.load(Ordering::Relaxed),
            plateau_resets: s.counters.plateau_reset.load(Ordering::Relaxed),
            job_avg_ms: job.avg_ms,
            nonce_queue_hits: s.counters.ntrigger.load(Ordering::Relaxed),
            nonce_queue_drops: s.counters.ntimeout.load(Ordering::Relaxed),
        });
    }
    Response::ok("STATS", list, MSG_MINESTATS, "Miner stats".into(), description)
}

fn coin(description: String) -> Response {
    Response::ok(
        "COIN",
        vec![CoinBody {
            hash_method: "sha256".into(),
            current_block_time: 0.0,
            current_block_hash: String::new(),
            lp: false,
            network_difficulty: 0.0,
        }],
        MSG_MINECOIN,
        "Miner coin".into(),
        description,
    )
}

fn lcd(ctx: &CoreContext, description: String) -> Response {
    let mut ghs_av = 0.0;
    let mut ghs_5m = 0.0;
    let mut temp: f64 = 0.0;
    for (_, entry) in ctx.registry.snapshot() {
        let s = &entry.state;
        ghs_av += s.freq.lock().hashrate as f64 / 1e9;
        ghs_5m += s.gh.lock().rate(s.now(), 300).unwrap_or(0.0) / 1e9;
        temp = temp.max(s.telem.lock().temp as f64);
    }
    let pool = ctx.pools.pools().into_iter().min_by_key(|p| p.priority);
    Response::ok(
        "LCD",
        vec![LcdBody {
            elapsed: ctx.started.elapsed().as_secs(),
            ghs_av,
            ghs_5m,
            temperature: temp,
            last_share_time: 0,
            current_pool: pool.as_ref().map(|p| p.url.clone()).unwrap_or_default(),
            user: pool.map(|p| p.user).unwrap_or_default(),
        }],
        MSG_LCD,
        "LCD".into(),
        description,
    )
}

fn usbstats(ctx: &CoreContext, description: String) -> Response {
    let list: Vec<UsbStatsBody> = ctx
        .registry
        .snapshot()
        .into_iter()
        .map(|(_, entry)| {
            let info = &entry.session.info;
            UsbStatsBody {
                name: entry.driver.to_string(),
                id: entry.state.device_id as u32,
                bus_number: info.bus,
                device_address: info.address,
                manufacturer: info.manufacturer.clone(),
                product: info.product.clone(),
                serial: info.serial.clone(),
            }
        })
        .collect();
    if list.is_empty() {
        return Response::error(MSG_NOUSTA, "No USB Statistics".into(), description);
    }
    Response::ok("USBSTATS", list, MSG_USBSTA, "USB Statistics".into(), description)
}

fn check(ctx: &CoreContext, param: Option<&str>, group: char, description: String) -> Response {
    let Some(cmd) = param.filter(|p| !p.is_empty()) else {
        return Response::error(MSG_MISCHK, "Missing check cmd".into(), description);
    };
    let (exists, allowed) = ctx.access.check(group, cmd);
    Response::ok(
        "CHECK",
        vec![CheckBody {
            exists: yn(exists),
            access: yn(allowed),
        }],
        MSG_CHECK,
        "Check command".into(),
        description,
    )
}

fn yn(b: bool) -> String {
    if b { "Y".into() } else { "N".into() }
}

// --- pool mutation handlers ---------------------------------------------

fn parse_pool_id(ctx: &CoreContext, param: Option<&str>) -> Result<usize, Response> {
    let Some(param) = param.filter(|p| !p.is_empty()) else {
        return Err(Response::error(
            MSG_MISPID,
            "Missing pool id parameter".into(),
            String::new(),
        ));
    };
    let idx: usize = param.trim().parse().map_err(|_| {
        Response::error(MSG_INVPID, format!("Invalid pool id {param}"), String::new())
    })?;
    if idx >= ctx.pools.pools().len() {
        return Err(Response::error(
            MSG_INVPID,
            format!("Invalid pool id {idx}"),
            String::new(),
        ));
    }
    Ok(idx)
}

fn switchpool(ctx: &CoreContext, param: Option<&str>, description: String) -> Response {
    match parse_pool_id(ctx, param) {
        Ok(idx) => match ctx.pools.switch_pool(idx) {
            Ok(pool) => Response::info(
                MSG_SWITCHP,
                format!("Switching to pool {idx}:'{}'", pool.url),
                description,
            ),
            Err(e) => Response::error(MSG_INVPID, e, description),
        },
        Err(r) => r,
    }
}

fn addpool(ctx: &CoreContext, param: Option<&str>, description: String) -> Response {
    let parts: Vec<&str> = param.unwrap_or("").split(',').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Response::error(
            MSG_INVPDP,
            format!("Invalid addpool details '{}'", param.unwrap_or("")),
            description,
        );
    }
    match ctx.pools.add_pool(parts[0], parts[1], parts[2]) {
        Ok(idx) => Response::info(
            MSG_ADDPOOL,
            format!("Added pool {idx}: '{}'", parts[0]),
            description,
        ),
        Err(e) => Response::error(MSG_INVPDP, e, description),
    }
}

fn removepool(ctx: &CoreContext, param: Option<&str>, description: String) -> Response {
    match parse_pool_id(ctx, param) {
        Ok(idx) => {
            let url = ctx
                .pools
                .pools()
                .get(idx)
                .map(|p| p.url.clone())
                .unwrap_or_default();
            match ctx.pools.remove_pool(idx) {
                Ok(()) => Response::info(
                    MSG_REMPOOL,
                    format!("Removed pool {idx}:'{url}'"),
                    description,
                ),
                Err(e) => Response::error(MSG_DISLASTP, e, description),
            }
        }
        Err(r) => r,
    }
}

fn enablepool(
    ctx: &CoreContext,
    param: Option<&str>,
    enable: bool,
    description: String,
) -> Response {
    match parse_pool_id(ctx, param) {
        Ok(idx) => match ctx.pools.enable_pool(idx, enable) {
            Ok(changed) => {
                let (code, verb) = match (enable, changed) {
                    (true, true) => (MSG_ENAPOOL, "Enabling"),
                    (true, false) => (MSG_ALRENAP, "Already enabled"),
                    (false, true) => (MSG_DISPOOL, "Disabling"),
                    (false, false) => (MSG_ALRDISP, "Already disabled"),
                };
                Response::info(code, format!("{verb} pool {idx}"), description)
            }
            Err(e) => Response::error(MSG_INVPID, e, description),
        },
        Err(r) => r,
    }
}

fn poolpriority(ctx: &CoreContext, param: Option<&str>, description: String) -> Response {
    let Some(param) = param.filter(|p| !p.is_empty()) else {
        return Response::error(MSG_MISPID, "Missing pool id parameter".into(), description);
    };
    let ids: Result<Vec<usize>, _> = param.split(',').map(|p| p.trim().parse()).collect();
    match ids {
        Ok(order) => match ctx.pools.set_priority(&order) {
            Ok(()) => Response::info(MSG_POOLPRIO, "Changed pool priorities".into(), description),
            Err(e) => Response::error(MSG_INVPID, e, description),
        },
        Err(_) => Response::error(MSG_INVPID, format!("Invalid pool id {param}"), description),
    }
}

fn poolquota(ctx: &CoreContext, param: Option<&str>, description: String) -> Response {
    let parts: Vec<&str> = param.unwrap_or("").split(',').collect();
    if parts.len() != 2 {
        return Response::error(MSG_MISPID, "Missing pool id parameter".into(), description);
    }
    let (Ok(idx), Ok(quota)) = (parts[0].trim().parse(), parts[1].trim().parse()) else {
        return Response::error(
            MSG_INVPID,
            format!("Invalid pool quota '{}'", param.unwrap_or("")),
            description,
        );
    };
    match ctx.pools.set_quota(idx, quota) {
        Ok(()) => Response::info(
            MSG_SETQUOTA,
            format!("Set pool {idx} to quota {quota}"),
            description,
        ),
        Err(e) => Response::error(MSG_INVPID, e, description),
    }
}

fn save(ctx: &CoreContext, param: Option<&str>, description: String) -> Response {
    match ctx.pools.save_config(param) {
        Ok(filename) => Response::info(
            MSG_SAVED,
            format!("Configuration saved to file '{filename}'"),
            description,
        ),
        Err(e) => Response::error(MSG_BADFN, e, description),
    }
}

// --- device mutation handlers -------------------------------------------

fn parse_asc_id(
    ctx: &CoreContext,
    param: Option<&str>,
) -> Result<(usize, std::sync::Arc<crate::device::DeviceEntry>), Response> {
    let Some(param) = param.filter(|p| !p.is_empty()) else {
        return Err(Response::error(
            MSG_MISID,
            "Missing device id parameter".into(),
            String::new(),
        ));
    };
    let first = param.split(',').next().unwrap_or(param);
    let id: usize = first.trim().parse().map_err(|_| {
        Response::error(
            MSG_INVASC,
            format!("Invalid ASC id {first}"),
            String::new(),
        )
    })?;
    match ctx.registry.by_device_id(id) {
        Some(entry) => Ok((id, entry)),
        None => Err(Response::error(
            MSG_INVASC,
            format!("Invalid ASC id {id}"),
            String::new(),
        )),
    }
}

fn asc_enable(
    ctx: &CoreContext,
    param: Option<&str>,
    enable: bool,
    description: String,
) -> Response {
    match parse_asc_id(ctx, param) {
        Ok((id, entry)) => {
            let already = entry.state.is_enabled() == enable;
            if already {
                let (code, word) = if enable {
                    (MSG_ASCLRENA, "enabled")
                } else {
                    (MSG_ASCLRDIS, "disabled")
                };
                return Response::info(code, format!("ASC {id} already {word}"), description);
            }
            ctx.registry.set_enabled(id, enable);
            let (code, word) = if enable {
                (MSG_ASCENA, "Enabling")
            } else {
                (MSG_ASCDIS, "Disabling")
            };
            Response::info(code, format!("{word} ASC {id}"), description)
        }
        Err(r) => r,
    }
}

fn asc_identify(ctx: &CoreContext, param: Option<&str>, description: String) -> Response {
    match parse_asc_id(ctx, param) {
        Ok((id, entry)) => {
            info!(
                device = id,
                serial = %entry.state.serial,
                "api: identify requested"
            );
            Response::info(MSG_ASCIDENT, format!("Identify command sent to ASC {id}"), description)
        }
        Err(r) => r,
    }
}

fn ascset(ctx: &CoreContext, param: Option<&str>, description: String) -> Response {
    let (id, entry) = match parse_asc_id(ctx, param) {
        Ok(found) => found,
        Err(r) => return r,
    };
    let mut parts = param.expect("id parsed").splitn(3, ',');
    let _ = parts.next();
    let Some(option) = parts.next() else {
        return Response::error(
            MSG_MISASCOPT,
            "Missing option after ASC id".into(),
            description,
        );
    };
    let value = parts.next();

    let result: Result<String, String> = match (option, value) {
        ("freq", Some(v)) => v
            .parse::<f64>()
            .map_err(|_| format!("invalid freq '{v}'"))
            .map(|mhz| {
                let snapped = entry.state.family.snap_frequency(mhz);
                let mut freq = entry.state.freq.lock();
                freq.frequency_requested = snapped;
                freq.frequency_default = snapped;
                format!("freq {snapped:.2}")
            }),
        ("corev", Some(v)) => v
            .parse::<u32>()
            .map_err(|_| format!("invalid corev '{v}'"))
            .map(|mv| {
                entry.state.telem.lock().want_corev_mv = Some(mv);
                format!("corev {mv}")
            }),
        ("fan", Some(v)) => v
            .parse::<u8>()
            .map_err(|_| format!("invalid fan '{v}'"))
            .map(|pct| {
                entry.state.telem.lock().want_fan_percent = Some(pct);
                format!("fan {pct}")
            }),
        ("cooldown", v) => {
            let on = matches!(v, Some("on") | Some("1") | Some("true"));
            entry.state.telem.lock().want_cooldown = Some(on);
            Ok(format!("cooldown {}", if on { "on" } else { "off" }))
        }
        ("reset", _) => {
            entry.state.set_mining_state(MiningState::Reset);
            Ok("reset queued".into())
        }
        (opt, _) => Err(format!("unknown option '{opt}'")),
    };

    match result {
        Ok(what) => Response::info(MSG_ASCSETOK, format!("ASC {id} set OK: {what}"), description),
        Err(e) => Response::error(MSG_ASCSETERR, format!("ASC {id} set failed: {e}"), description),
    }
}

fn zero(ctx: &CoreContext, param: Option<&str>, description: String) -> Response {
    let Some(param) = param.filter(|p| !p.is_empty()) else {
        return Response::error(MSG_ZERMIS, "Missing zero parameters".into(), description);
    };
    let mut parts = param.split(',');
    let which = parts.next().unwrap_or("");
    let summary = !matches!(parts.next(), Some("false"));

    match which {
        "all" | "bestshare" => {
            if which == "all" {
                for (_, entry) in ctx.registry.snapshot() {
                    entry.state.counters.zero_stats();
                    entry.state.gh.lock().reset();
                    entry.state.jobs.lock().reset();
                }
            }
            if summary {
                Response::info(MSG_ZERSUM, format!("Zeroed {which} stats with summary"), description)
            } else {
                Response::info(MSG_ZERNOSUM, format!("Zeroed {which} stats without summary"), description)
            }
        }
        other => Response::error(
            MSG_ZERINV,
            format!("Invalid zero parameter '{other}'"),
            description,
        ),
    }
}

fn hotplug(ctx: &CoreContext, param: Option<&str>, description: String) -> Response {
    let Some(param) = param.filter(|p| !p.is_empty()) else {
        return Response::error(MSG_MISHPLG, "Missing hotplug parameter".into(), description);
    };
    match param.trim().parse::<u32>() {
        Ok(0) => {
            ctx.hotplug_secs.store(0, Ordering::Relaxed);
            Response::info(MSG_DISHPLG, "Hotplug disabled".into(), description)
        }
        Ok(secs) if secs <= 9999 => {
            ctx.hotplug_secs.store(secs, Ordering::Relaxed);
            Response::info(
                MSG_HOTPLUG,
                format!("Hotplug check set to {secs}s"),
                description,
            )
        }
        _ => Response::error(
            MSG_INVHPLG,
            format!("Invalid hotplug parameter '{param}'"),
            description,
        ),
    }
}

fn debug_cmd(ctx: &CoreContext, description: String) -> Response {
    let now = !ctx.debug_enabled.load(Ordering::Relaxed);
    ctx.debug_enabled.store(now, Ordering::Relaxed);
    Response::ok(
        "DEBUG",
        vec![DebugBody {
            debug: yn(now),
        }],
        MSG_MINEDEBUG,
        "Debug settings".into(),
        description,
    )
}

fn setconfig(param: Option<&str>, description: String) -> Response {
    let parts: Vec<&str> = param.unwrap_or("").split(',').collect();
    if parts.len() != 2 || parts[0].is_empty() {
        return Response::error(
            MSG_CONPAR,
            "Missing config parameters 'name,N'".into(),
            description,
        );
    }
    if parts[1].parse::<i64>().is_err() {
        return Response::error(
            MSG_CONVAL,
            format!("Missing config value N for '{},N'", parts[0]),
            description,
        );
    }
    Response::error(
        MSG_UNKCON,
        format!("Unknown config '{}'", parts[0]),
        description,
    )
}
