//! API response records and their two wire renderings.
//!
//! Every reply starts with a STATUS record; JSON replies wrap it as
//! `{"STATUS":[{..}],"<SECTION>":[..],"id":1}`, text replies render
//! `,`-separated fields with `|` between sections and end with `\n\0`.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

/// Message codes, numbering preserved for API clients that match on them.
pub mod codes {
    pub const MSG_POOL: u32 = 7;
    pub const MSG_NOPOOL: u32 = 8;
    pub const MSG_DEVS: u32 = 9;
    pub const MSG_NODEVS: u32 = 10;
    pub const MSG_SUMM: u32 = 11;
    pub const MSG_INVCMD: u32 = 14;
    pub const MSG_MISID: u32 = 15;
    pub const MSG_VERSION: u32 = 22;
    pub const MSG_INVJSON: u32 = 23;
    pub const MSG_MISCMD: u32 = 24;
    pub const MSG_MISPID: u32 = 25;
    pub const MSG_INVPID: u32 = 26;
    pub const MSG_SWITCHP: u32 = 27;
    pub const MSG_MINECONFIG: u32 = 33;
    pub const MSG_BADFN: u32 = 43;
    pub const MSG_SAVED: u32 = 44;
    pub const MSG_ACCDENY: u32 = 45;
    pub const MSG_ENAPOOL: u32 = 47;
    pub const MSG_DISPOOL: u32 = 48;
    pub const MSG_ALRENAP: u32 = 49;
    pub const MSG_ALRDISP: u32 = 50;
    pub const MSG_DISLASTP: u32 = 51;
    pub const MSG_INVPDP: u32 = 53;
    pub const MSG_ADDPOOL: u32 = 55;
    pub const MSG_NUMPGA: u32 = 59;
    pub const MSG_NOTIFY: u32 = 60;
    pub const MSG_REMPOOL: u32 = 68;
    pub const MSG_DEVDETAILS: u32 = 69;
    pub const MSG_MINESTATS: u32 = 70;
    pub const MSG_MISCHK: u32 = 71;
    pub const MSG_CHECK: u32 = 72;
    pub const MSG_POOLPRIO: u32 = 73;
    pub const MSG_MINECOIN: u32 = 78;
    pub const MSG_SETCONFIG: u32 = 82;
    pub const MSG_UNKCON: u32 = 83;
    pub const MSG_CONPAR: u32 = 85;
    pub const MSG_CONVAL: u32 = 86;
    pub const MSG_USBSTA: u32 = 87;
    pub const MSG_NOUSTA: u32 = 88;
    pub const MSG_ZERMIS: u32 = 94;
    pub const MSG_ZERINV: u32 = 95;
    pub const MSG_ZERSUM: u32 = 96;
    pub const MSG_ZERNOSUM: u32 = 97;
    pub const MSG_INVHPLG: u32 = 99;
    pub const MSG_HOTPLUG: u32 = 100;
    pub const MSG_DISHPLG: u32 = 101;
    pub const MSG_MISHPLG: u32 = 103;
    pub const MSG_NUMASC: u32 = 104;
    pub const MSG_INVASC: u32 = 107;
    pub const MSG_ASCLRENA: u32 = 108;
    pub const MSG_ASCLRDIS: u32 = 109;
    pub const MSG_ASCENA: u32 = 110;
    pub const MSG_ASCDIS: u32 = 111;
    pub const MSG_ASCIDENT: u32 = 113;
    pub const MSG_MISASCOPT: u32 = 116;
    pub const MSG_ASCSETOK: u32 = 119;
    pub const MSG_ASCSETERR: u32 = 120;
    pub const MSG_SETQUOTA: u32 = 122;
    pub const MSG_LCD: u32 = 125;
    pub const MSG_MINEDEBUG: u32 = 126;
}

/// Global flag: when disabled, STATUS timestamps are zero so test output
/// is reproducible.
pub static TIMESTAMP: Timestamp = Timestamp::new();

pub struct Timestamp(AtomicBool);

impl Timestamp {
    pub const fn new() -> Self {
        Self(AtomicBool::new(true))
    }

    pub fn enable(&self, enable: bool) {
        self.0.store(enable, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        if self.0.load(Ordering::Relaxed) {
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        } else {
            0
        }
    }
}

/// STATUS severity letter.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    S,
    W,
    I,
    E,
    F,
}

#[derive(Serialize, Debug, Clone)]
pub struct StatusInfo {
    #[serde(rename = "STATUS")]
    pub status: Severity,
    #[serde(rename = "When")]
    pub when: u64,
    #[serde(rename = "Code")]
    pub code: u32,
    #[serde(rename = "Msg")]
    pub msg: String,
    #[serde(rename = "Description")]
    pub description: String,
}

/// One complete reply: a STATUS record plus zero or more section items.
#[derive(Debug)]
pub struct Response {
    pub status: StatusInfo,
    /// Section name, e.g. "DEVS"; empty for status-only replies.
    pub section: &'static str,
    /// Items serialized into the section array.
    pub body: Vec<Value>,
}

impl Response {
    pub fn new<S: Serialize>(
        section: &'static str,
        items: Vec<S>,
        severity: Severity,
        code: u32,
        msg: String,
        description: String,
    ) -> Self {
        let body = items
            .into_iter()
            .map(|i| serde_json::to_value(i).expect("BUG: response items serialize"))
            .collect();
        Self {
            status: StatusInfo {
                status: severity,
                when: TIMESTAMP.get(),
                code,
                msg,
                description,
            },
            section,
            body,
        }
    }

    pub fn ok<S: Serialize>(
        section: &'static str,
        items: Vec<S>,
        code: u32,
        msg: String,
        description: String,
    ) -> Self {
        Self::new(section, items, Severity::S, code, msg, description)
    }

    pub fn info(code: u32, msg: String, description: String) -> Self {
        Self::new::<Value>("", vec![], Severity::I, code, msg, description)
    }

    pub fn error(code: u32, msg: String, description: String) -> Self {
        Self::new::<Value>("", vec![], Severity::E, code, msg, description)
    }

    /// JSON rendering: `{"STATUS":[{..}],"SECTION":[..],"id":1}`.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(
            "STATUS".into(),
            Value::Array(vec![
                serde_json::to_value(&self.status).expect("BUG: status serializes"),
            ]),
        );
        if !self.section.is_empty() {
            map.insert(self.section.into(), Value::Array(self.body.clone()));
        }
        map.insert("id".into(), Value::from(1));
        Value::Object(map)
    }

    /// Text rendering: `STATUS=S,When=..|SECTION=..,..|` (no trailing
    /// newline; the server frames it).
    pub fn to_text(&self) -> String {
        let mut out = format!(
            "STATUS={:?},When={},Code={},Msg={},Description={}|",
            self.status.status,
            self.status.when,
            self.status.code,
            escape_text(&self.status.msg),
            escape_text(&self.status.description),
        );
        for item in &self.body {
            out.push_str(self.section);
            if let Value::Object(fields) = item {
                let mut first = true;
                for (k, v) in fields {
                    if first {
                        out.push('=');
                        first = false;
                    } else {
                        out.push(',');
                    }
                    out.push_str(k);
                    out.push('=');
                    out.push_str(&text_value(v));
                }
            }
            out.push('|');
        }
        out
    }
}

fn text_value(v: &Value) -> String {
    match v {
        Value::String(s) => escape_text(s),
        Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Escape the text-format separators inside a field value.
fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ',' | '|' | '=' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Several responses joined by `+` in one request.
#[derive(Debug, Default)]
pub struct MultiResponse {
    pub parts: Vec<(String, Response)>,
}

impl MultiResponse {
    pub fn push(&mut self, cmd: &str, response: Response) {
        self.parts.push((cmd.to_string(), response));
    }

    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (cmd, response) in &self.parts {
            map.insert(cmd.clone(), Value::Array(vec![response.to_json()]));
        }
        map.insert("id".into(), Value::from(1));
        Value::Object(map)
    }

    pub fn to_text(&self) -> String {
        self.parts
            .iter()
            .map(|(_, r)| r.to_text())
            .collect::<String>()
    }
}

// --- section payloads ---------------------------------------------------

#[derive(Serialize, Debug, Clone)]
pub struct VersionBody {
    #[serde(rename = "Miner")]
    pub miner: String,
    #[serde(rename = "API")]
    pub api: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct ConfigBody {
    #[serde(rename = "ASC Count")]
    pub asc_count: u32,
    #[serde(rename = "PGA Count")]
    pub pga_count: u32,
    #[serde(rename = "Pool Count")]
    pub pool_count: u32,
    #[serde(rename = "Strategy")]
    pub strategy: String,
    #[serde(rename = "Log Interval")]
    pub log_interval: u32,
    #[serde(rename = "Device Code")]
    pub device_code: String,
    #[serde(rename = "OS")]
    pub os: String,
    #[serde(rename = "Hotplug")]
    pub hotplug: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct SummaryBody {
    #[serde(rename = "Elapsed")]
    pub elapsed: u64,
    #[serde(rename = "MHS av")]
    pub mhs_av: f64,
    #[serde(rename = "MHS 1m")]
    pub mhs_1m: f64,
    #[serde(rename = "MHS 5m")]
    pub mhs_5m: f64,
    #[serde(rename = "Accepted")]
    pub accepted: u64,
    #[serde(rename = "Rejected")]
    pub rejected: u64,
    #[serde(rename = "Hardware Errors")]
    pub hardware_errors: u64,
    #[serde(rename = "Utility")]
    pub utility: f64,
    #[serde(rename = "Total MH")]
    pub total_mh: f64,
    #[serde(rename = "Found Blocks")]
    pub found_blocks: u32,
    #[serde(rename = "Device Hardware%")]
    pub device_hardware_percent: f64,
}

/// Status letter for one ASC device.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AscStatus {
    Alive,
    Sick,
    Dead,
    Initialising,
}

#[derive(Serialize, Debug, Clone)]
pub struct AscBody {
    #[serde(rename = "ASC")]
    pub asc: u32,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID")]
    pub id: u32,
    #[serde(rename = "Enabled")]
    pub enabled: String,
    #[serde(rename = "Status")]
    pub status: AscStatus,
    #[serde(rename = "Temperature")]
    pub temperature: f64,
    #[serde(rename = "Frequency")]
    pub frequency: f64,
    #[serde(rename = "Chips")]
    pub chips: u32,
    #[serde(rename = "MHS av")]
    pub mhs_av: f64,
    #[serde(rename = "MHS 1m")]
    pub mhs_1m: f64,
    #[serde(rename = "MHS 5m")]
    pub mhs_5m: f64,
    #[serde(rename = "Accepted")]
    pub accepted: u64,
    #[serde(rename = "Rejected")]
    pub rejected: u64,
    #[serde(rename = "Hardware Errors")]
    pub hardware_errors: u64,
    #[serde(rename = "Duplicates")]
    pub duplicates: u64,
    #[serde(rename = "Last Share Time")]
    pub last_share_time: u64,
    #[serde(rename = "Serial")]
    pub serial: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct PoolBody {
    #[serde(rename = "POOL")]
    pub pool: u32,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Priority")]
    pub priority: u32,
    #[serde(rename = "Quota")]
    pub quota: u32,
    #[serde(rename = "Getworks")]
    pub getworks: u64,
    #[serde(rename = "Accepted")]
    pub accepted: u64,
    #[serde(rename = "Rejected")]
    pub rejected: u64,
    #[serde(rename = "Stale")]
    pub stale: u64,
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "Stratum Active")]
    pub stratum_active: bool,
    #[serde(rename = "Has Vmask")]
    pub has_vmask: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct NotifyBody {
    #[serde(rename = "NOTIFY")]
    pub notify: u32,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID")]
    pub id: u32,
    #[serde(rename = "Last Not Well")]
    pub last_not_well: u64,
    #[serde(rename = "Reason Not Well")]
    pub reason_not_well: String,
    #[serde(rename = "*Thread Fail Init")]
    pub thread_fail_init: u64,
    #[serde(rename = "*Dev Over Heat")]
    pub dev_over_heat: u64,
    #[serde(rename = "*Dev Comms Error")]
    pub dev_comms_error: u64,
}

#[derive(Serialize, Debug, Clone)]
pub struct DevDetailBody {
    #[serde(rename = "DEVDETAILS")]
    pub devdetails: u32,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID")]
    pub id: u32,
    #[serde(rename = "Driver")]
    pub driver: String,
    #[serde(rename = "Kernel")]
    pub kernel: String,
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "Device Path")]
    pub device_path: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct StatsBody {
    #[serde(rename = "STATS")]
    pub stats: u32,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Elapsed")]
    pub elapsed: u64,
    #[serde(rename = "Chips")]
    pub chips: u32,
    #[serde(rename = "Frequency")]
    pub frequency: f64,
    #[serde(rename = "FreqReq")]
    pub freq_req: f64,
    #[serde(rename = "Ticket Mask")]
    pub ticket_mask: u32,
    #[serde(rename = "Tasks")]
    pub tasks: u64,
    #[serde(rename = "Busy Tasks")]
    pub busy_tasks: u64,
    #[serde(rename = "Nonces")]
    pub nonces: u64,
    #[serde(rename = "Dups All")]
    pub dups_all: u64,
    #[serde(rename = "Fail Count")]
    pub fail_count: u64,
    #[serde(rename = "Low Eff Resets")]
    pub low_eff_resets: u64,
    #[serde(rename = "Plateau Resets")]
    pub plateau_resets: u64,
    #[serde(rename = "Job Interval Avg ms")]
    pub job_avg_ms: f64,
    #[serde(rename = "Nonce Queue Hits")]
    pub nonce_queue_hits: u64,
    #[serde(rename = "Nonce Queue Drops")]
    pub nonce_queue_drops: u64,
}

#[derive(Serialize, Debug, Clone)]
pub struct CoinBody {
    #[serde(rename = "Hash Method")]
    pub hash_method: String,
    #[serde(rename = "Current Block Time")]
    pub current_block_time: f64,
    #[serde(rename = "Current Block Hash")]
    pub current_block_hash: String,
    #[serde(rename = "LP")]
    pub lp: bool,
    #[serde(rename = "Network Difficulty")]
    pub network_difficulty: f64,
}

#[derive(Serialize, Debug, Clone)]
pub struct LcdBody {
    #[serde(rename = "Elapsed")]
    pub elapsed: u64,
    #[serde(rename = "GHS av")]
    pub ghs_av: f64,
    #[serde(rename = "GHS 5m")]
    pub ghs_5m: f64,
    #[serde(rename = "Temperature")]
    pub temperature: f64,
    #[serde(rename = "Last Share Time")]
    pub last_share_time: u64,
    #[serde(rename = "Current Pool")]
    pub current_pool: String,
    #[serde(rename = "User")]
    pub user: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct CountBody {
    #[serde(rename = "Count")]
    pub count: u32,
}

#[derive(Serialize, Debug, Clone)]
pub struct UsbStatsBody {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID")]
    pub id: u32,
    #[serde(rename = "Bus Number")]
    pub bus_number: u8,
    #[serde(rename = "Device Address")]
    pub device_address: u8,
    #[serde(rename = "Manufacturer")]
    pub manufacturer: String,
    #[serde(rename = "Product")]
    pub product: String,
    #[serde(rename = "Serial")]
    pub serial: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct CheckBody {
    #[serde(rename = "Exists")]
    pub exists: String,
    #[serde(rename = "Access")]
    pub access: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct DebugBody {
    #[serde(rename = "Debug")]
    pub debug: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Response {
        TIMESTAMP.enable(false);
        Response::ok(
            "VERSION",
            vec![VersionBody {
                miner: "compac-miner 0.1.0".into(),
                api: "3.7".into(),
            }],
            codes::MSG_VERSION,
            "Miner versions".into(),
            "rig".into(),
        )
    }

    #[test]
    fn json_reply_has_exactly_one_status() {
        let json = sample().to_json();
        let status = json.get("STATUS").expect("STATUS array");
        assert_eq!(status.as_array().map(Vec::len), Some(1));
        assert_eq!(json.get("id"), Some(&Value::from(1)));
        let section = json.get("VERSION").expect("section").as_array().unwrap();
        assert_eq!(section.len(), 1);
    }

    #[test]
    fn text_reply_uses_comma_and_pipe() {
        let text = sample().to_text();
        assert!(text.starts_with("STATUS=S,When=0,Code=22,Msg=Miner versions,"));
        assert!(text.contains("|VERSION="));
        assert!(text.ends_with('|'));
    }

    #[test]
    fn text_escapes_separators() {
        assert_eq!(escape_text("a,b|c=d"), "a\\,b\\|c\\=d");
    }

    #[test]
    fn error_reply_is_status_only() {
        TIMESTAMP.enable(false);
        let r = Response::error(codes::MSG_INVCMD, "Invalid command".into(), String::new());
        let json = r.to_json();
        assert!(json.get("STATUS").is_some());
        assert_eq!(json.as_object().unwrap().len(), 2, "STATUS and id only");
        assert_eq!(
            json["STATUS"][0]["STATUS"],
            Value::String("E".into())
        );
    }

    #[test]
    fn multi_response_keys_by_command() {
        TIMESTAMP.enable(false);
        let mut multi = MultiResponse::default();
        multi.push("version", sample());
        multi.push("summary", Response::info(codes::MSG_SUMM, "Summary".into(), String::new()));
        let json = multi.to_json();
        assert!(json.get("version").is_some());
        assert!(json.get("summary").is_some());
        assert_eq!(json.get("id"), Some(&Value::from(1)));
    }
}
