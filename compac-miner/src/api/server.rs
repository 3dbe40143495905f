//! The TCP listener: framing, access check, dispatch, teardown.
//!
//! One request, one reply, then the connection closes, matching how every
//! monitoring tool out there drives this protocol. Replies are terminated
//! with a NUL; text replies get a newline first.

use super::command::{self, Format, Reply, Request};
use super::groups::AccessControl;
use super::CoreContext;
use crate::error::ApiError;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Largest request we will buffer before giving up on a client.
const MAX_REQUEST: usize = 8192;

/// Bind retry schedule: a restarting instance may still hold the port.
const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(30);
const BIND_GIVE_UP: Duration = Duration::from_secs(61);

/// Bind the API socket, retrying for just over a minute before declaring
/// the port lost. A failure here is fatal for the process (exit code 1).
pub async fn bind(host: &str, port: u16) -> Result<TcpListener, ApiError> {
    let start = std::time::Instant::now();
    loop {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if start.elapsed() < BIND_GIVE_UP => {
                warn!("API bind to port {port} failed ({e}), retrying");
                tokio::time::sleep(BIND_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(ApiError::Bind { port, source: e }),
        }
    }
}

/// Accept loop. Returns when `quit`/`restart` (or process shutdown)
/// cancels the context token.
pub async fn run(ctx: Arc<CoreContext>, listener: TcpListener) {
    info!(
        "API listening on {}:{}",
        ctx.options.host, ctx.options.port
    );

    loop {
        let accepted = tokio::select! {
            a = listener.accept() => a,
            _ = ctx.shutdown.cancelled() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    handle_connection(ctx, stream, peer).await;
                });
            }
            Err(e) => {
                debug!("API accept failed: {e}");
            }
        }
    }
    info!("API listener stopped");
}

async fn handle_connection(ctx: Arc<CoreContext>, mut stream: TcpStream, peer: SocketAddr) {
    let Some(group) = check_connect(&ctx.access, peer.ip()) else {
        // not on the allow list: close without a reply, but keep the trace
        info!("API: connection from {peer} rejected");
        return;
    };

    let Some(line) = read_request(&mut stream).await else {
        return;
    };
    debug!("API: [{peer}] {line:?}");

    let (payload, format) = match Request::parse(&line) {
        Ok(request) => {
            let reply = command::handle(&ctx, &request, group);
            render(reply, request.format)
        }
        Err((response, format)) => render(Reply::Single(response), format),
    };

    let mut bytes = payload.into_bytes();
    if format == Format::Text {
        bytes.push(b'\n');
    }
    bytes.push(0);

    if let Err(e) = stream.write_all(&bytes).await {
        debug!("API: reply to {peer} failed: {e}");
    }
    let _ = stream.shutdown().await;
}

/// Read up to the request terminator (`\0` or `\n`) or the size cap.
async fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        match tokio::time::timeout(Duration::from_secs(10), stream.read(&mut byte)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {
                if byte[0] == 0 || byte[0] == b'\n' {
                    break;
                }
                buf.push(byte[0]);
                if buf.len() > MAX_REQUEST {
                    return None;
                }
            }
            Ok(Err(_)) | Err(_) => return None,
        }
    }
    if buf.is_empty() {
        return None;
    }
    String::from_utf8(buf).ok()
}

fn render(reply: Reply, format: Format) -> (String, Format) {
    let payload = match (&reply, format) {
        (Reply::Raw(word), Format::Json) => format!("{{\"{word}\":1}}"),
        (Reply::Raw(word), Format::Text) => (*word).to_string(),
        (Reply::Single(r), Format::Json) => r.to_json().to_string(),
        (Reply::Single(r), Format::Text) => r.to_text(),
        (Reply::Multi(m), Format::Json) => m.to_json().to_string(),
        (Reply::Multi(m), Format::Text) => m.to_text(),
    };
    (payload, format)
}

/// Map a peer address to its access group, if allowed at all.
pub fn check_connect(access: &AccessControl, ip: IpAddr) -> Option<char> {
    access.group_for(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::groups::AccessControl;
    use crate::api::response::TIMESTAMP;
    use crate::api::{ApiOptions, CoreContext, PoolSnapshot, StaticPools};
    use crate::device::DeviceRegistry;
    use crate::usb::descriptor::UsbSelector;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn context(allow: Option<&str>) -> Arc<CoreContext> {
        TIMESTAMP.enable(false);
        let access = AccessControl::from_options(allow, None, false).unwrap();
        Arc::new(CoreContext {
            registry: Arc::new(DeviceRegistry::new(UsbSelector::default())),
            pools: Arc::new(StaticPools::new(vec![PoolSnapshot {
                idx: 0,
                url: "stratum+tcp://pool.example:3333".into(),
                user: "worker".into(),
                alive: true,
                enabled: true,
                priority: 0,
                quota: 1,
                getworks: 4,
                accepted: 2,
                rejected: 0,
                stale: 0,
                stratum_active: true,
                has_vmask: true,
            }])),
            options: ApiOptions {
                description: "lab-rig-1".into(),
                ..ApiOptions::default()
            },
            access,
            started: std::time::Instant::now(),
            shutdown: CancellationToken::new(),
            restart_requested: AtomicBool::new(false),
            hotplug_secs: Arc::new(AtomicU32::new(5)),
            debug_enabled: AtomicBool::new(false),
            lockgets_compat: false,
        })
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn json_version_reply_shape() {
        let ctx = context(None);
        let request = Request::parse(r#"{"command":"version"}"#).unwrap();
        let reply = command::handle(&ctx, &request, 'W');
        let (payload, _) = render(reply, Format::Json);
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["STATUS"].as_array().unwrap().len(), 1);
        assert_eq!(json["STATUS"][0]["Code"], 22);
        assert_eq!(json["VERSION"][0]["API"], "3.7");
        assert_eq!(json["id"], 1);
    }

    #[test]
    fn text_reply_framing() {
        let ctx = context(None);
        let request = Request::parse("version").unwrap();
        assert_eq!(request.format, Format::Text);
        let reply = command::handle(&ctx, &request, 'W');
        let (payload, _) = render(reply, Format::Text);
        assert!(payload.starts_with("STATUS=S,"));
        assert!(payload.contains("|VERSION="));
        let sections: Vec<&str> = payload.split('|').collect();
        assert!(sections.len() >= 2);
        for field in sections[0].split(',') {
            assert!(field.contains('='), "field {field:?} must be key=value");
        }
    }

    #[test]
    fn joined_commands_return_multi() {
        let ctx = context(None);
        let request = Request::parse("summary+pools").unwrap();
        let reply = command::handle(&ctx, &request, 'W');
        let (payload, _) = render(reply, Format::Text);
        assert!(payload.contains("SUMMARY="));
        assert!(payload.contains("POOLS="));
    }

    #[test]
    fn joined_json_commands_key_sections() {
        let ctx = context(None);
        let request = Request::parse(r#"{"command":"summary+version"}"#).unwrap();
        let reply = command::handle(&ctx, &request, 'W');
        let (payload, _) = render(reply, Format::Json);
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert!(json.get("summary").is_some());
        assert!(json.get("version").is_some());
    }

    #[test]
    fn invalid_command_gets_invcmd_without_banner() {
        let ctx = context(None);
        let request = Request::parse("frobnicate").unwrap();
        let reply = command::handle(&ctx, &request, 'W');
        let (payload, _) = render(reply, Format::Text);
        assert!(payload.contains("Code=14"));
        assert!(payload.contains("Msg=Invalid command"));
        assert!(!payload.contains("lab-rig-1"));
    }

    #[test]
    fn readonly_group_denied_quit() {
        let ctx = context(Some("R:127.0.0.1"));
        let group = check_connect(&ctx.access, ip("127.0.0.1")).expect("allowed");
        let request = Request::parse("quit").unwrap();
        let reply = command::handle(&ctx, &request, group);
        let (payload, _) = render(reply, Format::Text);
        assert!(payload.starts_with("STATUS=E,"));
        assert!(payload.contains("Code=45"));
        assert!(payload.contains("Access denied to 'quit' command"));
        assert!(!ctx.shutdown.is_cancelled(), "quit must not fire");
    }

    #[test]
    fn privileged_quit_replies_bye_and_cancels() {
        let ctx = context(None);
        let request = Request::parse("quit").unwrap();
        let reply = command::handle(&ctx, &request, 'W');
        let (payload, _) = render(reply, Format::Text);
        assert_eq!(payload, "BYE");
        assert!(ctx.shutdown.is_cancelled());
        assert!(!ctx.restart_requested.load(Ordering::Relaxed));
    }

    #[test]
    fn restart_sets_flag() {
        let ctx = context(None);
        let request = Request::parse(r#"{"command":"restart"}"#).unwrap();
        let reply = command::handle(&ctx, &request, 'W');
        let (payload, _) = render(reply, Format::Json);
        assert_eq!(payload, "{\"RESTART\":1}");
        assert!(ctx.restart_requested.load(Ordering::Relaxed));
    }

    #[test]
    fn unlisted_peer_has_no_group() {
        let ctx = context(Some("W:10.0.0.1"));
        assert_eq!(check_connect(&ctx.access, ip("10.0.0.2")), None);
        assert_eq!(check_connect(&ctx.access, ip("10.0.0.1")), Some('W'));
    }

    #[test]
    fn check_command_reports_existence_and_access() {
        let ctx = context(Some("R:127.0.0.1"));
        let request = Request::parse("check|quit").unwrap();
        let reply = command::handle(&ctx, &request, 'R');
        let (payload, _) = render(reply, Format::Text);
        assert!(payload.contains("Exists=Y"));
        assert!(payload.contains("Access=N"));
    }

    #[test]
    fn pools_reflect_the_collaborator() {
        let ctx = context(None);
        let request = Request::parse(r#"{"command":"pools"}"#).unwrap();
        let reply = command::handle(&ctx, &request, 'W');
        let (payload, _) = render(reply, Format::Json);
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["POOLS"][0]["URL"], "stratum+tcp://pool.example:3333");
        assert_eq!(json["POOLS"][0]["Has Vmask"], true);
    }

    #[test]
    fn addpool_requires_three_fields() {
        let ctx = context(None);
        let bad = Request::parse("addpool|onlyurl").unwrap();
        let reply = command::handle(&ctx, &bad, 'W');
        let (payload, _) = render(reply, Format::Text);
        assert!(payload.starts_with("STATUS=E,"));

        let good = Request::parse("addpool|stratum+tcp://x:3333,user,pass").unwrap();
        let reply = command::handle(&ctx, &good, 'W');
        let (payload, _) = render(reply, Format::Text);
        assert!(payload.contains("Code=55"));
        assert_eq!(ctx.pools.pools().len(), 2);
    }

    #[test]
    fn zero_all_resets_counters() {
        let ctx = context(None);
        let request = Request::parse("zero|all,true").unwrap();
        let reply = command::handle(&ctx, &request, 'W');
        let (payload, _) = render(reply, Format::Text);
        assert!(payload.contains("Code=96"));

        let request = Request::parse("zero|all,false").unwrap();
        let reply = command::handle(&ctx, &request, 'W');
        let (payload, _) = render(reply, Format::Text);
        assert!(payload.contains("Code=97"));

        let request = Request::parse("zero|nonsense").unwrap();
        let reply = command::handle(&ctx, &request, 'W');
        let (payload, _) = render(reply, Format::Text);
        assert!(payload.contains("Code=95"));
    }

    #[test]
    fn hotplug_updates_interval() {
        let ctx = context(None);
        let request = Request::parse("hotplug|30").unwrap();
        command::handle(&ctx, &request, 'W');
        assert_eq!(ctx.hotplug_secs.load(Ordering::Relaxed), 30);

        let request = Request::parse("hotplug|0").unwrap();
        let reply = command::handle(&ctx, &request, 'W');
        let (payload, _) = render(reply, Format::Text);
        assert!(payload.contains("Code=101"));
        assert_eq!(ctx.hotplug_secs.load(Ordering::Relaxed), 0);
    }
}
