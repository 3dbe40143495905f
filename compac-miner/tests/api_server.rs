//! End-to-end tests of the API listener over real sockets.

use compac_miner::api::groups::AccessControl;
use compac_miner::api::response::TIMESTAMP;
use compac_miner::api::{server, ApiOptions, CoreContext, PoolSnapshot, StaticPools};
use compac_miner::device::DeviceRegistry;
use compac_miner::usb::descriptor::UsbSelector;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

async fn start(allow: Option<&str>) -> (Arc<CoreContext>, SocketAddr, JoinHandle<()>) {
    TIMESTAMP.enable(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("ephemeral bind");
    let addr = listener.local_addr().expect("local addr");

    let access = AccessControl::from_options(allow, None, false).expect("access options");
    let ctx = Arc::new(CoreContext {
        registry: Arc::new(DeviceRegistry::new(UsbSelector::default())),
        pools: Arc::new(StaticPools::new(vec![PoolSnapshot {
            idx: 0,
            url: "stratum+tcp://pool.example:3333".into(),
            user: "worker.1".into(),
            alive: true,
            enabled: true,
            priority: 0,
            quota: 1,
            getworks: 0,
            accepted: 0,
            rejected: 0,
            stale: 0,
            stratum_active: true,
            has_vmask: false,
        }])),
        options: ApiOptions {
            listen: true,
            port: addr.port(),
            description: "test-rig".into(),
            ..ApiOptions::default()
        },
        access,
        started: Instant::now(),
        shutdown: CancellationToken::new(),
        restart_requested: AtomicBool::new(false),
        hotplug_secs: Arc::new(AtomicU32::new(5)),
        debug_enabled: AtomicBool::new(false),
        lockgets_compat: false,
    });

    let task = tokio::spawn(server::run(Arc::clone(&ctx), listener));
    (ctx, addr, task)
}

async fn roundtrip(addr: SocketAddr, request: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("send request");
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.expect("read reply");
    reply
}

#[tokio::test]
async fn text_replies_are_nul_and_newline_terminated() {
    let (_ctx, addr, _task) = start(None).await;

    let reply = roundtrip(addr, "version\n").await;
    assert_eq!(reply.last(), Some(&0u8), "reply ends with NUL");
    assert_eq!(reply[reply.len() - 2], b'\n', "text reply has newline before NUL");

    let text = std::str::from_utf8(&reply[..reply.len() - 2]).expect("utf8");
    assert!(text.starts_with("STATUS=S,When=0,Code=22,"), "{text}");
    assert!(text.contains("|VERSION="));
    assert!(text.contains("API=3.7"));
}

#[tokio::test]
async fn json_replies_parse_with_one_status() {
    let (_ctx, addr, _task) = start(None).await;

    let reply = roundtrip(addr, "{\"command\":\"summary\"}\n").await;
    let text = std::str::from_utf8(&reply[..reply.len() - 1]).expect("utf8");
    let json: serde_json::Value = serde_json::from_str(text).expect("valid JSON");
    assert_eq!(json["STATUS"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["STATUS"][0]["Description"], "test-rig");
    assert!(json.get("SUMMARY").is_some());
    assert_eq!(json["id"], 1);
}

#[tokio::test]
async fn readonly_caller_cannot_quit() {
    let (ctx, addr, _task) = start(Some("R:127.0.0.1")).await;

    let reply = roundtrip(addr, "quit\n").await;
    let text = std::str::from_utf8(&reply[..reply.len() - 2]).expect("utf8");
    assert!(text.starts_with("STATUS=E,"), "{text}");
    assert!(text.contains("Code=45"));
    assert!(text.contains("Access denied to 'quit' command"));
    assert!(
        !ctx.shutdown.is_cancelled(),
        "denied quit must not stop the miner"
    );

    // the same caller can still read
    let reply = roundtrip(addr, "summary\n").await;
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("STATUS=S,"));
}

#[tokio::test]
async fn privileged_quit_says_bye_and_stops_the_listener() {
    let (ctx, addr, task) = start(None).await;

    let reply = roundtrip(addr, "quit\n").await;
    assert_eq!(&reply, b"BYE\n\0");
    assert!(ctx.shutdown.is_cancelled());

    // the accept loop must wind down on its own
    tokio::time::timeout(std::time::Duration::from_secs(2), task)
        .await
        .expect("listener exits after quit")
        .expect("listener task completes");
    assert!(!ctx.restart_requested.load(Ordering::Relaxed));
}

#[tokio::test]
async fn restart_flags_the_relaunch() {
    let (ctx, addr, task) = start(None).await;

    let reply = roundtrip(addr, "{\"command\":\"restart\"}\n").await;
    assert_eq!(&reply, b"{\"RESTART\":1}\0");
    assert!(ctx.restart_requested.load(Ordering::Relaxed));
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), task).await;
}

#[tokio::test]
async fn joined_text_commands_share_one_reply() {
    let (_ctx, addr, _task) = start(None).await;

    let reply = roundtrip(addr, "summary+pools\n").await;
    let text = String::from_utf8_lossy(&reply[..reply.len() - 2]);
    assert!(text.contains("SUMMARY="));
    assert!(text.contains("POOLS="));
    assert!(text.contains("stratum+tcp://pool.example:3333"));
}

#[tokio::test]
async fn invalid_command_suppresses_the_banner() {
    let (_ctx, addr, _task) = start(None).await;

    let reply = roundtrip(addr, "wat\n").await;
    let text = String::from_utf8_lossy(&reply);
    assert!(text.contains("Code=14"));
    assert!(!text.contains("test-rig"));
}
