//! UDP multicast discovery responder.
//!
//! Fleet managers broadcast `cgminer-<code>-<reply_port>` to the group;
//! every miner that recognizes the code answers
//! `cgm-<code>-<api_port>-<description>` straight back to the sender at
//! the port it named. Anything else is dropped.

use super::CoreContext;
use crate::error::ApiError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Build the reply for one received datagram, or `None` to drop it.
///
/// `payload` is the raw datagram; a single trailing newline is tolerated.
/// Returns the reply port and bytes (NUL terminated, as the managers
/// expect).
pub fn handle_packet(
    code: &str,
    api_port: u16,
    description: &str,
    payload: &[u8],
) -> Option<(u16, Vec<u8>)> {
    let text = std::str::from_utf8(payload).ok()?;
    let text = text.strip_suffix('\n').unwrap_or(text);

    let expect = format!("cgminer-{code}-");
    let port_str = text.strip_prefix(expect.as_str())?;
    let reply_port: u32 = port_str.parse().ok()?;
    if reply_port < 1 || reply_port > 65535 {
        return None;
    }

    let mut reply = format!("cgm-{code}-{api_port}-{description}").into_bytes();
    reply.push(0);
    Some((reply_port as u16, reply))
}

/// Join the group and answer probes until cancelled.
pub async fn run(ctx: Arc<CoreContext>) -> Result<(), ApiError> {
    let group: IpAddr = ctx
        .options
        .mcast_addr
        .parse()
        .map_err(|_| ApiError::InvalidMcastAddr(ctx.options.mcast_addr.clone()))?;

    let socket = UdpSocket::bind(("0.0.0.0", ctx.options.mcast_port)).await?;
    match group {
        IpAddr::V4(v4) => socket.join_multicast_v4(v4, Ipv4Addr::UNSPECIFIED)?,
        IpAddr::V6(v6) => socket.join_multicast_v6(&v6, 0)?,
    }
    info!(
        "API multicast listening on {}:{}",
        ctx.options.mcast_addr, ctx.options.mcast_port
    );

    let mut buf = [0u8; 1024];
    loop {
        let (len, from) = tokio::select! {
            r = socket.recv_from(&mut buf) => match r {
                Ok(ok) => ok,
                Err(e) => {
                    debug!("mcast receive failed: {e}");
                    continue;
                }
            },
            _ = ctx.shutdown.cancelled() => break,
        };

        // same allow-list as the TCP listener
        if super::server::check_connect(&ctx.access, from.ip()).is_none() {
            debug!("mcast from {from} ignored");
            continue;
        }

        let Some((reply_port, reply)) = handle_packet(
            &ctx.options.mcast_code,
            ctx.options.port,
            &ctx.options.mcast_des,
            &buf[..len],
        ) else {
            debug!("mcast request from {from} was no good");
            continue;
        };

        let dest = SocketAddr::new(from.ip(), reply_port);
        match socket.send_to(&reply, dest).await {
            Ok(_) => debug!("mcast reply sent to {dest}"),
            Err(e) => warn!("mcast reply to {dest} failed: {e}"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_gets_directed_reply() {
        let (port, reply) =
            handle_packet("FTW", 4028, "lab-rig-1", b"cgminer-FTW-4029\n").expect("valid probe");
        assert_eq!(port, 4029);
        assert_eq!(reply, b"cgm-FTW-4028-lab-rig-1\0");
    }

    #[test]
    fn trailing_newline_is_optional() {
        assert!(handle_packet("FTW", 4028, "x", b"cgminer-FTW-4029").is_some());
    }

    #[test]
    fn wrong_code_is_dropped() {
        assert!(handle_packet("FTW", 4028, "x", b"cgminer-LOL-4029\n").is_none());
    }

    #[test]
    fn malformed_packets_are_dropped() {
        assert!(handle_packet("FTW", 4028, "x", b"hello").is_none());
        assert!(handle_packet("FTW", 4028, "x", b"cgminer-FTW-").is_none());
        assert!(handle_packet("FTW", 4028, "x", b"cgminer-FTW-notaport").is_none());
        assert!(handle_packet("FTW", 4028, "x", &[0xff, 0xfe]).is_none());
    }

    #[test]
    fn out_of_range_ports_are_dropped() {
        assert!(handle_packet("FTW", 4028, "x", b"cgminer-FTW-0").is_none());
        assert!(handle_packet("FTW", 4028, "x", b"cgminer-FTW-70000").is_none());
    }
}
