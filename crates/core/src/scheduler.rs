// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! the background I/O scheduler.
//!
//! One dedicated thread per process runs a current-thread tokio runtime;
//! every session task is spawned onto it, so all socket I/O, timer expiry
//! and queue-head mutation happen on a single thread. User threads only
//! enqueue commands over the session channels and block on completion
//! cells.

use crate::attr::{Protocol, TagOptions};
use crate::cip;
use crate::session::{EndpointConfig, SessionHandle, SessionRegistry};
use once_cell::sync::Lazy;
use std::thread;
use tokio::runtime;

struct IoThread {
    handle: runtime::Handle,
}

static IO: Lazy<IoThread> = Lazy::new(|| {
    let rt = runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("failed to build the tagbus I/O runtime");
    let handle = rt.handle().clone();
    thread::Builder::new()
        .name("tagbus-io".into())
        .spawn(move || {
            rt.block_on(std::future::pending::<()>());
        })
        .expect("failed to spawn the tagbus I/O thread");
    IoThread { handle }
});

static SESSIONS: Lazy<SessionRegistry> = Lazy::new(SessionRegistry::new);

/// resolve the session for a tag's endpoint identity, spawning its task
/// on the I/O thread if this endpoint is new
pub(crate) fn session_for(opts: &TagOptions) -> crate::Result<SessionHandle> {
    let (host, port) = opts.host_port()?;
    let route = match (opts.protocol, opts.path.as_deref()) {
        (Protocol::Eip, Some(path)) => cip::parse_route_path(path)?,
        _ => Vec::new(),
    };
    let config = EndpointConfig {
        protocol: opts.protocol,
        host,
        port,
        route,
        plc: opts.plc,
        use_connected: opts.connected(),
        unit_id: opts.unit_id(),
    };
    let key = opts.endpoint_key();
    Ok(SESSIONS.get_or_spawn(&key, config, |session| {
        IO.handle.spawn(session.run());
    }))
}

/// called by a session task as it winds down
pub(crate) fn remove_session(key: &str) {
    SESSIONS.remove(key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_share_by_endpoint_identity() {
        let a = TagOptions::parse(
            "protocol=ab-eip&gateway=127.0.0.1:1&path=1,0&plc=controllogix&name=A",
        )
        .unwrap();
        let b = TagOptions::parse(
            "protocol=ab-eip&gateway=127.0.0.1:1&path=1,0&plc=controllogix&name=B",
        )
        .unwrap();
        let ha = session_for(&a).unwrap();
        let hb = session_for(&b).unwrap();
        assert_eq!(ha.key, hb.key);

        let c = TagOptions::parse(
            "protocol=ab-eip&gateway=127.0.0.1:1&path=1,0&plc=controllogix&name=A&connection_group_id=7",
        )
        .unwrap();
        let hc = session_for(&c).unwrap();
        assert_ne!(ha.key, hc.key);
    }
}
