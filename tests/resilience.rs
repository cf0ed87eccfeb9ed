// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! auto-sync cadence, outage recovery and the pre-write read path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tagbus::event::Event;
use tagbus::RawTag;
use tagbus_server::{start_ab, AbServerConfig, PlcState, ServerHandle, ServerTag};

/// allowed deviation of the auto-sync event count, per 20 expected events
const AUTO_SYNC_TOLERANCE: usize = 3;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn logix_config(bind: Option<SocketAddr>, tags: Vec<&str>) -> AbServerConfig {
    let mut config = AbServerConfig {
        tags: tags.into_iter().map(|t| ServerTag::parse(t).unwrap()).collect(),
        ..Default::default()
    };
    if let Some(bind) = bind {
        config.bind = bind;
    }
    config
}

fn attrs(addr: SocketAddr, rest: &str) -> String {
    format!("protocol=ab-eip&gateway={addr}&path=1,0&plc=controllogix&{rest}")
}

/// rebind on a just-freed port; lingering sockets can hold it briefly
fn restart(addr: SocketAddr, tags: Vec<&str>) -> ServerHandle<PlcState> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match start_ab(logix_config(Some(addr), tags.clone())) {
            Ok(server) => return server,
            Err(e) if Instant::now() < deadline => {
                log::debug!("rebind of {addr} failed ({e}), retrying");
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => panic!("could not rebind {addr}: {e}"),
        }
    }
}

#[test]
fn test_auto_sync_read_cadence() {
    init_logs();
    let server = start_ab(logix_config(None, vec!["Cyclic:DINT[1]"])).unwrap();
    let tag = RawTag::new(
        attrs(server.addr, "name=Cyclic&auto_sync_read_ms=50"),
        2000,
    )
    .unwrap();

    let reads = Arc::new(AtomicUsize::new(0));
    let reads2 = Arc::clone(&reads);
    let _listener = tag.listen(move |_, event, _| {
        if event == Event::ReadStarted {
            reads2.fetch_add(1, Ordering::SeqCst);
        }
    });

    let window = Duration::from_millis(1000);
    std::thread::sleep(window);
    let count = reads.load(Ordering::SeqCst);

    // 1000ms / 50ms = 20 expected; each cycle also spends the round-trip
    // time, so undershoot is normal and bounded by the tolerance
    let expected = (window.as_millis() / 50) as usize;
    assert!(
        count + AUTO_SYNC_TOLERANCE * 2 >= expected && count <= expected + AUTO_SYNC_TOLERANCE,
        "auto-sync fired {count} reads, expected about {expected}"
    );
}

#[test]
fn test_auto_sync_suppressed_while_pending() {
    init_logs();
    // a 200ms server delay makes each read slower than the sync period;
    // cycles must not stack up behind each other
    let server = start_ab(AbServerConfig {
        response_delay_ms: 200,
        ..logix_config(None, vec!["Slow:DINT[1]"])
    })
    .unwrap();
    let tag = RawTag::new(
        attrs(server.addr, "name=Slow&auto_sync_read_ms=50"),
        5000,
    )
    .unwrap();

    let reads = Arc::new(AtomicUsize::new(0));
    let reads2 = Arc::clone(&reads);
    let _listener = tag.listen(move |_, event, _| {
        if event == Event::ReadStarted {
            reads2.fetch_add(1, Ordering::SeqCst);
        }
    });

    std::thread::sleep(Duration::from_millis(1000));
    let count = reads.load(Ordering::SeqCst);
    // at ~200ms per cycle only ~4-5 fit; 20 would mean queue buildup
    assert!(count <= 8, "auto-sync stacked up: {count} reads in 1s");
}

#[test]
fn test_outage_and_reconnect() {
    init_logs();
    let server = start_ab(logix_config(None, vec!["Persistent:DINT[2]"])).unwrap();
    let addr = server.addr;
    let tag = RawTag::new(attrs(addr, "elem_count=2&name=Persistent"), 2000).unwrap();
    assert!(tag.read(2000).is_ok());

    // kill the server; the next read must fail, not hang
    drop(server);
    std::thread::sleep(Duration::from_millis(100));
    let status = tag.read(2000);
    assert!(status.is_err(), "read against a dead server returned {status}");

    // bring it back on the same port; the session reconnects on its own
    // within the backoff ceiling and reads resume without user action
    let _server = restart(addr, vec!["Persistent:DINT[2]"]);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = tag.read(2000);
        if status.is_ok() {
            break;
        }
        if Instant::now() >= deadline {
            panic!("client did not recover, last status {status}");
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    assert_eq!(tag.get_u32(4).unwrap(), 1);
}

#[test]
fn test_write_after_failed_discovery_pre_reads() {
    init_logs();
    // reserve a port, then shut the server down before the tag connects
    let server = start_ab(logix_config(None, vec!["Late:INT[2]"])).unwrap();
    let addr = server.addr;
    drop(server);

    // elem_size sizes the local buffer up front, since the discovery
    // read cannot
    let tag = RawTag::new(attrs(addr, "elem_count=2&elem_size=2&name=Late"), 0).unwrap();
    // the discovery read fails while the endpoint is down
    let status = tag.wait(Some(Duration::from_secs(8)));
    assert!(status.is_err(), "discovery against a dead server: {status}");

    let _server = restart(addr, vec!["Late:INT[2]"]);

    // first user operation is a write: the tag has no type yet, so it
    // must pre-read to discover INT before the write goes out
    tag.set_u16(0, 0x2A2A).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = tag.write(2000);
        if status.is_ok() {
            break;
        }
        if Instant::now() >= deadline {
            panic!("write did not recover, last status {status}");
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    let mut raw = [0u8; 2];
    _server.state.tag("Late").unwrap().peek(0, &mut raw);
    assert_eq!(u16::from_le_bytes(raw), 0x2A2A);
}
