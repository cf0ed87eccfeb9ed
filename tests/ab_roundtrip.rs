// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! client-vs-server round trips over EtherNet/IP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tagbus::{ErrorKind, RawTag, Status};
use tagbus_server::{start_ab, AbServerConfig, ServerFile, ServerPlcKind, ServerTag};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn logix_config(tags: Vec<&str>) -> AbServerConfig {
    AbServerConfig {
        tags: tags.into_iter().map(|t| ServerTag::parse(t).unwrap()).collect(),
        files: vec![ServerFile::parse("N7:100").unwrap()],
        ..Default::default()
    }
}

fn attrs(addr: std::net::SocketAddr, rest: &str) -> String {
    format!("protocol=ab-eip&gateway={addr}&path=1,0&plc=controllogix&{rest}")
}

#[test]
fn test_single_read_dint_array() {
    init_logs();
    let server = start_ab(logix_config(vec!["TestBigArray:DINT[10]"])).unwrap();

    // non-blocking create goes pending first
    let tag = RawTag::new(attrs(server.addr, "elem_count=10&name=TestBigArray"), 0).unwrap();
    let status = tag.wait(Some(std::time::Duration::from_secs(5)));
    assert!(status.is_ok(), "create settled with {status}");

    let status = tag.read(2000);
    assert!(status.is_ok(), "read failed with {status}");
    assert_eq!(tag.size().unwrap(), 40);
    for i in 0..10u32 {
        assert_eq!(tag.get_u32(i * 4).unwrap(), i);
        assert_eq!(tag.get_i32(i * 4).unwrap(), i as i32);
    }
}

#[test]
fn test_write_then_read_back() {
    init_logs();
    let server = start_ab(logix_config(vec!["Setpoint:REAL[1]"])).unwrap();
    let tag = RawTag::new(attrs(server.addr, "name=Setpoint"), 2000).unwrap();

    tag.set_f32(0, 98.5).unwrap();
    assert!(tag.write(2000).is_ok());

    let served = server.state.tag("Setpoint").unwrap();
    let mut raw = [0u8; 4];
    served.peek(0, &mut raw);
    assert_eq!(f32::from_le_bytes(raw), 98.5);

    tag.set_f32(0, 0.0).unwrap();
    assert!(tag.read(2000).is_ok());
    assert_eq!(tag.get_f32(0).unwrap(), 98.5);
}

#[test]
fn test_forward_open_duplicate_retry() {
    init_logs();
    // the first two Forward Opens bounce as duplicate connections; the
    // client must close the stale id and succeed on the third try
    let config = AbServerConfig {
        reject_fo: 2,
        ..logix_config(vec!["Flag:INT[1]"])
    };
    let server = start_ab(config).unwrap();
    let tag = RawTag::new(attrs(server.addr, "name=Flag"), 5000).unwrap();
    assert!(tag.read(2000).is_ok());
}

#[test]
fn test_fragmented_read_and_write() {
    init_logs();
    // 2000 DINTs exceed even the extended 4002-byte packets, forcing
    // Read/Write Tag Fragmented in both directions
    let server = start_ab(logix_config(vec!["Big:DINT[2000]"])).unwrap();
    let tag = RawTag::new(attrs(server.addr, "elem_count=2000&name=Big"), 5000).unwrap();

    assert!(tag.read(5000).is_ok());
    assert_eq!(tag.size().unwrap(), 8000);
    for i in (0..2000u32).step_by(397) {
        assert_eq!(tag.get_u32(i * 4).unwrap(), i);
    }

    for i in 0..2000u32 {
        tag.set_u32(i * 4, 1_000_000 + i).unwrap();
    }
    assert!(tag.write(5000).is_ok());

    let served = server.state.tag("Big").unwrap();
    let mut raw = [0u8; 4];
    served.peek(1999 * 4, &mut raw);
    assert_eq!(u32::from_le_bytes(raw), 1_001_999);
}

#[test]
fn test_unconnected_messaging() {
    init_logs();
    let server = start_ab(logix_config(vec!["Speed:INT[4]"])).unwrap();
    let tag = RawTag::new(
        attrs(server.addr, "name=Speed&use_connected_msg=0"),
        2000,
    )
    .unwrap();
    assert!(tag.read(2000).is_ok());
    assert_eq!(tag.get_u16(2).unwrap(), 1);
}

#[test]
fn test_packed_reads_complete_in_order() {
    init_logs();
    let server = start_ab(logix_config(vec!["A:DINT[2]", "B:DINT[2]", "C:DINT[2]"])).unwrap();

    // created non-blocking so the initial reads queue together and pack
    let tags: Vec<RawTag> = ["A", "B", "C"]
        .iter()
        .map(|name| RawTag::new(attrs(server.addr, &format!("name={name}")), 0).unwrap())
        .collect();
    for tag in &tags {
        let status = tag.wait(Some(std::time::Duration::from_secs(5)));
        assert!(status.is_ok(), "initial read settled with {status}");
        assert_eq!(tag.get_u32(4).unwrap(), 1);
    }

    // steady-state reads across the shared session stay correct
    for tag in &tags {
        assert!(tag.read(2000).is_ok());
        assert_eq!(tag.get_u32(0).unwrap(), 0);
    }
}

#[test]
fn test_pccc_plc5_write_n7() {
    init_logs();
    let server = start_ab(AbServerConfig {
        kind: ServerPlcKind::Plc5,
        route: vec![1, 0],
        files: vec![ServerFile::parse("N7:100").unwrap()],
        ..Default::default()
    })
    .unwrap();

    let attrs = format!(
        "protocol=ab-eip&gateway={}&path=1,0&plc=plc5&name=N7:10",
        server.addr
    );
    let tag = RawTag::new(attrs, 2000).unwrap();
    tag.set_u16(0, 42).unwrap();
    assert!(tag.write(2000).is_ok());

    let mut raw = [0u8; 2];
    server
        .state
        .file(tagbus_core::pccc::FileType::Int, 7)
        .unwrap()
        .peek(20, &mut raw);
    assert_eq!(u16::from_le_bytes(raw), 42);

    assert!(tag.read(2000).is_ok());
    assert_eq!(tag.get_u16(0).unwrap(), 42);
}

#[test]
fn test_omron_rejects_oversized_tags() {
    init_logs();
    let server = start_ab(AbServerConfig {
        kind: ServerPlcKind::Omron,
        ..logix_config(vec!["Huge:DINT[2000]", "Ok:DINT[2]"])
    })
    .unwrap();

    let attrs = |rest: &str| {
        format!(
            "protocol=ab-eip&gateway={}&path=1,0&plc=omron-njnx&{rest}",
            server.addr
        )
    };
    // a single-packet tag works
    let tag = RawTag::new(attrs("elem_count=2&name=Ok"), 2000).unwrap();
    assert!(tag.read(2000).is_ok());

    // one that would need fragmentation must fail, not loop
    let err = RawTag::new(attrs("elem_count=2000&name=Huge"), 5000);
    match err {
        Err(status) => assert!(
            status == Status::Err(ErrorKind::TooLarge)
                || status == Status::Err(ErrorKind::RemoteErr),
            "unexpected status {status}"
        ),
        Ok(_) => panic!("oversized Omron tag should not create cleanly"),
    }
}

#[test]
fn test_abort_discards_reply() {
    init_logs();
    // slow server: the reply arrives well after the abort
    let server = start_ab(AbServerConfig {
        response_delay_ms: 300,
        ..logix_config(vec!["Slow:DINT[1]"])
    })
    .unwrap();

    let tag = RawTag::new(attrs(server.addr, "name=Slow"), 5000).unwrap();

    let aborted = Arc::new(AtomicUsize::new(0));
    let ok_after_abort = Arc::new(AtomicUsize::new(0));
    let aborted2 = Arc::clone(&aborted);
    let ok2 = Arc::clone(&ok_after_abort);
    let _listener = tag.listen(move |_, event, status| {
        use tagbus::event::Event;
        match event {
            Event::Aborted => {
                aborted2.fetch_add(1, Ordering::SeqCst);
            }
            Event::ReadCompleted if aborted2.load(Ordering::SeqCst) > 0 && status.is_ok() => {
                ok2.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    });

    assert!(tag.read(0).is_pending());
    std::thread::sleep(std::time::Duration::from_millis(50));
    tag.abort().unwrap();

    let status = tag.wait(Some(std::time::Duration::from_secs(2)));
    assert_eq!(status, Status::Err(ErrorKind::Abort));
    // give the delayed reply time to arrive and be discarded
    std::thread::sleep(std::time::Duration::from_millis(400));
    assert!(aborted.load(Ordering::SeqCst) >= 1);
    assert_eq!(ok_after_abort.load(Ordering::SeqCst), 0);
}

#[test]
fn test_tag_directory_and_template() {
    init_logs();
    let udt = tagbus_core::udt::UdtDef {
        id: 0x123,
        handle: 0x123,
        instance_size: 12,
        name: "Pos".into(),
        fields: vec![
            tagbus_core::udt::UdtField {
                name: "x".into(),
                type_code: tagbus_core::cip::TYPE_REAL,
                info: 0,
                offset: 0,
                size: 4,
            },
            tagbus_core::udt::UdtField {
                name: "y".into(),
                type_code: tagbus_core::cip::TYPE_REAL,
                info: 0,
                offset: 4,
                size: 4,
            },
        ],
    };
    let server = start_ab(AbServerConfig {
        udts: vec![udt],
        ..logix_config(vec!["First:DINT[4]", "Second:INT[2]"])
    })
    .unwrap();

    let dir = RawTag::new(attrs(server.addr, "name=@tags"), 2000).unwrap();
    let mut raw = vec![0u8; dir.size().unwrap() as usize];
    dir.get_bytes(0, &mut raw).unwrap();
    let entries = tagbus_core::udt::parse_tag_directory(&raw).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "First");
    assert_eq!(entries[1].name, "Second");

    let _template = RawTag::new(attrs(server.addr, "name=@udt/291"), 2000).unwrap();
    let cached = tagbus_core::udt::lookup(291).expect("template cached after read");
    assert_eq!(cached.name, "Pos");
    assert_eq!(cached.fields.len(), 2);
    assert_eq!(cached.fields[1].name, "y");
    assert_eq!(cached.fields[1].offset, 4);
}
