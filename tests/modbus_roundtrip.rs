// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! client-vs-server round trips over Modbus TCP.

use tagbus::{ErrorKind, RawTag, Status};
use tagbus_server::{start_modbus, ModbusServerConfig};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_server() -> tagbus_server::ServerHandle<tagbus_server::RegisterFile> {
    start_modbus(ModbusServerConfig {
        coils: 8000,
        discretes: 8000,
        holding: 2000,
        inputs: 2000,
        ..Default::default()
    })
    .unwrap()
}

fn attrs(addr: std::net::SocketAddr, rest: &str) -> String {
    format!("protocol=modbus-tcp&gateway={addr}&path=1&{rest}")
}

#[test]
fn test_read_holding_registers() {
    init_logs();
    let server = small_server();
    let tag = RawTag::new(attrs(server.addr, "name=hr0&elem_count=10"), 2000).unwrap();

    assert!(tag.read(2000).is_ok());
    assert_eq!(tag.size().unwrap(), 20);
    // the register file holds i at address i
    for i in 0..10u32 {
        assert_eq!(tag.get_u16(i * 2).unwrap(), i as u16);
    }
}

#[test]
fn test_write_holding_registers() {
    init_logs();
    let server = small_server();
    let tag = RawTag::new(attrs(server.addr, "name=hr100&elem_count=4"), 2000).unwrap();

    for i in 0..4u32 {
        tag.set_u16(i * 2, 0x4400 + i as u16).unwrap();
    }
    assert!(tag.write(2000).is_ok());
    assert_eq!(server.state.holding(100), 0x4400);
    assert_eq!(server.state.holding(103), 0x4403);
}

#[test]
fn test_single_register_and_coil() {
    init_logs();
    let server = small_server();

    let reg = RawTag::new(attrs(server.addr, "name=hr42"), 2000).unwrap();
    reg.set_u16(0, 0xBEEF).unwrap();
    assert!(reg.write(2000).is_ok());
    assert_eq!(server.state.holding(42), 0xBEEF);

    let coil = RawTag::new(attrs(server.addr, "name=co7"), 2000).unwrap();
    coil.set_bit(0, true).unwrap();
    assert!(coil.write(2000).is_ok());
    assert!(server.state.coil(7));

    coil.set_bit(0, false).unwrap();
    assert!(coil.write(2000).is_ok());
    assert!(!server.state.coil(7));
}

#[test]
fn test_coil_block_write_and_read() {
    init_logs();
    let server = small_server();
    let tag = RawTag::new(attrs(server.addr, "name=co100&elem_count=20"), 2000).unwrap();

    for i in 0..20 {
        tag.set_bit(i, i % 2 == 0).unwrap();
    }
    assert!(tag.write(2000).is_ok());
    assert!(server.state.coil(100));
    assert!(!server.state.coil(101));
    assert!(server.state.coil(118));

    // clear the local copy, read it back
    for i in 0..20 {
        tag.set_bit(i, false).unwrap();
    }
    assert!(tag.read(2000).is_ok());
    assert!(tag.get_bit(0).unwrap());
    assert!(!tag.get_bit(1).unwrap());
    assert!(tag.get_bit(18).unwrap());
}

#[test]
fn test_chunked_register_read() {
    init_logs();
    // 300 registers force three read requests under the 125 limit
    let server = small_server();
    let tag = RawTag::new(attrs(server.addr, "name=hr0&elem_count=300"), 5000).unwrap();

    assert!(tag.read(5000).is_ok());
    assert_eq!(tag.size().unwrap(), 600);
    for i in (0..300u32).step_by(37) {
        assert_eq!(tag.get_u16(i * 2).unwrap(), i as u16);
    }
}

#[test]
fn test_chunked_coil_read() {
    init_logs();
    // 4000 discrete inputs force two bit-read requests
    let server = small_server();
    let tag = RawTag::new(attrs(server.addr, "name=di0&elem_count=4000"), 5000).unwrap();

    assert!(tag.read(5000).is_ok());
    // every third input is set in the synthetic file
    assert!(tag.get_bit(0).unwrap());
    assert!(!tag.get_bit(1).unwrap());
    assert!(tag.get_bit(3999 / 3 * 3).unwrap());
}

#[test]
fn test_input_registers_are_read_only() {
    init_logs();
    let server = small_server();
    let tag = RawTag::new(attrs(server.addr, "name=ir5&elem_count=2"), 2000).unwrap();

    assert!(tag.read(2000).is_ok());
    assert_eq!(tag.get_u16(0).unwrap(), 1005);

    let status = tag.write(2000);
    assert_eq!(status, Status::Err(ErrorKind::NotAllowed));
}

#[test]
fn test_out_of_range_read_is_remote_error() {
    init_logs();
    let server = small_server();
    // holding file has 2000 registers; this read runs past the end
    let tag = RawTag::new(attrs(server.addr, "name=hr1990&elem_count=20"), 5000);
    match tag {
        Err(status) => assert_eq!(status, Status::Err(ErrorKind::RemoteErr)),
        Ok(tag) => {
            let status = tag.read(2000);
            assert_eq!(status, Status::Err(ErrorKind::RemoteErr));
        }
    }
}

#[test]
fn test_bad_register_name_fails_fast() {
    init_logs();
    let err = RawTag::new("protocol=modbus-tcp&gateway=127.0.0.1:1502&path=1&name=zz9", 100)
        .unwrap_err();
    assert_eq!(err, Status::Err(ErrorKind::BadParam));
}
