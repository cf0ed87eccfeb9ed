// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

#![doc = include_str!("../README.md")]

#[doc(inline)]
pub use tagbus_core::*;
