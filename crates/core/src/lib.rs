// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! # tagbus-core
//!
//! The native protocol engine of `tagbus`: wire codecs for EtherNet/IP
//! encapsulation, CIP messaging, PCCC logical addressing and Modbus TCP,
//! plus the session layer, the per-tag state machines and the background
//! I/O scheduler that drives them.
//!
//! Most users want the [`RawTag`] handle:
//!
//! ```rust,ignore
//! use tagbus_core::RawTag;
//!
//! let attrs = "protocol=ab-eip&gateway=192.168.1.120&path=1,0&plc=controllogix&name=MyDint&elem_count=1";
//! let tag = RawTag::new(attrs, 1000)?;
//! tag.read(1000).into_result()?;
//! let value: i32 = tag.get_value(0)?;
//! ```

#![warn(missing_docs)]

#[macro_use]
extern crate log;

pub mod attr;
pub mod builder;
pub mod cip;
mod debug;
pub mod eip;
pub mod event;
pub mod modbus;
pub mod order;
pub mod pccc;
mod scheduler;
mod session;
pub mod slice;
mod status;
mod tag;
pub mod udt;
mod value;

/// tagbus result
pub type Result<T> = std::result::Result<T, Status>;

pub use debug::{get_debug_level, set_debug_level, DebugLevel};
pub use status::{ErrorKind, Status};
pub use tag::{RawTag, TagId, VERSION};
pub use value::{Decode, Encode};

/// the library version as (major, minor, patch)
#[inline]
pub fn lib_version() -> (u32, u32, u32) {
    VERSION
}

/// check that the library is at least the requested version
pub fn check_lib_version(major: u32, minor: u32, patch: u32) -> Status {
    if (major, minor, patch) <= VERSION {
        Status::Ok
    } else {
        Status::Err(ErrorKind::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lib_version() {
        assert_eq!(lib_version(), VERSION);
        assert!(check_lib_version(VERSION.0, VERSION.1, VERSION.2).is_ok());
        assert!(check_lib_version(999, 0, 0).is_err());
    }
}
