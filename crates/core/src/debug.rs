// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

use std::sync::atomic::{AtomicU8, Ordering};

/// provides debugging output when enabled
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum DebugLevel {
    /// 0 - disables debugging output
    None,
    /// 1 - only output errors. Generally these are fatal to the functioning of the library
    Error,
    /// 2 - outputs warnings such as error found when checking a malformed tag attribute string or when unexpected problems are reported from the PLC
    Warn,
    /// 3 - outputs diagnostic information about the internal calls within the library. Includes some packet dumps
    Info,
    /// 4 - outputs detailed diagnostic information about the code executing within the library including packet dumps
    Detail,
    /// 5 - outputs extremely detailed information. Do not use this unless you are trying to debug detailed information about every mutex lock and release. Will output many lines of output per millisecond. You have been warned!
    Spew,
}

impl From<u8> for DebugLevel {
    #[inline]
    fn from(val: u8) -> DebugLevel {
        match val {
            1 => DebugLevel::Error,
            2 => DebugLevel::Warn,
            3 => DebugLevel::Info,
            4 => DebugLevel::Detail,
            5 => DebugLevel::Spew,
            _ => DebugLevel::None,
        }
    }
}

static DEBUG_LEVEL: AtomicU8 = AtomicU8::new(0);

/// set the library debug level and raise the `log` max level to match.
///
/// Messages route through the `log` crate facade, so any logger
/// implementation picks them up.
pub fn set_debug_level(debug: DebugLevel) {
    DEBUG_LEVEL.store(debug as u8, Ordering::Relaxed);
    let filter = match debug {
        DebugLevel::None => log::LevelFilter::Off,
        DebugLevel::Error => log::LevelFilter::Error,
        DebugLevel::Warn => log::LevelFilter::Warn,
        DebugLevel::Info => log::LevelFilter::Info,
        DebugLevel::Detail => log::LevelFilter::Debug,
        DebugLevel::Spew => log::LevelFilter::Trace,
    };
    log::set_max_level(filter);
}

/// retrieve debug level
#[inline(always)]
pub fn get_debug_level() -> DebugLevel {
    DEBUG_LEVEL.load(Ordering::Relaxed).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_u8() {
        assert_eq!(DebugLevel::from(0), DebugLevel::None);
        assert_eq!(DebugLevel::from(4), DebugLevel::Detail);
        assert_eq!(DebugLevel::from(9), DebugLevel::None);
    }

    #[test]
    fn test_set_and_get() {
        set_debug_level(DebugLevel::Info);
        assert_eq!(get_debug_level(), DebugLevel::Info);
        assert_eq!(log::max_level(), log::LevelFilter::Info);

        set_debug_level(DebugLevel::Detail);
        assert_eq!(log::max_level(), log::LevelFilter::Debug);

        // lowering must take effect too, not just raising
        set_debug_level(DebugLevel::None);
        assert_eq!(get_debug_level(), DebugLevel::None);
        assert_eq!(log::max_level(), log::LevelFilter::Off);
    }
}
