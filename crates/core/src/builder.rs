// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! builders for tag attribute strings

pub use crate::attr::{PlcKind, Protocol};
pub use crate::debug::DebugLevel;
use core::fmt;

type Result<T> = std::result::Result<T, Error>;

/// attribute builder error
#[derive(Debug)]
pub struct Error(&'static str);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Error {}

/// builder for a tag attribute string
///
/// # Examples
/// ```rust,no_run
/// use tagbus_core::builder::*;
/// use tagbus_core::RawTag;
///
/// let timeout = 100;
/// let attrs = PathBuilder::default()
///     .protocol(Protocol::Eip)
///     .gateway("192.168.1.120")
///     .plc(PlcKind::ControlLogix)
///     .name("MyTag1")
///     .element_count(1)
///     .path("1,0")
///     .read_cache_ms(0)
///     .build()
///     .unwrap();
/// let tag = RawTag::new(attrs, timeout).unwrap();
/// let status = tag.status();
/// assert!(status.is_ok());
/// ```
#[derive(Default, Debug)]
pub struct PathBuilder {
    protocol: Option<Protocol>,
    debug: Option<DebugLevel>,
    elem_count: Option<usize>,
    elem_size: Option<usize>,
    elem_type: Option<u16>,
    read_cache_ms: Option<usize>,
    plc: Option<PlcKind>,
    name: Option<String>,
    path: Option<String>,
    gateway: Option<String>,
    use_connected_msg: Option<bool>,
    allow_packing: Option<bool>,
    connection_group_id: Option<u32>,
    auto_sync_read_ms: Option<u32>,
    auto_sync_write_ms: Option<u32>,
}

impl PathBuilder {
    /// generic attribute.
    /// defining the current debugging level.
    #[inline]
    pub fn debug(&mut self, level: DebugLevel) -> &mut Self {
        self.debug = Some(level);
        self
    }

    /// generic attribute.
    /// Required. Determines the type of the PLC protocol.
    #[inline]
    pub fn protocol(&mut self, protocol: Protocol) -> &mut Self {
        self.protocol = Some(protocol);
        self
    }

    /// generic attribute.
    /// Optional. All tags are treated as arrays; this determines how many
    /// elements are in the tag. Defaults to one (1).
    #[inline]
    pub fn element_count(&mut self, count: usize) -> &mut Self {
        self.elem_count = Some(count);
        self
    }

    /// generic attribute.
    /// Optional override of a single element's size in bytes. Ignored for
    /// Modbus and for ControlLogix-class PLCs, which discover it.
    #[inline]
    pub fn element_size(&mut self, size: usize) -> &mut Self {
        self.elem_size = Some(size);
        self
    }

    /// EIP only. Optional override of the CIP element type code.
    #[inline]
    pub fn element_type(&mut self, type_code: u16) -> &mut Self {
        self.elem_type = Some(type_code);
        self
    }

    /// generic attribute.
    /// Optional. An integer number of milliseconds to cache read data;
    /// reads within the window are served from the local buffer.
    #[inline]
    pub fn read_cache_ms(&mut self, millis: usize) -> &mut Self {
        self.read_cache_ms = Some(millis);
        self
    }

    /// Required for EIP. Determines the type of the PLC.
    #[inline]
    pub fn plc(&mut self, plc: PlcKind) -> &mut Self {
        self.plc = Some(plc);
        self
    }

    /// - EIP: IP address or host name of the PLC or the gateway to it.
    /// - Modbus: required IP address or host name with optional port,
    ///   e.g. `gateway=10.1.2.3:502`.
    #[inline]
    pub fn gateway(&mut self, gateway: impl AsRef<str>) -> &mut Self {
        self.gateway = Some(gateway.as_ref().to_owned());
        self
    }

    /// - EIP: the full tag name, a PCCC logical address, or a special
    ///   name (`@tags`, `@udt/<id>`).
    /// - Modbus: register type prefix and first register number, e.g.
    ///   `co42` for coil 42. Prefixes: `co` coil, `di` discrete input,
    ///   `hr` holding register, `ir` input register.
    ///
    /// you might want to use `register()` instead of `name()` for Modbus
    #[inline]
    pub fn name(&mut self, name: impl AsRef<str>) -> &mut Self {
        self.name = Some(name.as_ref().to_owned());
        self
    }

    /// set register for Modbus
    pub fn register(&mut self, reg: Register) -> &mut Self {
        self.name = Some(format!("{reg}"));
        self
    }

    /// - EIP: CIP route to the PLC CPU, e.g. `1,0`. Required for
    ///   ControlLogix/CompactLogix; must not be set for Micro800-class.
    /// - Modbus: required unit id, an integer in [0-255].
    #[inline]
    pub fn path(&mut self, path: impl AsRef<str>) -> &mut Self {
        self.path = Some(path.as_ref().to_owned());
        self
    }

    /// EIP only.
    /// Optional: 1 = use a CIP connection, 0 = use unconnected messaging.
    /// The default is PLC-specific.
    #[inline]
    pub fn use_connected_msg(&mut self, yes: bool) -> &mut Self {
        self.use_connected_msg = Some(yes);
        self
    }

    /// EIP only.
    /// Optional: opt out of Multiple Service Packet grouping.
    #[inline]
    pub fn allow_packing(&mut self, yes: bool) -> &mut Self {
        self.allow_packing = Some(yes);
        self
    }

    /// Optional. Tags sharing a group id share one connection.
    #[inline]
    pub fn connection_group_id(&mut self, id: u32) -> &mut Self {
        self.connection_group_id = Some(id);
        self
    }

    /// Optional. Background read period in milliseconds (0 = off).
    #[inline]
    pub fn auto_sync_read_ms(&mut self, millis: u32) -> &mut Self {
        self.auto_sync_read_ms = Some(millis);
        self
    }

    /// Optional. Background write flush period in milliseconds (0 = off).
    #[inline]
    pub fn auto_sync_write_ms(&mut self, millis: u32) -> &mut Self {
        self.auto_sync_write_ms = Some(millis);
        self
    }

    /// check required attributes or conflicting attributes
    fn check(&self) -> Result<()> {
        let protocol = self.protocol.ok_or(Error("protocol required"))?;
        match protocol {
            Protocol::Eip => {
                let plc = self.plc.ok_or(Error("plc kind required"))?;
                match plc {
                    PlcKind::ControlLogix | PlcKind::CompactLogix => {
                        if self.path.is_none() {
                            return Err(Error("path required for (compact)logix"));
                        }
                    }
                    PlcKind::MicroLogix800 => {
                        if self.path.is_some() {
                            return Err(Error("path must not be provided for micrologix800"));
                        }
                    }
                    _ => {}
                }
                if self.gateway.is_none() {
                    return Err(Error("gateway required"));
                }
            }
            Protocol::Modbus => {
                if self.gateway.is_none() {
                    return Err(Error("gateway required"));
                }
                if self.name.is_none() {
                    return Err(Error("name required"));
                }
                match self.path {
                    Some(ref path) => {
                        let _: u8 = path
                            .parse()
                            .or(Err(Error("path is a number in range [0-255]")))?;
                    }
                    None => return Err(Error("path required")),
                }
            }
        }
        if self.name.is_none() {
            return Err(Error("name required"));
        }
        Ok(())
    }

    /// build the attribute string
    pub fn build(&self) -> Result<String> {
        self.check()?;
        let mut buf = vec![];
        let protocol = self.protocol.unwrap();
        buf.push(format!("protocol={protocol}"));

        if protocol == Protocol::Eip {
            if let Some(plc) = self.plc {
                buf.push(format!("plc={plc}"));
            }
            if let Some(yes) = self.use_connected_msg {
                buf.push(format!("use_connected_msg={}", yes as u8));
            }
            if let Some(yes) = self.allow_packing {
                buf.push(format!("allow_packing={}", yes as u8));
            }
            if let Some(elem_type) = self.elem_type {
                buf.push(format!("elem_type={elem_type}"));
            }
        }

        if let Some(ref gateway) = self.gateway {
            buf.push(format!("gateway={gateway}"));
        }
        if let Some(ref path) = self.path {
            buf.push(format!("path={path}"));
        }
        if let Some(ref name) = self.name {
            buf.push(format!("name={name}"));
        }
        if let Some(elem_count) = self.elem_count {
            buf.push(format!("elem_count={elem_count}"));
        }
        if let Some(elem_size) = self.elem_size {
            buf.push(format!("elem_size={elem_size}"));
        }
        if let Some(read_cache_ms) = self.read_cache_ms {
            buf.push(format!("read_cache_ms={read_cache_ms}"));
        }
        if let Some(id) = self.connection_group_id {
            buf.push(format!("connection_group_id={id}"));
        }
        if let Some(ms) = self.auto_sync_read_ms {
            buf.push(format!("auto_sync_read_ms={ms}"));
        }
        if let Some(ms) = self.auto_sync_write_ms {
            buf.push(format!("auto_sync_write_ms={ms}"));
        }
        if let Some(debug) = self.debug {
            buf.push(format!("debug={}", debug as u8));
        }
        Ok(buf.join("&"))
    }
}

/// modbus supported registers
pub enum Register {
    /// coil registers
    Coil(u16),
    /// discrete inputs
    Discrete(u16),
    /// holding registers
    Holding(u16),
    /// input registers
    Input(u16),
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::Coil(v) => write!(f, "co{v}"),
            Register::Discrete(v) => write!(f, "di{v}"),
            Register::Holding(v) => write!(f, "hr{v}"),
            Register::Input(v) => write!(f, "ir{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eip_builder() {
        let attrs = PathBuilder::default()
            .protocol(Protocol::Eip)
            .gateway("192.168.1.120")
            .plc(PlcKind::ControlLogix)
            .name("MyTag1")
            .element_count(1)
            .path("1,0")
            .read_cache_ms(0)
            .build()
            .unwrap();
        assert_eq!(
            attrs,
            "protocol=ab-eip&plc=controllogix&gateway=192.168.1.120&path=1,0&name=MyTag1&elem_count=1&read_cache_ms=0"
        );
    }

    #[test]
    fn test_modbus_builder() {
        let attrs = PathBuilder::default()
            .protocol(Protocol::Modbus)
            .gateway("192.168.1.120:502")
            .path("0")
            .register(Register::Coil(42))
            .element_count(1)
            .build()
            .unwrap();
        assert_eq!(
            attrs,
            "protocol=modbus-tcp&gateway=192.168.1.120:502&path=0&name=co42&elem_count=1"
        );
    }

    #[test]
    fn test_auto_sync_and_group_keys() {
        let attrs = PathBuilder::default()
            .protocol(Protocol::Eip)
            .gateway("10.0.0.1")
            .plc(PlcKind::OmronNjnx)
            .name("Speed")
            .connection_group_id(3)
            .auto_sync_read_ms(200)
            .build()
            .unwrap();
        assert_eq!(
            attrs,
            "protocol=ab-eip&plc=omron-njnx&gateway=10.0.0.1&name=Speed&connection_group_id=3&auto_sync_read_ms=200"
        );
    }

    #[test]
    fn test_builder_checks() {
        assert!(PathBuilder::default().build().is_err());
        // micrologix800 must not carry a path
        let err = PathBuilder::default()
            .protocol(Protocol::Eip)
            .gateway("10.0.0.1")
            .plc(PlcKind::MicroLogix800)
            .path("1,0")
            .name("T")
            .build();
        assert!(err.is_err());
    }
}
