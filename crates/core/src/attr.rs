// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! attribute string parsing.
//!
//! Tags are configured with an ASCII string of `key=value` pairs joined by
//! `&`, e.g.
//! `protocol=ab-eip&gateway=127.0.0.1&path=1,0&plc=controllogix&name=MyTag`.
//! Parse failures are reported before any I/O starts: a malformed pair is
//! `ERR_BAD_PARAM`, a missing or inconsistent attribute is `ERR_BAD_CONFIG`.

use crate::debug::DebugLevel;
use crate::{ErrorKind, Status};
use std::fmt;
use std::str::FromStr;

/// library supported protocols
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Protocol {
    /// EtherNet/IP encapsulated CIP (Allen-Bradley, Omron)
    Eip,
    /// Modbus TCP
    Modbus,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Eip => write!(f, "ab-eip"),
            Protocol::Modbus => write!(f, "modbus-tcp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self, Status> {
        match s.to_ascii_lowercase().as_str() {
            "ab-eip" | "ab_eip" => Ok(Protocol::Eip),
            "modbus-tcp" | "mb-tcp" => Ok(Protocol::Modbus),
            _ => Err(ErrorKind::BadConfig.into()),
        }
    }
}

/// plc kind, required for the EIP protocol
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PlcKind {
    /// Control Logix-class PLC
    ControlLogix,
    /// CompactLogix-class PLC
    CompactLogix,
    /// PLC/5 PLC
    Plc5,
    /// SLC 500 PLC
    Slc500,
    /// MicroLogix PLC
    MicroLogix,
    /// Micro800-class PLC
    MicroLogix800,
    /// Control Logix-class PLC using the PLC/5 protocol
    LogixPccc,
    /// Omron NJ/NX series controller
    OmronNjnx,
}

impl PlcKind {
    /// does this kind speak PCCC rather than symbolic CIP?
    #[inline]
    pub fn is_pccc(&self) -> bool {
        matches!(
            self,
            PlcKind::Plc5 | PlcKind::Slc500 | PlcKind::MicroLogix | PlcKind::LogixPccc
        )
    }

    /// connected messaging default; overridable with `use_connected_msg`
    #[inline]
    pub fn default_connected(&self) -> bool {
        !self.is_pccc()
    }
}

impl fmt::Display for PlcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlcKind::ControlLogix => write!(f, "controllogix"),
            PlcKind::CompactLogix => write!(f, "compactlogix"),
            PlcKind::Plc5 => write!(f, "plc5"),
            PlcKind::Slc500 => write!(f, "slc"),
            PlcKind::MicroLogix => write!(f, "micrologix"),
            PlcKind::MicroLogix800 => write!(f, "micrologix800"),
            PlcKind::LogixPccc => write!(f, "lgxpccc"),
            PlcKind::OmronNjnx => write!(f, "omron-njnx"),
        }
    }
}

impl FromStr for PlcKind {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self, Status> {
        match s.to_ascii_lowercase().as_str() {
            "controllogix" | "contrologix" | "clgx" | "lgx" => Ok(PlcKind::ControlLogix),
            "compactlogix" | "clgx-pccc" => Ok(PlcKind::CompactLogix),
            "plc5" | "plc" => Ok(PlcKind::Plc5),
            "slc" | "slc500" => Ok(PlcKind::Slc500),
            "micrologix" | "mlgx" => Ok(PlcKind::MicroLogix),
            "micrologix800" | "micro800" | "mlgx800" => Ok(PlcKind::MicroLogix800),
            "lgxpccc" | "logixpccc" => Ok(PlcKind::LogixPccc),
            "omron-njnx" | "omron-nj" | "omron-nx" | "njnx" => Ok(PlcKind::OmronNjnx),
            _ => Err(ErrorKind::BadConfig.into()),
        }
    }
}

/// fully parsed tag attributes
#[derive(Debug, Clone)]
pub struct TagOptions {
    pub protocol: Protocol,
    pub gateway: String,
    pub path: Option<String>,
    pub plc: Option<PlcKind>,
    pub name: String,
    pub elem_count: usize,
    pub elem_size: Option<usize>,
    pub elem_type: Option<u16>,
    pub debug: Option<DebugLevel>,
    pub allow_packing: bool,
    pub use_connected_msg: Option<bool>,
    pub connection_group_id: u32,
    pub auto_sync_read_ms: u32,
    pub auto_sync_write_ms: u32,
    pub read_cache_ms: u32,
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> crate::Result<T> {
    value.parse().map_err(|_| {
        warn!("attribute {key}={value} is not a valid number");
        Status::from(ErrorKind::BadParam)
    })
}

fn parse_flag(key: &str, value: &str) -> crate::Result<bool> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => {
            warn!("attribute {key}={value} must be 0 or 1");
            Err(ErrorKind::BadParam.into())
        }
    }
}

impl TagOptions {
    /// parse an attribute string and validate the combination
    pub fn parse(attrs: &str) -> crate::Result<Self> {
        let mut protocol = None;
        let mut gateway = None;
        let mut path = None;
        let mut plc = None;
        let mut name = None;
        let mut elem_count = 1usize;
        let mut elem_size = None;
        let mut elem_type = None;
        let mut debug = None;
        let mut allow_packing = true;
        let mut use_connected_msg = None;
        let mut connection_group_id = 0u32;
        let mut auto_sync_read_ms = 0u32;
        let mut auto_sync_write_ms = 0u32;
        let mut read_cache_ms = 0u32;

        for pair in attrs.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                warn!("attribute pair {pair:?} is missing '='");
                Status::from(ErrorKind::BadParam)
            })?;
            match key {
                "protocol" => protocol = Some(value.parse()?),
                "gateway" => gateway = Some(value.to_owned()),
                "path" => path = Some(value.to_owned()),
                "cpu" | "plc" => plc = Some(value.parse()?),
                "name" => name = Some(value.to_owned()),
                "elem_count" => elem_count = parse_num(key, value)?,
                "elem_size" => elem_size = Some(parse_num(key, value)?),
                "elem_type" => elem_type = Some(parse_num(key, value)?),
                "debug" => debug = Some(DebugLevel::from(parse_num::<u8>(key, value)?)),
                "allow_packing" => allow_packing = parse_flag(key, value)?,
                "use_connected_msg" => use_connected_msg = Some(parse_flag(key, value)?),
                "connection_group_id" => connection_group_id = parse_num(key, value)?,
                "auto_sync_read_ms" => auto_sync_read_ms = parse_num(key, value)?,
                "auto_sync_write_ms" => auto_sync_write_ms = parse_num(key, value)?,
                "read_cache_ms" => read_cache_ms = parse_num(key, value)?,
                _ => {
                    // unknown keys are not fatal, but worth a warning
                    // while debugging attribute strings
                    warn!("ignoring unknown attribute {key:?}");
                }
            }
        }

        let protocol = protocol.ok_or_else(|| {
            warn!("protocol attribute required");
            Status::from(ErrorKind::BadConfig)
        })?;
        let gateway = gateway.ok_or_else(|| {
            warn!("gateway attribute required");
            Status::from(ErrorKind::BadConfig)
        })?;
        let name = name.ok_or_else(|| {
            warn!("name attribute required");
            Status::from(ErrorKind::BadConfig)
        })?;

        let opts = Self {
            protocol,
            gateway,
            path,
            plc,
            name,
            elem_count,
            elem_size,
            elem_type,
            debug,
            allow_packing,
            use_connected_msg,
            connection_group_id,
            auto_sync_read_ms,
            auto_sync_write_ms,
            read_cache_ms,
        };
        opts.validate()?;
        Ok(opts)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.elem_count == 0 {
            warn!("elem_count must be at least 1");
            return Err(ErrorKind::BadConfig.into());
        }
        match self.protocol {
            Protocol::Eip => {
                let plc = self.plc.ok_or_else(|| {
                    warn!("plc kind required for ab-eip");
                    Status::from(ErrorKind::BadConfig)
                })?;
                if matches!(plc, PlcKind::ControlLogix | PlcKind::CompactLogix)
                    && self.path.is_none()
                {
                    warn!("path required for {plc}");
                    return Err(ErrorKind::BadConfig.into());
                }
                if plc == PlcKind::MicroLogix800 && self.path.is_some() {
                    warn!("path must not be provided for micrologix800");
                    return Err(ErrorKind::BadConfig.into());
                }
            }
            Protocol::Modbus => {
                // path is the unit id
                match self.path {
                    Some(ref path) => {
                        let _: u8 = path.parse().map_err(|_| {
                            warn!("modbus path must be a unit id in [0-255]");
                            Status::from(ErrorKind::BadConfig)
                        })?;
                    }
                    None => {
                        warn!("path (unit id) required for modbus-tcp");
                        return Err(ErrorKind::BadConfig.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// host and port of the remote, with the protocol default port
    pub fn host_port(&self) -> crate::Result<(String, u16)> {
        let default_port = match self.protocol {
            Protocol::Eip => 44818,
            Protocol::Modbus => 502,
        };
        match self.gateway.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port: u16 = port.parse().map_err(|_| {
                    warn!("bad gateway port in {:?}", self.gateway);
                    Status::from(ErrorKind::BadGateway)
                })?;
                Ok((host.to_owned(), port))
            }
            Some(_) => {
                warn!("bad gateway {:?}", self.gateway);
                Err(ErrorKind::BadGateway.into())
            }
            None => Ok((self.gateway.clone(), default_port)),
        }
    }

    /// Modbus unit id from the path attribute
    pub fn unit_id(&self) -> u8 {
        self.path
            .as_deref()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    }

    /// connected vs unconnected CIP messaging for this tag
    pub fn connected(&self) -> bool {
        match self.use_connected_msg {
            Some(v) => v,
            None => self.plc.map(|p| p.default_connected()).unwrap_or(false),
        }
    }

    /// session identity: tags with an equal key share one connection.
    ///
    /// Everything that shapes the transport goes in; per-tag attributes
    /// like the name or element count stay out.
    pub fn endpoint_key(&self) -> String {
        let mut buf = vec![format!("protocol={}", self.protocol)];
        buf.push(format!("gateway={}", self.gateway));
        if let Some(ref path) = self.path {
            buf.push(format!("path={path}"));
        }
        if let Some(plc) = self.plc {
            buf.push(format!("plc={plc}"));
        }
        buf.push(format!("use_connected_msg={}", self.connected() as u8));
        buf.push(format!("connection_group_id={}", self.connection_group_id));
        buf.join("&")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_controllogix() {
        let opts = TagOptions::parse(
            "protocol=ab-eip&gateway=127.0.0.1&path=1,0&plc=ControlLogix&elem_count=10&name=TestBigArray",
        )
        .unwrap();
        assert_eq!(opts.protocol, Protocol::Eip);
        assert_eq!(opts.plc, Some(PlcKind::ControlLogix));
        assert_eq!(opts.elem_count, 10);
        assert_eq!(opts.name, "TestBigArray");
        assert!(opts.allow_packing);
        assert!(opts.connected());
        assert_eq!(opts.host_port().unwrap(), ("127.0.0.1".to_owned(), 44818));
    }

    #[test]
    fn test_parse_modbus() {
        let opts =
            TagOptions::parse("protocol=modbus-tcp&gateway=10.0.0.2:1502&path=1&name=hr10&elem_count=4")
                .unwrap();
        assert_eq!(opts.protocol, Protocol::Modbus);
        assert_eq!(opts.unit_id(), 1);
        assert_eq!(opts.host_port().unwrap(), ("10.0.0.2".to_owned(), 1502));
    }

    #[test]
    fn test_missing_required_is_bad_config() {
        let err = TagOptions::parse("protocol=ab-eip&gateway=1.2.3.4&name=Tag").unwrap_err();
        assert_eq!(err, Status::Err(ErrorKind::BadConfig));
        // controllogix without a path
        let err =
            TagOptions::parse("protocol=ab-eip&gateway=1.2.3.4&plc=controllogix&name=Tag").unwrap_err();
        assert_eq!(err, Status::Err(ErrorKind::BadConfig));
    }

    #[test]
    fn test_malformed_pair_is_bad_param() {
        let err = TagOptions::parse("protocol=ab-eip&gateway&name=x").unwrap_err();
        assert_eq!(err, Status::Err(ErrorKind::BadParam));
    }

    #[test]
    fn test_endpoint_key_shares_sessions() {
        let a = TagOptions::parse(
            "protocol=ab-eip&gateway=127.0.0.1&path=1,0&plc=controllogix&name=TagA",
        )
        .unwrap();
        let b = TagOptions::parse(
            "protocol=ab-eip&gateway=127.0.0.1&path=1,0&plc=controllogix&name=TagB&elem_count=8",
        )
        .unwrap();
        assert_eq!(a.endpoint_key(), b.endpoint_key());

        let c = TagOptions::parse(
            "protocol=ab-eip&gateway=127.0.0.1&path=1,0&plc=controllogix&name=TagA&connection_group_id=3",
        )
        .unwrap();
        assert_ne!(a.endpoint_key(), c.endpoint_key());
    }

    #[test]
    fn test_pccc_defaults_unconnected() {
        let opts = TagOptions::parse("protocol=ab-eip&gateway=127.0.0.1&plc=plc5&name=N7:0").unwrap();
        assert!(!opts.connected());
        assert!(opts.plc.unwrap().is_pccc());
    }
}
