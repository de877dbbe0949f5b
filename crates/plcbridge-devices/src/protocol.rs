/*!
 * Per-connection protocol options.
 *
 * Options are a loose key/value bag so the factory and the façade can
 * carry vendor specific settings (rack, slot, unit id, AMS route) without
 * knowing which driver will consume them. Drivers fall back to the
 * connection section of the configuration for anything not set here.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use plcbridge_core::types::Value;

use crate::device::{DeviceError, Result};

/// Option key for the TCP/UDP port
pub const PORT: &str = "port";
/// Option key for the S7 rack
pub const RACK: &str = "rack";
/// Option key for the S7 / CIP slot
pub const SLOT: &str = "slot";
/// Option key for the Modbus unit id
pub const UNIT_ID: &str = "unit_id";
/// Option key for the ADS target AMS net id
pub const AMS_NET_ID: &str = "ams_net_id";
/// Option key for the ADS target AMS port
pub const AMS_PORT: &str = "ams_port";
/// Option key for the FINS destination node
pub const FINS_NODE: &str = "fins_node";

/// Protocol options for configuring a connection
#[derive(Debug, Clone, Default)]
pub struct ProtocolOptions {
    /// The timeout for protocol operations
    pub timeout: Option<Duration>,
    /// Additional protocol-specific options
    pub options: HashMap<String, Value>,
}

impl ProtocolOptions {
    /// Creates a new instance of protocol options
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the timeout for protocol operations
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a protocol-specific option
    pub fn with_option<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Sets the port
    pub fn with_port(self, port: u16) -> Self {
        self.with_option(PORT, port)
    }

    /// Whether an option is present
    pub fn has(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    /// Gets a protocol-specific option
    pub fn get_option<T: TryFrom<Value>>(&self, key: &str) -> Option<T>
    where
        T::Error: Debug,
    {
        self.options.get(key).and_then(|v| {
            T::try_from(v.clone())
                .map_err(|e| {
                    tracing::warn!("Failed to convert option {}: {:?}", key, e);
                    e
                })
                .ok()
        })
    }

    /// Gets a string option
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get_option::<String>(key)
    }

    /// Gets an integer option
    pub fn get_integer(&self, key: &str) -> Option<i64> {
        self.get_option::<i64>(key)
    }

    /// Gets an integer option that must fit in `u16`
    pub fn get_u16(&self, key: &str) -> Result<Option<u16>> {
        match self.get_integer(key) {
            None => Ok(None),
            Some(v) => u16::try_from(v)
                .map(Some)
                .map_err(|_| DeviceError::invalid_value(key, format!("{} is out of range", v))),
        }
    }

    /// The port option, or `default`
    pub fn port_or(&self, default: u16) -> Result<u16> {
        Ok(self.get_u16(PORT)?.unwrap_or(default))
    }

    /// Gets the timeout or a default value
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}

/// Connection target helpers
pub mod util {
    use super::*;

    /// Split `host` or `host:port` into its parts
    ///
    /// Bracketed IPv6 (`[::1]:502`) is accepted; a bare IPv6 literal is
    /// treated as a host without a port.
    pub fn split_target(target: &str) -> Result<(String, Option<u16>)> {
        let target = target.trim();
        if target.is_empty() {
            return Err(DeviceError::InvalidState("empty target address".to_string()));
        }

        if let Some(rest) = target.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                DeviceError::InvalidState(format!("Invalid target address: {}", target))
            })?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(parse_port(target, p)?),
                None if tail.is_empty() => None,
                None => {
                    return Err(DeviceError::InvalidState(format!(
                        "Invalid target address: {}",
                        target
                    )))
                }
            };
            return Ok((host.to_string(), port));
        }

        match target.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                Ok((host.to_string(), Some(parse_port(target, port)?)))
            }
            _ => Ok((target.to_string(), None)),
        }
    }

    fn parse_port(target: &str, port: &str) -> Result<u16> {
        port.parse::<u16>()
            .map_err(|_| DeviceError::InvalidState(format!("Invalid port in target address: {}", target)))
    }

    /// Join a host and port, bracketing IPv6 literals
    pub fn join_target(host: &str, port: u16) -> String {
        if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::util::*;
    use super::*;

    #[test]
    fn test_options() {
        let options = ProtocolOptions::new()
            .with_timeout(Duration::from_millis(250))
            .with_port(1502)
            .with_option(RACK, 0)
            .with_option(AMS_NET_ID, "5.1.2.3.1.1");

        assert_eq!(options.timeout_or(Duration::from_secs(5)), Duration::from_millis(250));
        assert_eq!(options.port_or(502).unwrap(), 1502);
        assert_eq!(options.get_integer(RACK), Some(0));
        assert_eq!(options.get_string(AMS_NET_ID).as_deref(), Some("5.1.2.3.1.1"));
        assert!(!options.has(SLOT));
    }

    #[test]
    fn test_port_out_of_range() {
        let options = ProtocolOptions::new().with_option(PORT, 70000);
        assert!(matches!(options.port_or(502), Err(DeviceError::InvalidValue { .. })));
    }

    #[test]
    fn test_split_target() {
        assert_eq!(split_target("10.0.0.5").unwrap(), ("10.0.0.5".to_string(), None));
        assert_eq!(
            split_target("plc.local:102").unwrap(),
            ("plc.local".to_string(), Some(102))
        );
        assert_eq!(split_target("[::1]:502").unwrap(), ("::1".to_string(), Some(502)));
        assert_eq!(split_target("fe80::1").unwrap(), ("fe80::1".to_string(), None));
        assert!(split_target("10.0.0.5:http").is_err());
        assert!(split_target("  ").is_err());
    }

    #[test]
    fn test_join_target() {
        assert_eq!(join_target("10.0.0.5", 502), "10.0.0.5:502");
        assert_eq!(join_target("::1", 502), "[::1]:502");
    }
}
