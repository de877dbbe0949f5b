/*!
 * PLC driver trait and core device abstractions.
 *
 * This module defines the capability interface every vendor driver
 * implements, the error type shared by drivers, the factory and the
 * unified façade, and the device level data model.
 */
use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use plcbridge_core::{
    error::Error as CoreError,
    types::{Metadata, Value},
};

use crate::address::{Address, AddressError};
use crate::program::{BlockInfo, PlcProgram};
use crate::protocol::ProtocolOptions;
use crate::tag::TagValue;
use crate::vendor::Vendor;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A driver needs a communication capability that is not compiled in
    #[error("{vendor} driver unavailable: the '{capability}' capability is not enabled")]
    CapabilityUnavailable {
        /// Vendor whose driver could not be built
        vendor: Vendor,
        /// Missing capability (cargo feature name)
        capability: String,
    },

    /// Transport or handshake failure
    #[error("Connection to {vendor} PLC at {target} failed: {message}")]
    ConnectionError {
        /// Vendor of the driver
        vendor: Vendor,
        /// Host or host:port
        target: String,
        /// What went wrong
        message: String,
    },

    /// No registered vendor protocol answered
    #[error("Could not detect PLC vendor at {target}")]
    VendorDetectionFailed {
        /// Host that was probed
        target: String,
    },

    /// Vendor identifier unknown or not registered
    #[error("Unsupported vendor: {0}")]
    UnsupportedVendor(String),

    /// Address parse or translation error
    #[error(transparent)]
    Address(#[from] AddressError),

    /// Operation attempted outside the connected state
    #[error("Not connected to {target}")]
    NotConnected {
        /// Host the façade or driver was (or would be) connected to
        target: String,
    },

    /// Malformed or unexpected response from a connected device
    #[error("Protocol error from {vendor} PLC at {target}: {message}")]
    ProtocolError {
        /// Vendor of the driver
        vendor: Vendor,
        /// Host or host:port
        target: String,
        /// What went wrong
        message: String,
    },

    /// The vendor protocol does not offer this operation
    #[error("{operation} is not supported by {vendor} controllers")]
    Unsupported {
        /// Vendor of the driver
        vendor: Vendor,
        /// Operation name
        operation: String,
    },

    /// A value cannot be converted for the target tag or address
    #[error("Invalid value for {tag}: {message}")]
    InvalidValue {
        /// Tag or address
        tag: String,
        /// Why the value was rejected
        message: String,
    },

    /// A request did not complete in time
    #[error("Timed out talking to {vendor} PLC at {target}")]
    Timeout {
        /// Vendor of the driver
        vendor: Vendor,
        /// Host or host:port
        target: String,
    },

    /// The façade or driver is in a state that does not allow the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Core error
    #[error("Core error: {0}")]
    CoreError(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Build a connection error
    pub fn connection<T: Into<String>, M: ToString>(vendor: Vendor, target: T, message: M) -> Self {
        DeviceError::ConnectionError {
            vendor,
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Build a protocol error
    pub fn protocol<T: Into<String>, M: ToString>(vendor: Vendor, target: T, message: M) -> Self {
        DeviceError::ProtocolError {
            vendor,
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Build an unsupported operation error
    pub fn unsupported<O: Into<String>>(vendor: Vendor, operation: O) -> Self {
        DeviceError::Unsupported {
            vendor,
            operation: operation.into(),
        }
    }

    /// Build an invalid value error
    pub fn invalid_value<T: Into<String>, M: ToString>(tag: T, message: M) -> Self {
        DeviceError::InvalidValue {
            tag: tag.into(),
            message: message.to_string(),
        }
    }

    /// True when the underlying transport is gone and the session cannot continue
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            DeviceError::ConnectionError { .. } | DeviceError::Timeout { .. }
        )
    }
}

/// PLC operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlcMode {
    /// Executing the user program
    Run,
    /// Program halted
    Stop,
    /// Program mode (Rockwell / Omron / Delta terminology for stop)
    Program,
    /// Controller fault
    Fault,
    /// Mode could not be determined
    Unknown,
}

/// Access granted by the controller to this session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessLevel {
    /// No access
    None,
    /// Read access only
    ReadOnly,
    /// Read and write of process data
    ReadWrite,
    /// Read, write, program and mode changes
    Full,
}

/// Information about a connected PLC
///
/// A snapshot taken once per successful connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// The vendor
    pub vendor: Vendor,
    /// Controller model / order number
    pub model: String,
    /// Firmware version
    pub firmware: String,
    /// Serial number
    pub serial: String,
    /// Logical name (station or project name)
    pub name: String,
    /// Network address the driver connected to
    pub address: Option<String>,
    /// Rack number where applicable
    pub rack: Option<u16>,
    /// Slot number where applicable
    pub slot: Option<u16>,
    /// Vendor specific extras
    pub additional: Metadata,
}

impl DeviceInfo {
    /// Empty info for a vendor and address
    pub fn new<S: Into<String>>(vendor: Vendor, address: S) -> Self {
        Self {
            vendor,
            model: String::new(),
            firmware: String::new(),
            serial: String::new(),
            name: String::new(),
            address: Some(address.into()),
            rack: None,
            slot: None,
            additional: Metadata::new(),
        }
    }
}

/// Protection status of a controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionStatus {
    /// CPU access protection (password level) is active
    pub cpu_protected: bool,
    /// The project / program is protected against upload
    pub project_protected: bool,
    /// Individual blocks are protected
    pub block_protected: bool,
    /// Know-how protection is active
    pub know_how_protected: bool,
    /// Access currently granted to this session
    pub access_level: AccessLevel,
    /// Vendor specific details
    pub details: Metadata,
}

impl Default for ProtectionStatus {
    fn default() -> Self {
        Self {
            cpu_protected: false,
            project_protected: false,
            block_protected: false,
            know_how_protected: false,
            access_level: AccessLevel::Full,
            details: Metadata::new(),
        }
    }
}

/// Holder for the last error a driver produced
#[derive(Debug, Clone, Default)]
pub struct ErrorSlot(Option<String>);

impl ErrorSlot {
    /// Remember the error of `result`, if any, and pass it through
    pub fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.0 = Some(e.to_string());
        }
        result
    }

    /// The last recorded error message
    pub fn get(&self) -> Option<String> {
        self.0.clone()
    }
}

/// The capability interface implemented by every vendor driver
///
/// Mutating operations take `&mut self`; a driver owns exactly one
/// transport connection and is used by one caller at a time.
#[async_trait]
pub trait PlcDevice: Send + Sync + Debug {
    /// The vendor this driver talks to
    fn vendor(&self) -> Vendor;

    /// Connect to the controller at `address` (host or host:port)
    async fn connect(&mut self, address: &str, options: &ProtocolOptions) -> Result<()>;

    /// Close the connection; a no-op when already disconnected
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether a session is open
    fn is_connected(&self) -> bool;

    /// The last error this driver produced; reading it does not clear it
    fn last_error(&self) -> Option<String>;

    /// Controller identity, read once per connection
    async fn get_device_info(&mut self) -> Result<DeviceInfo>;

    /// Protection status, read fresh on every call
    async fn get_protection_status(&mut self) -> Result<ProtectionStatus>;

    /// Read `count` bytes starting at `address`
    async fn read_memory(&mut self, address: &Address, count: usize) -> Result<Vec<u8>>;

    /// Write raw bytes starting at `address`
    async fn write_memory(&mut self, address: &Address, data: &[u8]) -> Result<()>;

    /// Read a tag by name or vendor address string
    async fn read_tag(&mut self, name: &str) -> Result<TagValue>;

    /// Write a tag by name or vendor address string
    async fn write_tag(&mut self, name: &str, value: &Value) -> Result<()>;

    /// Read several tags; sequential unless the driver batches
    async fn read_tags(&mut self, names: &[String]) -> Result<Vec<TagValue>> {
        let mut values = Vec::with_capacity(names.len());
        for name in names {
            values.push(self.read_tag(name).await?);
        }
        Ok(values)
    }

    /// Write several tags; sequential unless the driver batches
    async fn write_tags(&mut self, tags: &[(String, Value)]) -> Result<()> {
        for (name, value) in tags {
            self.write_tag(name, value).await?;
        }
        Ok(())
    }

    /// Upload the program from the controller
    async fn upload_program(&mut self) -> Result<PlcProgram> {
        Err(DeviceError::unsupported(self.vendor(), "program upload"))
    }

    /// Download a program to the controller
    async fn download_program(&mut self, _program: &PlcProgram) -> Result<()> {
        Err(DeviceError::unsupported(self.vendor(), "program download"))
    }

    /// List program blocks
    async fn get_block_list(&mut self) -> Result<Vec<BlockInfo>> {
        Err(DeviceError::unsupported(self.vendor(), "block listing"))
    }

    /// Put the controller in run mode
    async fn start(&mut self) -> Result<()>;

    /// Put the controller in stop / program mode
    async fn stop(&mut self) -> Result<()>;

    /// Current operating mode; `Unknown` when the controller does not report it
    async fn get_mode(&mut self) -> Result<PlcMode>;

    /// Authenticate the session with a password
    async fn authenticate(&mut self, secret: &str) -> Result<()>;

    /// Drop any authentication held by the session
    async fn clear_authentication(&mut self) -> Result<()> {
        Ok(())
    }

    /// Access level granted to this session
    async fn get_access_level(&mut self) -> Result<AccessLevel> {
        Ok(self.get_protection_status().await?.access_level)
    }

    /// Driver diagnostics
    async fn get_diagnostics(&mut self) -> Result<Metadata> {
        let mut diagnostics = Metadata::new();
        diagnostics.insert("vendor".to_string(), Value::from(self.vendor().as_str()));
        diagnostics.insert("connected".to_string(), Value::Bool(self.is_connected()));
        if let Some(error) = self.last_error() {
            diagnostics.insert("last_error".to_string(), Value::String(error));
        }
        Ok(diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failures() {
        assert!(DeviceError::connection(Vendor::Siemens, "10.0.0.1", "refused").is_transport_failure());
        assert!(DeviceError::Timeout {
            vendor: Vendor::Omron,
            target: "10.0.0.2".to_string()
        }
        .is_transport_failure());
        assert!(!DeviceError::protocol(Vendor::Siemens, "10.0.0.1", "bad pdu").is_transport_failure());
        assert!(!DeviceError::unsupported(Vendor::Delta, "program upload").is_transport_failure());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = DeviceError::connection(Vendor::AllenBradley, "10.0.0.7:44818", "refused");
        let text = err.to_string();
        assert!(text.contains("Allen-Bradley"));
        assert!(text.contains("10.0.0.7:44818"));
    }

    #[test]
    fn test_error_slot_keeps_last_error() {
        let mut slot = ErrorSlot::default();
        assert!(slot.record(Ok::<_, DeviceError>(1)).is_ok());
        assert_eq!(slot.get(), None);

        let _ = slot.record::<()>(Err(DeviceError::InvalidState("first".to_string())));
        let _ = slot.record(Ok::<_, DeviceError>(2));
        assert_eq!(slot.get(), Some("Invalid state: first".to_string()));
    }

    #[test]
    fn test_access_level_ordering() {
        assert!(AccessLevel::Full > AccessLevel::ReadWrite);
        assert!(AccessLevel::ReadOnly > AccessLevel::None);
        assert_eq!(ProtectionStatus::default().access_level, AccessLevel::Full);
    }
}
