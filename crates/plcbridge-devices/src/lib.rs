/*!
 * PLCBridge Devices
 *
 * The protocol abstraction layer: vendor detection over the wire, address
 * translation between vendor notations, one native driver per vendor behind
 * a common capability interface, a factory that ties detection to driver
 * construction, a connection-owning façade and a network scanner.
 *
 * ```no_run
 * # async fn demo() -> plcbridge_devices::Result<()> {
 * use plcbridge_core::config::SharedConfig;
 *
 * let mut plc = plcbridge_devices::connect("192.168.0.10", None, SharedConfig::default()).await?;
 * let speed = plc.read("DB1.DBW0").await?;
 * println!("{} -> {}", plc.target(), speed);
 * # Ok(())
 * # }
 * ```
 */

#![warn(missing_docs)]

pub mod address;
pub mod device;
pub mod discovery;
pub mod drivers;
pub mod probe;
pub mod program;
pub mod protocol;
pub mod registry;
pub mod tag;
pub mod unified;
pub mod vendor;

pub use address::{Address, AddressError, MemoryArea};
pub use device::{AccessLevel, DeviceError, DeviceInfo, PlcDevice, PlcMode, ProtectionStatus, Result};
pub use discovery::{NetworkScan, NetworkScanner, ScanOptions, ScanStatus};
pub use drivers::{available_capabilities, capability_available};
pub use probe::{ProbeOutcome, ProbeResult, ProbeSet};
pub use program::PlcProgram;
pub use protocol::ProtocolOptions;
pub use registry::{connect, DeviceFactory};
pub use tag::{DataType, TagValue};
pub use unified::{ConnectionState, TagMonitor, UnifiedPlc};
pub use vendor::{ProtocolFamily, Vendor};

/// PLCBridge devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> std::result::Result<(), plcbridge_core::error::Error> {
    tracing::info!(
        "PLCBridge Devices {} initialized ({} protocol families)",
        VERSION,
        available_capabilities().len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        assert!(!VERSION.is_empty());
        tokio_test::assert_ok!(init());
    }
}
