/*!
 * Native vendor drivers.
 *
 * One driver per vendor, each behind the cargo feature of its protocol
 * family. Building a driver whose feature is disabled fails immediately
 * with `CapabilityUnavailable`.
 *
 * Raw memory conventions shared by all drivers: for word and byte
 * addresses `read_memory` counts bytes in wire order; for bit addresses
 * it counts bits and returns one byte (0 or 1) per bit. `write_memory`
 * mirrors this.
 */
use plcbridge_core::config::SharedConfig;
use plcbridge_core::types::Value;

use crate::address::{self, Address, BitWidth};
use crate::device::{DeviceError, PlcDevice, Result};
use crate::protocol::util::split_target;
use crate::protocol::ProtocolOptions;
use crate::tag::{ByteOrder, DataType, TagValue};
use crate::vendor::{ProtocolFamily, Vendor};

#[cfg(feature = "enip")]
pub mod allen_bradley;
#[cfg(feature = "ads")]
pub mod beckhoff;
#[cfg(feature = "mc")]
pub mod mitsubishi;
#[cfg(feature = "modbus")]
pub mod modbus;
#[cfg(feature = "fins")]
pub mod omron;
#[cfg(feature = "s7")]
pub mod siemens;

#[cfg(any(feature = "s7", feature = "enip", feature = "fins", feature = "ads", feature = "mc"))]
pub(crate) mod transport;

/// Protocol families whose native client is compiled in
pub fn available_capabilities() -> Vec<ProtocolFamily> {
    let mut families = Vec::new();
    if cfg!(feature = "s7") {
        families.push(ProtocolFamily::S7);
    }
    if cfg!(feature = "enip") {
        families.push(ProtocolFamily::EtherNetIp);
    }
    if cfg!(feature = "fins") {
        families.push(ProtocolFamily::Fins);
    }
    if cfg!(feature = "modbus") {
        families.push(ProtocolFamily::Modbus);
    }
    if cfg!(feature = "ads") {
        families.push(ProtocolFamily::Ads);
    }
    if cfg!(feature = "mc") {
        families.push(ProtocolFamily::McProtocol);
    }
    families
}

/// Whether a driver for `vendor` can be built
pub fn capability_available(vendor: Vendor) -> bool {
    vendor
        .protocol_family()
        .map_or(false, |family| available_capabilities().contains(&family))
}

/// Build the native driver for a vendor
pub fn create_driver(vendor: Vendor, config: &SharedConfig) -> Result<Box<dyn PlcDevice>> {
    let family = vendor
        .protocol_family()
        .ok_or_else(|| DeviceError::UnsupportedVendor(vendor.as_str().to_string()))?;
    if !capability_available(vendor) {
        return Err(DeviceError::CapabilityUnavailable {
            vendor,
            capability: family.feature().to_string(),
        });
    }

    let driver: Box<dyn PlcDevice> = match vendor {
        #[cfg(feature = "s7")]
        Vendor::Siemens => Box::new(siemens::SiemensDriver::new(config.clone())),
        #[cfg(feature = "enip")]
        Vendor::AllenBradley => Box::new(allen_bradley::AllenBradleyDriver::new(config.clone())),
        #[cfg(feature = "fins")]
        Vendor::Omron => Box::new(omron::OmronDriver::new(config.clone())),
        #[cfg(feature = "modbus")]
        Vendor::Delta | Vendor::Schneider | Vendor::Generic => {
            Box::new(modbus::ModbusDriver::new(vendor, config.clone()))
        }
        #[cfg(feature = "ads")]
        Vendor::Beckhoff => Box::new(beckhoff::BeckhoffDriver::new(config.clone())),
        #[cfg(feature = "mc")]
        Vendor::Mitsubishi => Box::new(mitsubishi::MitsubishiDriver::new(config.clone())),
        _ => {
            return Err(DeviceError::CapabilityUnavailable {
                vendor,
                capability: family.feature().to_string(),
            })
        }
    };
    Ok(driver)
}

/// Host and port of a connection target
///
/// A port in the address wins over the `port` option, which wins over the
/// protocol default.
pub(crate) fn resolve_target(address: &str, options: &ProtocolOptions, default_port: u16) -> Result<(String, u16)> {
    let (host, port) = split_target(address)?;
    let port = match port {
        Some(port) => port,
        None => options.port_or(default_port)?,
    };
    Ok((host, port))
}

/// `NotConnected` for a driver that has no session
pub(crate) fn not_connected(target: &Option<String>) -> DeviceError {
    DeviceError::NotConnected {
        target: target.clone().unwrap_or_else(|| "<none>".to_string()),
    }
}

/// Parse a tag name in the vendor's address grammar
pub(crate) fn tag_address(vendor: Vendor, name: &str) -> Result<Address> {
    Ok(address::parse(vendor, name)?)
}

/// Bytes to fetch for one value at `address`
pub(crate) fn value_len(address: &Address) -> usize {
    address.width.byte_len()
}

/// Decode the raw bytes of a tag read
pub(crate) fn decode_tag(name: &str, address: &Address, bytes: &[u8], order: ByteOrder) -> Result<TagValue> {
    let data_type = DataType::for_width(address.width);
    let value = data_type.decode(bytes, order).ok_or_else(|| {
        DeviceError::invalid_value(
            name,
            format!("expected {} bytes, got {}", value_len(address), bytes.len()),
        )
    })?;
    Ok(TagValue::good(name, value, data_type))
}

/// Encode a value for a tag write
pub(crate) fn encode_tag(name: &str, address: &Address, value: &Value, order: ByteOrder) -> Result<Vec<u8>> {
    DataType::for_width(address.width).encode(value, order, name)
}

/// Number of 16-bit words covering `count` bytes
pub(crate) fn words_for(count: usize) -> usize {
    (count + 1) / 2
}

/// Reject an empty transfer or a zero count
pub(crate) fn check_count(address: &Address, count: usize) -> Result<()> {
    if count == 0 {
        return Err(DeviceError::invalid_value(address.to_string(), "count must be at least 1"));
    }
    Ok(())
}

/// Bit values of a bit-address write, one byte per bit
pub(crate) fn bits_of(data: &[u8]) -> Vec<bool> {
    data.iter().map(|b| *b != 0).collect()
}

/// Whether an address is a single-bit access
pub(crate) fn is_bit(address: &Address) -> bool {
    address.width == BitWidth::Bit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::MemoryArea;
    use plcbridge_core::config::Config;

    #[test]
    fn test_capabilities_follow_features() {
        let families = available_capabilities();
        assert_eq!(families.contains(&ProtocolFamily::S7), cfg!(feature = "s7"));
        assert_eq!(families.contains(&ProtocolFamily::Modbus), cfg!(feature = "modbus"));
        assert_eq!(capability_available(Vendor::Delta), cfg!(feature = "modbus"));
        assert!(!capability_available(Vendor::Unknown));
    }

    #[test]
    fn test_create_driver() {
        let config = SharedConfig::new(Config::default());
        for vendor in Vendor::ALL {
            match create_driver(vendor, &config) {
                Ok(driver) => {
                    assert_eq!(driver.vendor(), vendor);
                    assert!(!driver.is_connected());
                }
                Err(DeviceError::UnsupportedVendor(_)) => assert_eq!(vendor, Vendor::Unknown),
                Err(DeviceError::CapabilityUnavailable { vendor: v, .. }) => {
                    assert_eq!(v, vendor);
                    assert!(!capability_available(vendor));
                }
                Err(e) => panic!("unexpected error for {}: {}", vendor, e),
            }
        }
    }

    #[test]
    fn test_resolve_target() {
        let options = ProtocolOptions::new().with_port(1502);
        assert_eq!(
            resolve_target("10.0.0.5", &options, 502).unwrap(),
            ("10.0.0.5".to_string(), 1502)
        );
        assert_eq!(
            resolve_target("10.0.0.5:503", &options, 502).unwrap(),
            ("10.0.0.5".to_string(), 503)
        );
        assert_eq!(
            resolve_target("10.0.0.5", &ProtocolOptions::new(), 502).unwrap(),
            ("10.0.0.5".to_string(), 502)
        );
    }

    #[test]
    fn test_tag_codec() {
        let address = Address::new(MemoryArea::Data, 0, BitWidth::Word);
        let tag = decode_tag("D0", &address, &[0x01, 0x02], ByteOrder::Big).unwrap();
        assert_eq!(tag.value, Value::Integer(0x0102));
        assert_eq!(tag.data_type, DataType::Word);
        assert!(decode_tag("D0", &address, &[0x01], ByteOrder::Big).is_err());

        assert_eq!(
            encode_tag("D0", &address, &Value::Integer(0x0102), ByteOrder::Little).unwrap(),
            vec![0x02, 0x01]
        );
        assert!(matches!(
            encode_tag("D0", &address, &Value::Integer(70000), ByteOrder::Big),
            Err(DeviceError::InvalidValue { .. })
        ));
    }
}
