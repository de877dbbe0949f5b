/*!
 * Controller vendors and the wire protocol families they speak.
 */
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A PLC vendor
///
/// Closed set; a new vendor needs a new variant, an address grammar and a
/// registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Vendor {
    /// Siemens SIMATIC S7
    Siemens,
    /// Rockwell Automation / Allen-Bradley
    AllenBradley,
    /// Delta Electronics DVP
    Delta,
    /// Omron CS/CJ/NJ
    Omron,
    /// Beckhoff TwinCAT
    Beckhoff,
    /// Mitsubishi Electric MELSEC
    Mitsubishi,
    /// Schneider Electric Modicon
    Schneider,
    /// Not identified
    Unknown,
    /// Any plain Modbus-TCP device
    Generic,
}

impl Vendor {
    /// Every vendor, in default registration order
    pub const ALL: [Vendor; 9] = [
        Vendor::Siemens,
        Vendor::AllenBradley,
        Vendor::Delta,
        Vendor::Omron,
        Vendor::Beckhoff,
        Vendor::Mitsubishi,
        Vendor::Schneider,
        Vendor::Unknown,
        Vendor::Generic,
    ];

    /// Stable lower-case identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::Siemens => "siemens",
            Vendor::AllenBradley => "allen_bradley",
            Vendor::Delta => "delta",
            Vendor::Omron => "omron",
            Vendor::Beckhoff => "beckhoff",
            Vendor::Mitsubishi => "mitsubishi",
            Vendor::Schneider => "schneider",
            Vendor::Unknown => "unknown",
            Vendor::Generic => "generic",
        }
    }

    /// Human readable name
    pub fn display_name(&self) -> &'static str {
        match self {
            Vendor::Siemens => "Siemens",
            Vendor::AllenBradley => "Allen-Bradley",
            Vendor::Delta => "Delta",
            Vendor::Omron => "Omron",
            Vendor::Beckhoff => "Beckhoff",
            Vendor::Mitsubishi => "Mitsubishi",
            Vendor::Schneider => "Schneider Electric",
            Vendor::Unknown => "Unknown",
            Vendor::Generic => "Generic Modbus",
        }
    }

    /// The native protocol family, `None` for `Unknown`
    pub fn protocol_family(&self) -> Option<ProtocolFamily> {
        match self {
            Vendor::Siemens => Some(ProtocolFamily::S7),
            Vendor::AllenBradley => Some(ProtocolFamily::EtherNetIp),
            Vendor::Omron => Some(ProtocolFamily::Fins),
            Vendor::Delta | Vendor::Schneider | Vendor::Generic => Some(ProtocolFamily::Modbus),
            Vendor::Beckhoff => Some(ProtocolFamily::Ads),
            Vendor::Mitsubishi => Some(ProtocolFamily::McProtocol),
            Vendor::Unknown => None,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Error returned when a vendor name is not recognized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVendorName(pub String);

impl fmt::Display for UnknownVendorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown vendor '{}'", self.0)
    }
}

impl std::error::Error for UnknownVendorName {}

impl FromStr for Vendor {
    type Err = UnknownVendorName;

    /// Case, space, dash and underscore insensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();

        match key.as_str() {
            "siemens" | "s7" => Ok(Vendor::Siemens),
            "allenbradley" | "ab" | "rockwell" => Ok(Vendor::AllenBradley),
            "delta" => Ok(Vendor::Delta),
            "omron" => Ok(Vendor::Omron),
            "beckhoff" | "twincat" => Ok(Vendor::Beckhoff),
            "mitsubishi" | "melsec" => Ok(Vendor::Mitsubishi),
            "schneider" | "schneiderelectric" | "modicon" => Ok(Vendor::Schneider),
            "unknown" => Ok(Vendor::Unknown),
            "generic" | "genericmodbus" | "modbus" => Ok(Vendor::Generic),
            _ => Err(UnknownVendorName(s.to_string())),
        }
    }
}

/// A wire protocol family with its own detection probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolFamily {
    /// ISO-on-TCP / S7comm
    S7,
    /// EtherNet/IP encapsulation (CIP)
    EtherNetIp,
    /// Omron FINS over UDP
    Fins,
    /// Modbus-TCP
    Modbus,
    /// Beckhoff ADS over AMS/TCP
    Ads,
    /// Mitsubishi MC protocol, 3E binary frame
    McProtocol,
}

impl ProtocolFamily {
    /// Key used in configuration port overrides
    pub fn key(&self) -> &'static str {
        match self {
            ProtocolFamily::S7 => "s7",
            ProtocolFamily::EtherNetIp => "enip",
            ProtocolFamily::Fins => "fins",
            ProtocolFamily::Modbus => "modbus",
            ProtocolFamily::Ads => "ads",
            ProtocolFamily::McProtocol => "mc",
        }
    }

    /// Well known ports, tried in order
    pub fn default_ports(&self) -> &'static [u16] {
        match self {
            ProtocolFamily::S7 => &[102],
            ProtocolFamily::EtherNetIp => &[44818],
            ProtocolFamily::Fins => &[9600],
            ProtocolFamily::Modbus => &[502],
            ProtocolFamily::Ads => &[851, 48898],
            ProtocolFamily::McProtocol => &[5000],
        }
    }

    /// Name of the cargo feature carrying the native client
    pub fn feature(&self) -> &'static str {
        self.key()
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolFamily::S7 => "S7comm",
            ProtocolFamily::EtherNetIp => "EtherNet/IP",
            ProtocolFamily::Fins => "FINS",
            ProtocolFamily::Modbus => "Modbus-TCP",
            ProtocolFamily::Ads => "ADS",
            ProtocolFamily::McProtocol => "MC protocol",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_aliases() {
        assert_eq!("genericModbus".parse::<Vendor>(), Ok(Vendor::Generic));
        assert_eq!("generic-modbus".parse::<Vendor>(), Ok(Vendor::Generic));
        assert_eq!("Allen-Bradley".parse::<Vendor>(), Ok(Vendor::AllenBradley));
        assert_eq!("SIEMENS".parse::<Vendor>(), Ok(Vendor::Siemens));
        assert!("acme".parse::<Vendor>().is_err());
    }

    #[test]
    fn test_as_str_parses_back() {
        for vendor in Vendor::ALL {
            assert_eq!(vendor.as_str().parse::<Vendor>(), Ok(vendor));
        }
    }

    #[test]
    fn test_families() {
        assert_eq!(Vendor::Delta.protocol_family(), Some(ProtocolFamily::Modbus));
        assert_eq!(Vendor::Schneider.protocol_family(), Some(ProtocolFamily::Modbus));
        assert_eq!(Vendor::Unknown.protocol_family(), None);
        assert_eq!(ProtocolFamily::Ads.default_ports(), &[851, 48898]);
    }
}
