//! Modbus-TCP probe: Read Device Identification (function 43, MEI 14).
//!
//! Any well-formed answer, including an exception, proves a Modbus server.
//! The vendor name object, when present, is what separates Delta from
//! Schneider controllers.

use async_trait::async_trait;
use tokio::time::Instant;

use super::{tcp_exchange, Exchange, Framing, PortOutcome, WireProbe};
use crate::vendor::{ProtocolFamily, Vendor};

/// MBAP header length including the unit id
pub const MBAP_LEN: usize = 7;
/// Encapsulated interface transport
pub const FC_MEI: u8 = 0x2B;
/// MEI type: read device identification
pub const MEI_DEVICE_ID: u8 = 0x0E;
/// Device identification object: vendor name
pub const OBJECT_VENDOR_NAME: u8 = 0x00;
/// Device identification object: product code
pub const OBJECT_PRODUCT_CODE: u8 = 0x01;
/// Device identification object: major/minor revision
pub const OBJECT_REVISION: u8 = 0x02;

/// Build a basic device identification request
pub fn device_id_request(transaction: u16, unit: u8) -> [u8; 11] {
    let tid = transaction.to_be_bytes();
    [
        tid[0], tid[1], 0x00, 0x00, 0x00, 0x05, unit, FC_MEI, MEI_DEVICE_ID, 0x01, 0x00,
    ]
}

/// Total MBAP frame length from its header
pub fn frame_len(header: &[u8]) -> Option<usize> {
    if header.len() < MBAP_LEN || header[2..4] != [0x00, 0x00] {
        return None;
    }
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    if length < 2 {
        return None;
    }
    Some(6 + length)
}

pub(crate) const FRAMING: Framing = Framing {
    header_len: MBAP_LEN,
    total_len: frame_len,
};

/// Whether `reply` is a Modbus-TCP answer to a device identification request
pub fn is_device_id_reply(reply: &[u8], transaction: u16, unit: u8) -> bool {
    frame_len(reply) == Some(reply.len())
        && reply[0..2] == transaction.to_be_bytes()
        && reply[6] == unit
        && reply[7] & 0x7F == FC_MEI
}

/// Objects of a device identification response PDU (starting at the function code)
pub fn parse_device_id(pdu: &[u8]) -> Vec<(u8, String)> {
    let mut objects = Vec::new();
    if pdu.len() < 7 || pdu[0] != FC_MEI || pdu[1] != MEI_DEVICE_ID {
        return objects;
    }
    let count = pdu[6] as usize;
    let mut pos = 7;
    for _ in 0..count {
        let (Some(&id), Some(&len)) = (pdu.get(pos), pdu.get(pos + 1)) else {
            break;
        };
        let Some(value) = pdu.get(pos + 2..pos + 2 + len as usize) else {
            break;
        };
        objects.push((id, String::from_utf8_lossy(value).trim().to_string()));
        pos += 2 + len as usize;
    }
    objects
}

/// Vendor name object of a device identification response
pub fn vendor_name(pdu: &[u8]) -> Option<String> {
    parse_device_id(pdu)
        .into_iter()
        .find(|(id, _)| *id == OBJECT_VENDOR_NAME)
        .map(|(_, name)| name)
        .filter(|name| !name.is_empty())
}

/// Decide which vendor a Modbus server belongs to
///
/// Uses the device identification vendor name when it names a known
/// manufacturer, `default` otherwise.
pub fn modbus_vendor(identity: Option<&str>, default: Vendor) -> Vendor {
    let Some(identity) = identity else {
        return default;
    };
    let identity = identity.to_ascii_lowercase();
    if ["schneider", "telemecanique", "modicon"]
        .iter()
        .any(|name| identity.contains(name))
    {
        Vendor::Schneider
    } else if identity.contains("delta") {
        Vendor::Delta
    } else {
        default
    }
}

/// Modbus-TCP detection probe
#[derive(Debug, Clone, Copy)]
pub struct ModbusProbe {
    unit: u8,
}

impl ModbusProbe {
    /// Probe addressing `unit`
    pub fn new(unit: u8) -> Self {
        Self { unit }
    }
}

impl Default for ModbusProbe {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl WireProbe for ModbusProbe {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Modbus
    }

    async fn probe_port(&self, host: &str, port: u16, deadline: Instant) -> PortOutcome {
        let transaction = 0x0001;
        let request = device_id_request(transaction, self.unit);
        match tcp_exchange(host, port, &request, FRAMING, deadline).await {
            Exchange::Unreachable => PortOutcome::unreachable(),
            Exchange::Reply(reply) if is_device_id_reply(&reply, transaction, self.unit) => {
                PortOutcome::matched(vendor_name(&reply[MBAP_LEN..]))
            }
            _ => PortOutcome::not_matched(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::super::testing::*;
    use super::super::{run_probe, ProbeOutcome};
    use super::*;

    /// Device identification response PDU for a vendor and product
    pub fn device_id_pdu(vendor: &str, product: &str) -> Vec<u8> {
        let mut pdu = vec![FC_MEI, MEI_DEVICE_ID, 0x01, 0x01, 0x00, 0x00, 0x02];
        for (id, value) in [(OBJECT_VENDOR_NAME, vendor), (OBJECT_PRODUCT_CODE, product)] {
            pdu.push(id);
            pdu.push(value.len() as u8);
            pdu.extend_from_slice(value.as_bytes());
        }
        pdu
    }

    /// Wrap a PDU in an MBAP header
    pub fn mbap(transaction: &[u8], unit: u8, pdu: &[u8]) -> Vec<u8> {
        let mut frame = transaction[..2].to_vec();
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        frame.push(unit);
        frame.extend_from_slice(pdu);
        frame
    }

    #[test]
    fn test_disambiguation() {
        assert_eq!(
            modbus_vendor(Some("Schneider Electric"), Vendor::Delta),
            Vendor::Schneider
        );
        assert_eq!(modbus_vendor(Some("Telemecanique"), Vendor::Delta), Vendor::Schneider);
        assert_eq!(
            modbus_vendor(Some("DELTA ELECTRONICS"), Vendor::Schneider),
            Vendor::Delta
        );
        assert_eq!(modbus_vendor(Some("Acme"), Vendor::Delta), Vendor::Delta);
        assert_eq!(modbus_vendor(None, Vendor::Schneider), Vendor::Schneider);
    }

    #[test]
    fn test_parse_device_id() {
        let pdu = device_id_pdu("Schneider Electric", "BMX P34 2020");
        assert_eq!(
            parse_device_id(&pdu),
            vec![
                (OBJECT_VENDOR_NAME, "Schneider Electric".to_string()),
                (OBJECT_PRODUCT_CODE, "BMX P34 2020".to_string())
            ]
        );
        assert_eq!(vendor_name(&pdu).as_deref(), Some("Schneider Electric"));

        // truncated object list stops cleanly
        assert_eq!(parse_device_id(&pdu[..12]), Vec::new());
    }

    #[test]
    fn test_reply_signature() {
        let exception = mbap(&[0x00, 0x01], 1, &[0xAB, 0x01]);
        assert!(is_device_id_reply(&exception, 1, 1));
        assert!(!is_device_id_reply(&exception, 2, 1));
        let read_holding = mbap(&[0x00, 0x01], 1, &[0x03, 0x02, 0x00, 0x00]);
        assert!(!is_device_id_reply(&read_holding, 1, 1));
    }

    #[test_log::test(tokio::test)]
    async fn test_probe_reads_vendor_name() {
        let port = spawn_tcp(MBAP_LEN, |h| frame_len(h).unwrap_or(MBAP_LEN), |req| {
            Some(mbap(req, req[6], &device_id_pdu("Delta Electronics", "DVP-12SE")))
        })
        .await;
        let result = run_probe(&ModbusProbe::default(), "127.0.0.1", &[port], Duration::from_secs(1)).await;
        assert_eq!(result.outcome, ProbeOutcome::Matched);
        assert_eq!(result.identity.as_deref(), Some("Delta Electronics"));
    }
}
