//! EtherNet/IP probe: the encapsulation List Identity command.

use async_trait::async_trait;
use tokio::time::Instant;

use super::{ascii_field, tcp_exchange, Exchange, Framing, PortOutcome, WireProbe};
use crate::vendor::ProtocolFamily;

/// Encapsulation header length
pub const HEADER_LEN: usize = 24;
/// List Identity command code
pub const LIST_IDENTITY: u16 = 0x0063;
/// CIP identity item type id
const IDENTITY_ITEM: u16 = 0x000C;

/// Build an encapsulation header with no payload
pub fn encapsulation_header(command: u16, length: u16, session: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..2].copy_from_slice(&command.to_le_bytes());
    header[2..4].copy_from_slice(&length.to_le_bytes());
    header[4..8].copy_from_slice(&session.to_le_bytes());
    header
}

/// Total encapsulation frame length from its header
pub fn frame_len(header: &[u8]) -> Option<usize> {
    if header.len() < HEADER_LEN {
        return None;
    }
    Some(HEADER_LEN + u16::from_le_bytes([header[2], header[3]]) as usize)
}

pub(crate) const FRAMING: Framing = Framing {
    header_len: HEADER_LEN,
    total_len: frame_len,
};

/// Identity fields from a List Identity reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// CIP vendor id (1 = Rockwell Automation)
    pub vendor_id: u16,
    /// CIP device type
    pub device_type: u16,
    /// Product code
    pub product_code: u16,
    /// Major and minor revision
    pub revision: (u8, u8),
    /// Status word (mode and fault bits)
    pub status: u16,
    /// Serial number
    pub serial: u32,
    /// Product name
    pub product_name: String,
}

/// Parse the identity item of a List Identity reply
pub fn parse_identity(reply: &[u8]) -> Option<Identity> {
    let body = reply.get(HEADER_LEN..)?;
    let count = u16::from_le_bytes([*body.first()?, *body.get(1)?]);
    if count == 0 {
        return None;
    }
    let item_type = u16::from_le_bytes([*body.get(2)?, *body.get(3)?]);
    if item_type != IDENTITY_ITEM {
        return None;
    }
    // item: protocol version (2) + socket address (16) precede the identity object
    let item = body.get(6..)?;
    let id = item.get(18..)?;
    let le16 = |i: usize| -> Option<u16> { Some(u16::from_le_bytes([*id.get(i)?, *id.get(i + 1)?])) };

    let name_len = *id.get(14)? as usize;
    let name = id.get(15..15 + name_len)?;

    Some(Identity {
        vendor_id: le16(0)?,
        device_type: le16(2)?,
        product_code: le16(4)?,
        revision: (*id.get(6)?, *id.get(7)?),
        status: le16(8)?,
        serial: u32::from_le_bytes([*id.get(10)?, *id.get(11)?, *id.get(12)?, *id.get(13)?]),
        product_name: ascii_field(name).unwrap_or_default(),
    })
}

/// Whether `reply` echoes List Identity with a payload
pub fn is_list_identity_reply(reply: &[u8]) -> bool {
    reply.len() > HEADER_LEN
        && u16::from_le_bytes([reply[0], reply[1]]) == LIST_IDENTITY
        && frame_len(reply) == Some(reply.len())
}

/// Allen-Bradley / EtherNet/IP detection probe
#[derive(Debug, Clone, Copy, Default)]
pub struct EnipProbe;

#[async_trait]
impl WireProbe for EnipProbe {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::EtherNetIp
    }

    async fn probe_port(&self, host: &str, port: u16, deadline: Instant) -> PortOutcome {
        let request = encapsulation_header(LIST_IDENTITY, 0, 0);
        match tcp_exchange(host, port, &request, FRAMING, deadline).await {
            Exchange::Unreachable => PortOutcome::unreachable(),
            Exchange::Reply(reply) if is_list_identity_reply(&reply) => {
                let identity = parse_identity(&reply)
                    .map(|id| id.product_name)
                    .filter(|name| !name.is_empty());
                PortOutcome::matched(identity)
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

    /// A List Identity reply from a 1756-L71
    pub fn identity_reply() -> Vec<u8> {
        let name = b"1756-L71/B LOGIX5571";
        let mut identity = Vec::new();
        identity.extend_from_slice(&1u16.to_le_bytes()); // protocol version
        identity.extend_from_slice(&[0u8; 16]); // socket address
        identity.extend_from_slice(&1u16.to_le_bytes()); // vendor: Rockwell
        identity.extend_from_slice(&14u16.to_le_bytes()); // PLC
        identity.extend_from_slice(&54u16.to_le_bytes()); // product code
        identity.extend_from_slice(&[20, 11]); // revision
        identity.extend_from_slice(&0x0060u16.to_le_bytes()); // status
        identity.extend_from_slice(&0x00C0FFEEu32.to_le_bytes());
        identity.push(name.len() as u8);
        identity.extend_from_slice(name);
        identity.push(3); // state

        let mut body = Vec::new();
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&IDENTITY_ITEM.to_le_bytes());
        body.extend_from_slice(&(identity.len() as u16).to_le_bytes());
        body.extend_from_slice(&identity);

        let mut reply = encapsulation_header(LIST_IDENTITY, body.len() as u16, 0).to_vec();
        reply.extend_from_slice(&body);
        reply
    }

    #[test]
    fn test_parse_identity() {
        let reply = identity_reply();
        assert!(is_list_identity_reply(&reply));
        let identity = parse_identity(&reply).unwrap();
        assert_eq!(identity.vendor_id, 1);
        assert_eq!(identity.revision, (20, 11));
        assert_eq!(identity.status, 0x0060);
        assert_eq!(identity.serial, 0x00C0FFEE);
        assert_eq!(identity.product_name, "1756-L71/B LOGIX5571");
    }

    #[test]
    fn test_empty_reply_is_not_identity() {
        // same command, no payload
        let reply = encapsulation_header(LIST_IDENTITY, 0, 0);
        assert!(!is_list_identity_reply(&reply));
        let other = encapsulation_header(0x0065, 4, 0);
        assert!(!is_list_identity_reply(&other));
    }

    #[test_log::test(tokio::test)]
    async fn test_probe_reports_product_name() {
        let port = spawn_tcp(HEADER_LEN, |h| frame_len(h).unwrap_or(HEADER_LEN), |_| {
            Some(identity_reply())
        })
        .await;
        let result = run_probe(&EnipProbe, "127.0.0.1", &[port], Duration::from_secs(1)).await;
        assert_eq!(result.outcome, ProbeOutcome::Matched);
        assert_eq!(result.identity.as_deref(), Some("1756-L71/B LOGIX5571"));
    }
}
