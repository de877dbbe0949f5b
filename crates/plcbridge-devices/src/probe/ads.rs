//! Beckhoff ADS probe: Read Device Info over AMS/TCP.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{ascii_field, tcp_exchange, Exchange, Framing, PortOutcome, WireProbe};
use crate::vendor::ProtocolFamily;

/// AMS/TCP header length
pub const TCP_HEADER_LEN: usize = 6;
/// AMS header length
pub const AMS_HEADER_LEN: usize = 32;
/// ADS Read Device Info
pub const CMD_READ_DEVICE_INFO: u16 = 0x0001;
/// ADS Read
pub const CMD_READ: u16 = 0x0002;
/// ADS Write
pub const CMD_WRITE: u16 = 0x0003;
/// ADS Read State
pub const CMD_READ_STATE: u16 = 0x0004;
/// ADS Write Control
pub const CMD_WRITE_CONTROL: u16 = 0x0005;
/// ADS Read Write
pub const CMD_READ_WRITE: u16 = 0x0009;
/// State flags of an ADS request
pub const STATE_REQUEST: u16 = 0x0004;
/// Response bit of the state flags
pub const STATE_RESPONSE: u16 = 0x0001;
/// AMS port of the TwinCAT system service
pub const SYSTEM_SERVICE_PORT: u16 = 10000;
/// Source net id used when none is configured
pub const DEFAULT_SOURCE_NET_ID: &str = "1.1.1.1.1.1";
/// Source AMS port of this client
pub const SOURCE_PORT: u16 = 32905;

/// An AMS Net ID
pub type NetId = [u8; 6];

/// Parse a dotted AMS Net ID (`5.1.2.3.1.1`)
pub fn parse_net_id(text: &str) -> Option<NetId> {
    let mut id = [0u8; 6];
    let mut parts = text.trim().split('.');
    for byte in id.iter_mut() {
        *byte = parts.next()?.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(id)
}

/// Conventional net id of a host: its IPv4 address followed by `.1.1`
pub fn net_id_for_host(host: &str) -> NetId {
    match host.parse::<Ipv4Addr>() {
        Ok(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], o[3], 1, 1]
        }
        Err(_) => [0, 0, 0, 0, 1, 1],
    }
}

/// Routing part of an AMS header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmsRoute {
    /// Target net id
    pub target: NetId,
    /// Target AMS port
    pub target_port: u16,
    /// Source net id
    pub source: NetId,
    /// Source AMS port
    pub source_port: u16,
}

/// Build a complete AMS/TCP request frame
pub fn request(route: &AmsRoute, command: u16, invoke_id: u32, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(TCP_HEADER_LEN + AMS_HEADER_LEN + data.len());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&((AMS_HEADER_LEN + data.len()) as u32).to_le_bytes());
    frame.extend_from_slice(&route.target);
    frame.extend_from_slice(&route.target_port.to_le_bytes());
    frame.extend_from_slice(&route.source);
    frame.extend_from_slice(&route.source_port.to_le_bytes());
    frame.extend_from_slice(&command.to_le_bytes());
    frame.extend_from_slice(&STATE_REQUEST.to_le_bytes());
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    frame.extend_from_slice(&invoke_id.to_le_bytes());
    frame.extend_from_slice(data);
    frame
}

/// Total AMS/TCP frame length from its 6 byte header
pub fn frame_len(header: &[u8]) -> Option<usize> {
    if header.len() < TCP_HEADER_LEN || header[0..2] != [0, 0] {
        return None;
    }
    let length = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if length < AMS_HEADER_LEN {
        return None;
    }
    Some(TCP_HEADER_LEN + length)
}

pub(crate) const FRAMING: Framing = Framing {
    header_len: TCP_HEADER_LEN,
    total_len: frame_len,
};

/// A decoded AMS response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmsResponse {
    /// Command id
    pub command: u16,
    /// State flags
    pub state: u16,
    /// AMS error code
    pub error: u32,
    /// Invoke id
    pub invoke_id: u32,
    /// ADS payload
    pub data: Vec<u8>,
}

/// Decode an AMS/TCP response frame
pub fn parse_response(frame: &[u8]) -> Option<AmsResponse> {
    if frame_len(frame)? != frame.len() {
        return None;
    }
    let ams = &frame[TCP_HEADER_LEN..];
    let le16 = |i: usize| u16::from_le_bytes([ams[i], ams[i + 1]]);
    let le32 = |i: usize| u32::from_le_bytes([ams[i], ams[i + 1], ams[i + 2], ams[i + 3]]);

    let state = le16(18);
    if state & STATE_RESPONSE == 0 {
        return None;
    }
    let length = le32(20) as usize;
    let data = ams.get(AMS_HEADER_LEN..AMS_HEADER_LEN + length)?;

    Some(AmsResponse {
        command: le16(16),
        state,
        error: le32(24),
        invoke_id: le32(28),
        data: data.to_vec(),
    })
}

/// Device name and version from a Read Device Info payload
pub fn parse_device_info(data: &[u8]) -> Option<(String, String)> {
    if data.len() < 24 {
        return None;
    }
    let version = format!(
        "{}.{}.{}",
        data[4],
        data[5],
        u16::from_le_bytes([data[6], data[7]])
    );
    Some((ascii_field(&data[8..24]).unwrap_or_default(), version))
}

/// Beckhoff ADS detection probe
#[derive(Debug, Clone, Copy)]
pub struct AdsProbe {
    source: NetId,
}

impl AdsProbe {
    /// Probe sending from `source` (dotted net id; falls back to the default)
    pub fn new(source: &str) -> Self {
        let source = parse_net_id(source).unwrap_or([1, 1, 1, 1, 1, 1]);
        Self { source }
    }
}

impl Default for AdsProbe {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE_NET_ID)
    }
}

#[async_trait]
impl WireProbe for AdsProbe {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Ads
    }

    async fn probe_port(&self, host: &str, port: u16, deadline: Instant) -> PortOutcome {
        let route = AmsRoute {
            target: net_id_for_host(host),
            target_port: SYSTEM_SERVICE_PORT,
            source: self.source,
            source_port: SOURCE_PORT,
        };
        let invoke_id = 0x0000_0A75;
        let frame = request(&route, CMD_READ_DEVICE_INFO, invoke_id, &[]);

        match tcp_exchange(host, port, &frame, FRAMING, deadline).await {
            Exchange::Unreachable => PortOutcome::unreachable(),
            Exchange::Reply(reply) => match parse_response(&reply) {
                Some(response)
                    if response.command == CMD_READ_DEVICE_INFO && response.invoke_id == invoke_id =>
                {
                    let name = parse_device_info(&response.data)
                        .map(|(name, _)| name)
                        .filter(|name| !name.is_empty());
                    PortOutcome::matched(name)
                }
                _ => PortOutcome::not_matched(),
            },
            Exchange::NoReply => PortOutcome::not_matched(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::super::testing::*;
    use super::super::{run_probe, ProbeOutcome};
    use super::*;

    /// Answer a request frame with `data`, swapping the route
    pub fn respond(req: &[u8], data: &[u8]) -> Vec<u8> {
        let ams = &req[TCP_HEADER_LEN..];
        let mut out = vec![0, 0];
        out.extend_from_slice(&((AMS_HEADER_LEN + data.len()) as u32).to_le_bytes());
        out.extend_from_slice(&ams[8..16]);
        out.extend_from_slice(&ams[0..8]);
        out.extend_from_slice(&ams[16..18]);
        out.extend_from_slice(&(STATE_REQUEST | STATE_RESPONSE).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&ams[28..32]);
        out.extend_from_slice(data);
        out
    }

    pub fn device_info_data(name: &str) -> Vec<u8> {
        let mut data = vec![0, 0, 0, 0, 3, 1];
        data.extend_from_slice(&4024u16.to_le_bytes());
        let mut field = [0u8; 16];
        field[..name.len()].copy_from_slice(name.as_bytes());
        data.extend_from_slice(&field);
        data
    }

    #[test]
    fn test_net_id() {
        assert_eq!(parse_net_id("5.1.2.3.1.1"), Some([5, 1, 2, 3, 1, 1]));
        assert_eq!(parse_net_id("5.1.2.3.1"), None);
        assert_eq!(parse_net_id("5.1.2.3.1.1.1"), None);
        assert_eq!(parse_net_id("5.1.2.300.1.1"), None);
        assert_eq!(net_id_for_host("192.168.0.10"), [192, 168, 0, 10, 1, 1]);
    }

    #[test]
    fn test_request_layout() {
        let route = AmsRoute {
            target: [5, 1, 2, 3, 1, 1],
            target_port: 851,
            source: [1, 1, 1, 1, 1, 1],
            source_port: SOURCE_PORT,
        };
        let frame = request(&route, CMD_READ, 9, &[1, 2, 3, 4]);
        assert_eq!(frame.len(), TCP_HEADER_LEN + AMS_HEADER_LEN + 4);
        assert_eq!(frame_len(&frame), Some(frame.len()));
        assert_eq!(&frame[6..12], &[5, 1, 2, 3, 1, 1]);
        assert_eq!(&frame[12..14], &851u16.to_le_bytes());
        // a request is not a response
        assert_eq!(parse_response(&frame), None);

        let reply = respond(&frame, &[0, 0, 0, 0]);
        let response = parse_response(&reply).unwrap();
        assert_eq!(response.command, CMD_READ);
        assert_eq!(response.invoke_id, 9);
        assert_eq!(response.data, vec![0, 0, 0, 0]);
    }

    #[test_log::test(tokio::test)]
    async fn test_probe_falls_back_to_second_port() {
        let closed = closed_port().await;
        let open = spawn_tcp(TCP_HEADER_LEN, |h| frame_len(h).unwrap_or(TCP_HEADER_LEN), |req| {
            Some(respond(req, &device_info_data("TCatPlcCtrl")))
        })
        .await;

        let result = run_probe(
            &AdsProbe::default(),
            "127.0.0.1",
            &[closed, open],
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(result.outcome, ProbeOutcome::Matched);
        assert_eq!(result.port, Some(open));
        assert_eq!(result.identity.as_deref(), Some("TCatPlcCtrl"));
    }

    #[test_log::test(tokio::test)]
    async fn test_silent_first_port_leaves_time_for_second() {
        let silent = spawn_silent_tcp().await;
        let open = spawn_tcp(TCP_HEADER_LEN, |h| frame_len(h).unwrap_or(TCP_HEADER_LEN), |req| {
            Some(respond(req, &device_info_data("TCatPlcCtrl")))
        })
        .await;

        let timeout = Duration::from_millis(800);
        let result = run_probe(&AdsProbe::default(), "127.0.0.1", &[silent, open], timeout).await;
        assert_eq!(result.outcome, ProbeOutcome::Matched);
        assert_eq!(result.port, Some(open));
        assert!(result.elapsed < timeout, "{:?}", result.elapsed);
    }
}
