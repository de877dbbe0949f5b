//! ISO-on-TCP probe: a COTP connection request inside a TPKT segment.

use async_trait::async_trait;
use tokio::time::Instant;

use super::{tcp_exchange, Exchange, Framing, PortOutcome, WireProbe};
use crate::vendor::ProtocolFamily;

/// TPKT version byte
pub const TPKT_VERSION: u8 = 0x03;
/// COTP connection request PDU type
pub const COTP_CR: u8 = 0xE0;
/// COTP connection confirm PDU type
pub const COTP_CC: u8 = 0xD0;

/// Connection request for rack 0 slot 2 (`0x0102` called TSAP), TPDU size 1024
pub const CONNECT_REQUEST: [u8; 22] = [
    0x03, 0x00, 0x00, 0x16, // TPKT, length 22
    0x11, 0xE0, 0x00, 0x00, 0x00, 0x01, 0x00, // COTP CR, dst ref 0, src ref 1, class 0
    0xC0, 0x01, 0x0A, // TPDU size 1024
    0xC1, 0x02, 0x01, 0x00, // calling TSAP
    0xC2, 0x02, 0x01, 0x02, // called TSAP
];

/// Total TPKT frame length from its 4 byte header
pub fn tpkt_len(header: &[u8]) -> Option<usize> {
    if header.len() < 4 || header[0] != TPKT_VERSION {
        return None;
    }
    Some(u16::from_be_bytes([header[2], header[3]]) as usize)
}

pub(crate) const FRAMING: Framing = Framing {
    header_len: 4,
    total_len: tpkt_len,
};

/// Whether `reply` is a TPKT segment carrying a COTP connection confirm
pub fn is_connect_confirm(reply: &[u8]) -> bool {
    reply.len() >= 7
        && tpkt_len(reply) == Some(reply.len())
        && reply[4] as usize + 5 <= reply.len()
        && reply[5] & 0xF0 == COTP_CC
}

/// Siemens S7 detection probe
#[derive(Debug, Clone, Copy, Default)]
pub struct S7Probe;

#[async_trait]
impl WireProbe for S7Probe {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::S7
    }

    async fn probe_port(&self, host: &str, port: u16, deadline: Instant) -> PortOutcome {
        match tcp_exchange(host, port, &CONNECT_REQUEST, FRAMING, deadline).await {
            Exchange::Unreachable => PortOutcome::unreachable(),
            Exchange::Reply(reply) if is_connect_confirm(&reply) => PortOutcome::matched(None),
            _ => PortOutcome::not_matched(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::testing::*;
    use super::super::{run_probe, ProbeOutcome};
    use super::*;

    const CONFIRM: [u8; 22] = [
        0x03, 0x00, 0x00, 0x16, 0x11, 0xD0, 0x00, 0x01, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A, 0xC1,
        0x02, 0x01, 0x00, 0xC2, 0x02, 0x01, 0x02,
    ];

    #[test]
    fn test_connect_confirm_signature() {
        assert!(is_connect_confirm(&CONFIRM));
        // a connection request echoed back is not a confirm
        assert!(!is_connect_confirm(&CONNECT_REQUEST));
        // length field disagrees with the frame
        let mut short = CONFIRM.to_vec();
        short.pop();
        assert!(!is_connect_confirm(&short));
        assert!(!is_connect_confirm(&[0x03, 0x00]));
    }

    #[test_log::test(tokio::test)]
    async fn test_probe_matches_fake_plc() {
        let port = spawn_tcp(4, |h| tpkt_len(h).unwrap_or(4), |_| Some(CONFIRM.to_vec())).await;
        let result = run_probe(&S7Probe, "127.0.0.1", &[port], Duration::from_secs(1)).await;
        assert_eq!(result.outcome, ProbeOutcome::Matched);
        assert_eq!(result.port, Some(port));
    }

    #[test_log::test(tokio::test)]
    async fn test_probe_rejects_wrong_protocol() {
        // answers with an HTTP-ish banner
        let port = spawn_tcp(4, |_| 4, |_| Some(b"HTTP/1.0 400\r\n\r\n".to_vec())).await;
        let result = run_probe(&S7Probe, "127.0.0.1", &[port], Duration::from_millis(500)).await;
        assert_eq!(result.outcome, ProbeOutcome::NotMatched);
    }
}
