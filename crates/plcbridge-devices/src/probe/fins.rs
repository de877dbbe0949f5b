//! Omron FINS/UDP probe: a controller data read.

use async_trait::async_trait;
use tokio::time::Instant;

use super::{ascii_field, udp_exchange, Exchange, PortOutcome, WireProbe};
use crate::vendor::ProtocolFamily;

/// FINS header length
pub const HEADER_LEN: usize = 10;
/// Information control field of a command that wants a response
pub const ICF_COMMAND: u8 = 0x80;
/// Gateway count
pub const GCT: u8 = 0x02;
/// Controller data read
pub const CONTROLLER_DATA_READ: [u8; 2] = [0x05, 0x01];
/// Node number used as our own address when none is configured
pub const DEFAULT_SOURCE_NODE: u8 = 0xEF;

/// Build a FINS command header
pub fn header(dest_node: u8, source_node: u8, sid: u8) -> [u8; HEADER_LEN] {
    [
        ICF_COMMAND,
        0x00,
        GCT,
        0x00, // destination network: local
        dest_node,
        0x00, // destination unit: CPU
        0x00, // source network
        source_node,
        0x00, // source unit
        sid,
    ]
}

/// Whether `reply` is a structurally valid response to `command` with `sid`
///
/// Returns the end code when it is.
pub fn response_end_code(reply: &[u8], command: [u8; 2], sid: u8) -> Option<u16> {
    if reply.len() < HEADER_LEN + 4 {
        return None;
    }
    if !matches!(reply[0], 0xC0 | 0xC1) || reply[9] != sid || reply[10..12] != command {
        return None;
    }
    Some(u16::from_be_bytes([reply[12], reply[13]]))
}

/// Controller model from a controller data read response
pub fn controller_model(reply: &[u8]) -> Option<String> {
    ascii_field(reply.get(HEADER_LEN + 4..HEADER_LEN + 24)?)
}

/// Omron FINS detection probe
#[derive(Debug, Clone, Copy, Default)]
pub struct FinsProbe;

#[async_trait]
impl WireProbe for FinsProbe {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Fins
    }

    async fn probe_port(&self, host: &str, port: u16, deadline: Instant) -> PortOutcome {
        let sid = 0x5A;
        let mut request = header(0x00, DEFAULT_SOURCE_NODE, sid).to_vec();
        request.extend_from_slice(&CONTROLLER_DATA_READ);
        request.push(0x00);

        match udp_exchange(host, port, &request, deadline).await {
            Exchange::Reply(reply) => match response_end_code(&reply, CONTROLLER_DATA_READ, sid) {
                Some(_) => PortOutcome::matched(controller_model(&reply)),
                None => PortOutcome::not_matched(),
            },
            _ => PortOutcome::unreachable(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::super::testing::*;
    use super::super::{run_probe, ProbeOutcome};
    use super::*;

    /// Turn a command into its response header with an end code
    pub fn respond(request: &[u8], end_code: u16, data: &[u8]) -> Vec<u8> {
        let mut reply = request[..HEADER_LEN + 2].to_vec();
        reply[0] = 0xC0;
        reply[3..6].copy_from_slice(&request[6..9]);
        reply[6..9].copy_from_slice(&request[3..6]);
        reply.extend_from_slice(&end_code.to_be_bytes());
        reply.extend_from_slice(data);
        reply
    }

    pub fn model_block(model: &str) -> Vec<u8> {
        let mut data = vec![0u8; 40];
        data[..model.len()].copy_from_slice(model.as_bytes());
        data[20..24].copy_from_slice(b"V2.1");
        data
    }

    #[test]
    fn test_response_validation() {
        let mut request = header(0, DEFAULT_SOURCE_NODE, 7).to_vec();
        request.extend_from_slice(&CONTROLLER_DATA_READ);

        let reply = respond(&request, 0, &model_block("CJ2M-CPU31"));
        assert_eq!(response_end_code(&reply, CONTROLLER_DATA_READ, 7), Some(0));
        assert_eq!(controller_model(&reply).as_deref(), Some("CJ2M-CPU31"));

        // wrong SID
        assert_eq!(response_end_code(&reply, CONTROLLER_DATA_READ, 8), None);
        // a command header is not a response
        assert_eq!(response_end_code(&request, CONTROLLER_DATA_READ, 7), None);
    }

    #[test_log::test(tokio::test)]
    async fn test_probe_matches_fake_controller() {
        let port = spawn_udp(|req| Some(respond(req, 0, &model_block("CS1G-CPU45H")))).await;
        let result = run_probe(&FinsProbe, "127.0.0.1", &[port], Duration::from_secs(1)).await;
        assert_eq!(result.outcome, ProbeOutcome::Matched);
        assert_eq!(result.identity.as_deref(), Some("CS1G-CPU45H"));
    }

    #[test_log::test(tokio::test)]
    async fn test_garbage_datagram_is_not_matched() {
        let port = spawn_udp(|_| Some(b"FINS".to_vec())).await;
        let result = run_probe(&FinsProbe, "127.0.0.1", &[port], Duration::from_millis(500)).await;
        assert_eq!(result.outcome, ProbeOutcome::NotMatched);
    }
}
