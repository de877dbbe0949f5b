//! Mitsubishi MC protocol probe: a 3E binary CPU model read.

use async_trait::async_trait;
use tokio::time::Instant;

use super::{ascii_field, tcp_exchange, Exchange, Framing, PortOutcome, WireProbe};
use crate::vendor::ProtocolFamily;

/// 3E request subheader
pub const SUBHEADER_REQUEST: [u8; 2] = [0x50, 0x00];
/// 3E response subheader
pub const SUBHEADER_RESPONSE: [u8; 2] = [0xD0, 0x00];
/// Response bytes up to and including the data length field
pub const RESPONSE_HEADER_LEN: usize = 9;
/// CPU model read
pub const CMD_CPU_MODEL: u16 = 0x0101;
/// Monitoring timer in 250 ms units
pub const DEFAULT_TIMER: u16 = 0x0010;

/// Build a 3E binary request to the local station
pub fn request(command: u16, subcommand: u16, data: &[u8], timer: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(15 + data.len());
    frame.extend_from_slice(&SUBHEADER_REQUEST);
    frame.extend_from_slice(&[0x00, 0xFF, 0xFF, 0x03, 0x00]); // network, PC, I/O 0x03FF, station
    frame.extend_from_slice(&((6 + data.len()) as u16).to_le_bytes());
    frame.extend_from_slice(&timer.to_le_bytes());
    frame.extend_from_slice(&command.to_le_bytes());
    frame.extend_from_slice(&subcommand.to_le_bytes());
    frame.extend_from_slice(data);
    frame
}

/// Total 3E response length from its header
pub fn frame_len(header: &[u8]) -> Option<usize> {
    if header.len() < RESPONSE_HEADER_LEN || header[0..2] != SUBHEADER_RESPONSE {
        return None;
    }
    Some(RESPONSE_HEADER_LEN + u16::from_le_bytes([header[7], header[8]]) as usize)
}

pub(crate) const FRAMING: Framing = Framing {
    header_len: RESPONSE_HEADER_LEN,
    total_len: frame_len,
};

/// End code and response data of a 3E reply
///
/// `None` unless the subheader is right, the end code is present and the
/// declared length matches the frame.
pub fn parse_response(reply: &[u8]) -> Option<(u16, &[u8])> {
    if frame_len(reply)? != reply.len() || reply.len() < RESPONSE_HEADER_LEN + 2 {
        return None;
    }
    let end_code = u16::from_le_bytes([reply[9], reply[10]]);
    Some((end_code, &reply[11..]))
}

/// Mitsubishi MC protocol detection probe
#[derive(Debug, Clone, Copy, Default)]
pub struct McProbe;

#[async_trait]
impl WireProbe for McProbe {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::McProtocol
    }

    async fn probe_port(&self, host: &str, port: u16, deadline: Instant) -> PortOutcome {
        let frame = request(CMD_CPU_MODEL, 0x0000, &[], DEFAULT_TIMER);
        match tcp_exchange(host, port, &frame, FRAMING, deadline).await {
            Exchange::Unreachable => PortOutcome::unreachable(),
            Exchange::Reply(reply) => match parse_response(&reply) {
                Some((0, data)) => PortOutcome::matched(data.get(..16).and_then(ascii_field)),
                Some(_) => PortOutcome::matched(None),
                None => PortOutcome::not_matched(),
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

    /// Build a 3E response with an end code and data
    pub fn response(end_code: u16, data: &[u8]) -> Vec<u8> {
        let mut reply = SUBHEADER_RESPONSE.to_vec();
        reply.extend_from_slice(&[0x00, 0xFF, 0xFF, 0x03, 0x00]);
        reply.extend_from_slice(&((2 + data.len()) as u16).to_le_bytes());
        reply.extend_from_slice(&end_code.to_le_bytes());
        reply.extend_from_slice(data);
        reply
    }

    /// Length of a 3E request from its first 9 bytes
    pub fn request_len(header: &[u8]) -> usize {
        9 + u16::from_le_bytes([header[7], header[8]]) as usize
    }

    pub fn model_data(model: &str) -> Vec<u8> {
        let mut data = vec![b' '; 16];
        data[..model.len()].copy_from_slice(model.as_bytes());
        data.extend_from_slice(&0x0263u16.to_le_bytes());
        data
    }

    #[test]
    fn test_request_bytes() {
        assert_eq!(
            request(CMD_CPU_MODEL, 0, &[], DEFAULT_TIMER),
            vec![0x50, 0x00, 0x00, 0xFF, 0xFF, 0x03, 0x00, 0x06, 0x00, 0x10, 0x00, 0x01, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn test_response_length_must_match() {
        let reply = response(0, &model_data("Q03UDVCPU"));
        let (end, data) = parse_response(&reply).unwrap();
        assert_eq!(end, 0);
        assert_eq!(ascii_field(&data[..16]).as_deref(), Some("Q03UDVCPU"));

        let mut long = reply.clone();
        long.push(0);
        assert_eq!(parse_response(&long), None);
        assert_eq!(parse_response(&reply[..reply.len() - 1]), None);
    }

    #[test_log::test(tokio::test)]
    async fn test_probe_reads_model() {
        let port = spawn_tcp(9, request_len, |_| Some(response(0, &model_data("FX5U-32MR")))).await;
        let result = run_probe(&McProbe, "127.0.0.1", &[port], Duration::from_secs(1)).await;
        assert_eq!(result.outcome, ProbeOutcome::Matched);
        assert_eq!(result.identity.as_deref(), Some("FX5U-32MR"));
    }

    #[test_log::test(tokio::test)]
    async fn test_error_end_code_still_matches() {
        let port = spawn_tcp(9, request_len, |_| Some(response(0xC059, &[]))).await;
        let result = run_probe(&McProbe, "127.0.0.1", &[port], Duration::from_secs(1)).await;
        assert_eq!(result.outcome, ProbeOutcome::Matched);
        assert_eq!(result.identity, None);
    }
}
