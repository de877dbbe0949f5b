/*!
 * Siemens S7comm driver.
 *
 * ISO-on-TCP transport: TPKT framing over a COTP class 0 connection,
 * then S7comm jobs and user data requests. Works with S7-300/400 and with
 * S7-1200/1500 CPUs that allow PUT/GET access.
 */
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use plcbridge_core::config::SharedConfig;
use plcbridge_core::types::{Metadata, Value};

use super::transport::TcpTransport;
use super::{
    bits_of, check_count, decode_tag, encode_tag, is_bit, not_connected, resolve_target, tag_address,
    value_len, words_for,
};
use crate::address::{Address, MemoryArea};
use crate::device::{
    AccessLevel, DeviceError, DeviceInfo, ErrorSlot, PlcDevice, PlcMode, ProtectionStatus, Result,
};
use crate::probe::ascii_field;
use crate::probe::s7::{is_connect_confirm, tpkt_len, COTP_CR, FRAMING, TPKT_VERSION};
use crate::program::{Block, BlockInfo, BlockType, CodeLanguage, PlcProgram};
use crate::protocol::util::join_target;
use crate::protocol::{ProtocolOptions, RACK, SLOT};
use crate::tag::{ByteOrder, TagValue};
use crate::vendor::Vendor;

/// ISO-on-TCP port
pub const DEFAULT_PORT: u16 = 102;

const PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK: u8 = 0x02;
const ROSCTR_ACK_DATA: u8 = 0x03;
const ROSCTR_USERDATA: u8 = 0x07;

const FN_SETUP: u8 = 0xF0;
const FN_READ_VAR: u8 = 0x04;
const FN_WRITE_VAR: u8 = 0x05;
const FN_START_UPLOAD: u8 = 0x1D;
const FN_UPLOAD: u8 = 0x1E;
const FN_END_UPLOAD: u8 = 0x1F;
const FN_PLC_CONTROL: u8 = 0x28;
const FN_PLC_STOP: u8 = 0x29;

// transport sizes of a request item
const TS_BIT: u8 = 0x01;
const TS_BYTE: u8 = 0x02;
const TS_COUNTER: u8 = 0x1C;
const TS_TIMER: u8 = 0x1D;

// transport sizes of a data item
const DATA_BIT: u8 = 0x03;
const DATA_BYTE: u8 = 0x04;
const DATA_OCTET: u8 = 0x09;

const GROUP_BLOCK: u8 = 0x03;
const GROUP_CPU: u8 = 0x04;
const GROUP_SECURITY: u8 = 0x05;

const SZL_ORDER_NUMBER: u16 = 0x0011;
const SZL_COMPONENT_ID: u16 = 0x001C;
const SZL_PROTECTION: u16 = 0x0232;
const SZL_CPU_STATE: u16 = 0x0424;

/// PDU size asked for during setup
const PDU_SIZE: u16 = 960;
/// Bytes of a read response that are not payload
const READ_OVERHEAD: usize = 18;
/// Bytes of a write request that are not payload
const WRITE_OVERHEAD: usize = 35;
/// Local TSAP of a PG connection
const LOCAL_TSAP: u16 = 0x0100;
/// Variable items carry a 24-bit address
const MAX_ITEM_ADDRESS: u32 = 0xFF_FFFF;
const PROGRAM_INVOCATION: &[u8] = b"P_PROGRAM";

/// COTP connection request between two TSAPs
pub fn connect_request(local_tsap: u16, remote_tsap: u16) -> Vec<u8> {
    let mut frame = vec![
        TPKT_VERSION, 0x00, 0x00, 0x16, 0x11, COTP_CR, 0x00, 0x00, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A, 0xC1,
        0x02,
    ];
    frame.extend_from_slice(&local_tsap.to_be_bytes());
    frame.extend_from_slice(&[0xC2, 0x02]);
    frame.extend_from_slice(&remote_tsap.to_be_bytes());
    frame
}

/// Remote TSAP addressing the CPU in `rack` / `slot`
pub fn remote_tsap(rack: u16, slot: u16) -> u16 {
    0x0100 | ((rack * 32 + slot) & 0xFF)
}

/// Wrap an S7comm PDU in COTP data and TPKT framing
fn pdu_frame(rosctr: u8, pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
    let total = 7 + 10 + params.len() + data.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&[TPKT_VERSION, 0x00]);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(&[0x02, 0xF0, 0x80]);
    frame.extend_from_slice(&[PROTOCOL_ID, rosctr, 0x00, 0x00]);
    frame.extend_from_slice(&pdu_ref.to_be_bytes());
    frame.extend_from_slice(&(params.len() as u16).to_be_bytes());
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    frame.extend_from_slice(params);
    frame.extend_from_slice(data);
    frame
}

/// A decoded S7comm PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S7Pdu {
    /// Message type
    pub rosctr: u8,
    /// PDU reference echoed from the request
    pub pdu_ref: u16,
    /// Error class and code of an acknowledgement
    pub error: u16,
    /// Parameter block
    pub params: Vec<u8>,
    /// Data block
    pub data: Vec<u8>,
}

/// Decode a TPKT frame carrying an S7comm PDU
pub fn parse_pdu(frame: &[u8]) -> Option<S7Pdu> {
    if frame.len() < 17 || tpkt_len(frame)? != frame.len() || frame[5] != 0xF0 {
        return None;
    }
    let s7 = &frame[7..];
    if s7[0] != PROTOCOL_ID {
        return None;
    }
    let rosctr = s7[1];
    let header = if matches!(rosctr, ROSCTR_ACK | ROSCTR_ACK_DATA) { 12 } else { 10 };
    if s7.len() < header {
        return None;
    }
    let be = |i: usize| u16::from_be_bytes([s7[i], s7[i + 1]]);
    let plen = be(6) as usize;
    let dlen = be(8) as usize;

    Some(S7Pdu {
        rosctr,
        pdu_ref: be(4),
        error: if header == 12 { be(10) } else { 0 },
        params: s7.get(header..header + plen)?.to_vec(),
        data: s7.get(header + plen..header + plen + dlen)?.to_vec(),
    })
}

/// Encode a session password the way S7 CPUs expect it
pub fn encode_password(password: &str) -> Result<[u8; 8]> {
    if password.len() > 8 {
        return Err(DeviceError::invalid_value("password", "S7 passwords are at most 8 characters"));
    }
    let mut plain = [b' '; 8];
    plain[..password.len()].copy_from_slice(password.as_bytes());

    let mut encoded = [0u8; 8];
    encoded[0] = plain[0] ^ 0x55;
    encoded[1] = plain[1] ^ 0x55;
    for i in 2..8 {
        encoded[i] = plain[i] ^ 0x55 ^ encoded[i - 2];
    }
    Ok(encoded)
}

/// First and last item address covered by `units` consecutive units of
/// `width` item addresses each. Timers and counters are addressed by element
/// number, everything else by bit position.
fn item_range(address: &Address, width: u32, units: usize) -> Result<(u32, u32)> {
    let first = match address.area {
        MemoryArea::Timer | MemoryArea::Counter => Some(address.offset),
        _ => address
            .offset
            .checked_mul(8)
            .and_then(|pos| pos.checked_add(u32::from(address.bit_offset.unwrap_or(0)))),
    };
    let span = u32::try_from(units).ok().and_then(|n| n.checked_mul(width));
    let last = first
        .zip(span)
        .and_then(|(first, span)| first.checked_add(span.checked_sub(1)?));
    match first.zip(last) {
        Some((first, last)) if last <= MAX_ITEM_ADDRESS => Ok((first, last)),
        _ => Err(DeviceError::invalid_value(
            address.to_string(),
            format!("{} units from offset {} do not fit a 24-bit item address", units, address.offset),
        )),
    }
}

fn var_item(area: u8, db: u16, address: u32, transport_size: u8, count: u16) -> [u8; 12] {
    let count = count.to_be_bytes();
    let db = db.to_be_bytes();
    [
        0x12,
        0x0A,
        0x10,
        transport_size,
        count[0],
        count[1],
        db[0],
        db[1],
        area,
        (address >> 16) as u8,
        (address >> 8) as u8,
        address as u8,
    ]
}

fn return_code_message(code: u8) -> String {
    match code {
        0x01 => "hardware fault".to_string(),
        0x03 => "access to object denied".to_string(),
        0x05 => "address out of range".to_string(),
        0x06 => "data type not supported".to_string(),
        0x07 => "data type inconsistent".to_string(),
        0x0A => "object does not exist".to_string(),
        other => format!("return code 0x{:02X}", other),
    }
}

/// Payload of the single data item of a read response
fn read_item(data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let code = *data.first().ok_or("empty read response")?;
    if code != 0xFF {
        return Err(return_code_message(code));
    }
    if data.len() < 4 {
        return Err("truncated data item".to_string());
    }
    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    let bytes = match data[1] {
        DATA_BYTE | 0x05 => (length + 7) / 8,
        _ => length,
    };
    data.get(4..4 + bytes)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| "data item shorter than its length".to_string())
}

fn area_of(address: &Address) -> Result<(u8, u16)> {
    let code = match address.area {
        MemoryArea::Input => 0x81,
        MemoryArea::Output => 0x82,
        MemoryArea::Memory => 0x83,
        MemoryArea::Data => 0x84,
        MemoryArea::Counter => 0x1C,
        MemoryArea::Timer => 0x1D,
        MemoryArea::Special => {
            return Err(DeviceError::unsupported(
                Vendor::Siemens,
                format!("access to {} memory", address.area),
            ))
        }
    };
    let db = if address.area == MemoryArea::Data {
        let block = address.block.unwrap_or(1);
        u16::try_from(block)
            .map_err(|_| DeviceError::invalid_value(address.to_string(), "data block number out of range"))?
    } else {
        0
    };
    Ok((code, db))
}

fn block_type_code(block_type: BlockType) -> Option<u8> {
    match block_type {
        BlockType::OB => Some(b'8'),
        BlockType::DB => Some(b'A'),
        BlockType::FC => Some(b'C'),
        BlockType::FB => Some(b'E'),
        _ => None,
    }
}

fn block_language(code: u8) -> Option<CodeLanguage> {
    match code {
        0x01 => Some(CodeLanguage::InstructionList),
        0x02 => Some(CodeLanguage::Ladder),
        0x03 => Some(CodeLanguage::FunctionBlock),
        0x04 => Some(CodeLanguage::StructuredText),
        0x06 => Some(CodeLanguage::Graph),
        _ => None,
    }
}

fn block_name(block_type: BlockType, number: u32) -> String {
    format!("{:?}{}", block_type, number)
}

/// File name of a block in upload requests: `_0A00001A` for DB1
fn upload_filename(code: u8, number: u32) -> Vec<u8> {
    format!("_0{}{:05}A", code as char, number).into_bytes()
}

fn be16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn szl_text(records: &[Vec<u8>], index: u16) -> Option<String> {
    records
        .iter()
        .find(|r| r.len() > 2 && be16(r) == index)
        .and_then(|r| ascii_field(&r[2..]))
}

/// An open S7 connection
#[derive(Debug)]
struct Session {
    transport: TcpTransport,
    pdu_ref: u16,
    pdu_size: usize,
}

impl Session {
    async fn open(
        host: &str,
        port: u16,
        remote_tsap: u16,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let mut transport =
            TcpTransport::connect(Vendor::Siemens, host, port, connect_timeout, request_timeout).await?;

        let reply = transport
            .request(&connect_request(LOCAL_TSAP, remote_tsap), FRAMING)
            .await?;
        if !is_connect_confirm(&reply) {
            return Err(DeviceError::connection(
                Vendor::Siemens,
                transport.target(),
                "COTP connection refused, check rack and slot",
            ));
        }

        let mut session = Self {
            transport,
            pdu_ref: 0,
            pdu_size: PDU_SIZE as usize,
        };

        let mut params = vec![FN_SETUP, 0x00, 0x00, 0x01, 0x00, 0x01];
        params.extend_from_slice(&PDU_SIZE.to_be_bytes());
        let setup = match session.exchange(ROSCTR_JOB, &params).await {
            Ok(setup) => setup,
            Err(DeviceError::ProtocolError { target, message, .. }) => {
                return Err(DeviceError::connection(
                    Vendor::Siemens,
                    target,
                    format!("communication setup rejected: {}", message),
                ))
            }
            Err(e) => return Err(e),
        };
        if setup.params.len() < 8 {
            return Err(session.protocol("short communication setup response"));
        }
        session.pdu_size = (be16(&setup.params[6..8]) as usize).clamp(READ_OVERHEAD + 2 * WRITE_OVERHEAD, PDU_SIZE as usize);
        Ok(session)
    }

    fn protocol<M: ToString>(&self, message: M) -> DeviceError {
        DeviceError::protocol(Vendor::Siemens, self.transport.target(), message)
    }

    async fn exchange(&mut self, rosctr: u8, params: &[u8]) -> Result<S7Pdu> {
        self.exchange_data(rosctr, params, &[]).await
    }

    async fn exchange_data(&mut self, rosctr: u8, params: &[u8], data: &[u8]) -> Result<S7Pdu> {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        let frame = pdu_frame(rosctr, self.pdu_ref, params, data);
        let reply = self.transport.request(&frame, FRAMING).await?;

        let pdu = parse_pdu(&reply).ok_or_else(|| self.protocol("malformed S7 PDU"))?;
        if pdu.pdu_ref != self.pdu_ref {
            return Err(self.protocol(format!(
                "PDU reference {} does not match request {}",
                pdu.pdu_ref, self.pdu_ref
            )));
        }
        if pdu.error != 0 {
            return Err(self.protocol(format!(
                "error class 0x{:02X} code 0x{:02X}",
                pdu.error >> 8,
                pdu.error & 0xFF
            )));
        }
        Ok(pdu)
    }

    async fn read_var(&mut self, area: u8, db: u16, address: u32, transport_size: u8, count: usize) -> Result<Vec<u8>> {
        let mut params = vec![FN_READ_VAR, 0x01];
        params.extend_from_slice(&var_item(area, db, address, transport_size, count as u16));
        let pdu = self.exchange(ROSCTR_JOB, &params).await?;
        read_item(&pdu.data).map_err(|m| self.protocol(m))
    }

    async fn write_var(&mut self, area: u8, db: u16, address: u32, transport_size: u8, count: usize, payload: &[u8]) -> Result<()> {
        let mut params = vec![FN_WRITE_VAR, 0x01];
        params.extend_from_slice(&var_item(area, db, address, transport_size, count as u16));

        let (data_size, length) = match transport_size {
            TS_BIT => (DATA_BIT, payload.len()),
            TS_BYTE => (DATA_BYTE, payload.len() * 8),
            _ => (DATA_OCTET, payload.len()),
        };
        let mut data = vec![0x00, data_size];
        data.extend_from_slice(&(length as u16).to_be_bytes());
        data.extend_from_slice(payload);

        let pdu = self.exchange_data(ROSCTR_JOB, &params, &data).await?;
        match pdu.data.first() {
            Some(0xFF) => Ok(()),
            Some(code) => Err(self.protocol(return_code_message(*code))),
            None => Err(self.protocol("empty write response")),
        }
    }

    /// Read consecutive bytes, split to fit the negotiated PDU
    async fn read_bytes(&mut self, area: u8, db: u16, start: u32, count: usize) -> Result<Vec<u8>> {
        let chunk = self.pdu_size - READ_OVERHEAD;
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let n = chunk.min(count - out.len());
            let offset = start + out.len() as u32;
            let bytes = self.read_var(area, db, offset * 8, TS_BYTE, n).await?;
            if bytes.len() != n {
                return Err(self.protocol(format!("asked for {} bytes, got {}", n, bytes.len())));
            }
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    async fn write_bytes(&mut self, area: u8, db: u16, start: u32, data: &[u8]) -> Result<()> {
        let chunk = self.pdu_size - WRITE_OVERHEAD;
        for (i, part) in data.chunks(chunk).enumerate() {
            let offset = start + (i * chunk) as u32;
            self.write_var(area, db, offset * 8, TS_BYTE, part.len(), part).await?;
        }
        Ok(())
    }

    async fn userdata(&mut self, group: u8, subfunction: u8, data: &[u8]) -> Result<Vec<u8>> {
        let params = [0x00, 0x01, 0x12, 0x04, 0x11, 0x40 | group, subfunction, 0x00];
        let pdu = self.exchange_data(ROSCTR_USERDATA, &params, data).await?;
        if pdu.params.len() >= 12 {
            let error = be16(&pdu.params[10..12]);
            if error != 0 {
                return Err(self.protocol(format!("user data error 0x{:04X}", error)));
            }
        }
        match pdu.data.first() {
            Some(0xFF) | None => Ok(pdu.data.get(4..).map(<[u8]>::to_vec).unwrap_or_default()),
            Some(code) => Err(self.protocol(return_code_message(*code))),
        }
    }

    /// Read a system status list and split it into records
    async fn read_szl(&mut self, id: u16, index: u16) -> Result<Vec<Vec<u8>>> {
        let mut request = vec![0xFF, 0x09, 0x00, 0x04];
        request.extend_from_slice(&id.to_be_bytes());
        request.extend_from_slice(&index.to_be_bytes());
        let data = self.userdata(GROUP_CPU, 0x01, &request).await?;

        if data.len() < 8 {
            return Err(self.protocol(format!("truncated SZL 0x{:04X} response", id)));
        }
        let record_len = be16(&data[4..6]) as usize;
        let count = be16(&data[6..8]) as usize;
        if record_len == 0 {
            return Ok(Vec::new());
        }
        Ok(data[8..]
            .chunks_exact(record_len)
            .take(count)
            .map(<[u8]>::to_vec)
            .collect())
    }

    async fn control(&mut self, params: &[u8]) -> Result<()> {
        let pdu = self.exchange(ROSCTR_JOB, params).await?;
        if pdu.params.first() != params.first() {
            return Err(self.protocol("unexpected PLC control response"));
        }
        Ok(())
    }
}

/// Siemens S7 driver
#[derive(Debug)]
pub struct SiemensDriver {
    config: SharedConfig,
    session: Option<Session>,
    target: Option<String>,
    rack: u16,
    slot: u16,
    info: Option<DeviceInfo>,
    errors: ErrorSlot,
}

impl SiemensDriver {
    /// Create a disconnected driver
    pub fn new(config: SharedConfig) -> Self {
        let rack = config.get().connection.rack;
        let slot = config.get().connection.slot;
        Self {
            config,
            session: None,
            target: None,
            rack,
            slot,
            info: None,
            errors: ErrorSlot::default(),
        }
    }

    fn session(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or_else(|| not_connected(&self.target))
    }

    async fn open(&mut self, address: &str, options: &ProtocolOptions) -> Result<()> {
        let config = self.config.clone();
        let connection = &config.get().connection;
        let (host, port) = resolve_target(address, options, DEFAULT_PORT)?;
        let rack = options.get_u16(RACK)?.unwrap_or(connection.rack);
        let slot = options.get_u16(SLOT)?.unwrap_or(connection.slot);

        self.close().await;
        self.target = Some(join_target(&host, port));
        debug!("Connecting to S7 CPU at {}:{} rack {} slot {}", host, port, rack, slot);

        let session = Session::open(
            &host,
            port,
            remote_tsap(rack, slot),
            options.timeout_or(connection.connect_timeout()),
            options.timeout_or(connection.request_timeout()),
        )
        .await?;
        info!(
            "Connected to S7 CPU at {}:{} (rack {}, slot {}, PDU {} bytes)",
            host, port, rack, slot, session.pdu_size
        );
        self.session = Some(session);
        self.rack = rack;
        self.slot = slot;

        let info = match self.read_identity(&host).await {
            Ok(info) => info,
            Err(e) if !e.is_transport_failure() => {
                warn!("Could not read S7 identity from {}: {}", host, e);
                let mut info = DeviceInfo::new(Vendor::Siemens, host);
                info.rack = Some(rack);
                info.slot = Some(slot);
                info
            }
            Err(e) => {
                self.session = None;
                return Err(e);
            }
        };
        self.info = Some(info);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.transport.shutdown().await;
            info!("Disconnected from S7 CPU at {}", session.transport.target());
        }
        self.info = None;
    }

    async fn read_identity(&mut self, host: &str) -> Result<DeviceInfo> {
        let (rack, slot) = (self.rack, self.slot);
        let session = self.session()?;
        let order = session.read_szl(SZL_ORDER_NUMBER, 0x0000).await?;
        let component = session.read_szl(SZL_COMPONENT_ID, 0x0000).await?;

        let mut info = DeviceInfo::new(Vendor::Siemens, host);
        info.rack = Some(rack);
        info.slot = Some(slot);

        let order_number = order
            .iter()
            .find(|r| r.len() >= 22 && be16(r) == 0x0001)
            .and_then(|r| ascii_field(&r[2..22]));
        if let Some(firmware) = order.iter().rev().find(|r| r.len() >= 28) {
            info.firmware = format!("V{}.{}.{}", firmware[25], firmware[26], firmware[27]);
        }
        info.model = szl_text(&component, 0x0007)
            .or_else(|| order_number.clone())
            .unwrap_or_default();
        info.name = szl_text(&component, 0x0001).unwrap_or_default();
        info.serial = szl_text(&component, 0x0005).unwrap_or_default();
        if let Some(order_number) = order_number {
            info.additional
                .insert("order_code".to_string(), Value::String(order_number));
        }
        if let Some(module) = szl_text(&component, 0x0002) {
            info.additional.insert("module_name".to_string(), Value::String(module));
        }
        Ok(info)
    }

    async fn read_protection(&mut self) -> Result<ProtectionStatus> {
        let session = self.session()?;
        let records = session.read_szl(SZL_PROTECTION, 0x0004).await?;
        let record = records
            .iter()
            .find(|r| r.len() >= 12)
            .ok_or_else(|| session.protocol("SZL 0x0232 has no protection record"))?;

        let level = be16(&record[2..4]);
        let access_level = match level {
            0 | 1 => AccessLevel::Full,
            2 => AccessLevel::ReadOnly,
            _ => AccessLevel::None,
        };
        let mut details = Metadata::new();
        for (i, key) in ["sch_schal", "sch_par", "sch_rel", "bart_sch", "anl_sch"].iter().enumerate() {
            let at = 2 + i * 2;
            details.insert(key.to_string(), Value::from(be16(&record[at..at + 2])));
        }

        Ok(ProtectionStatus {
            cpu_protected: level > 1,
            access_level,
            details,
            ..ProtectionStatus::default()
        })
    }

    async fn read_area(&mut self, address: &Address, count: usize) -> Result<Vec<u8>> {
        check_count(address, count)?;
        let (area, db) = area_of(address)?;
        let session = self.session()?;

        match address.area {
            MemoryArea::Timer | MemoryArea::Counter => {
                let size = if address.area == MemoryArea::Timer { TS_TIMER } else { TS_COUNTER };
                let max = (session.pdu_size - READ_OVERHEAD) / 2;
                let mut out = Vec::with_capacity(count + 1);
                let (mut element, _) = item_range(address, 1, words_for(count))?;
                let mut remaining = words_for(count);
                while remaining > 0 {
                    let n = remaining.min(max);
                    out.extend(session.read_var(area, db, element, size, n).await?);
                    element += n as u32;
                    remaining -= n;
                }
                out.truncate(count);
                Ok(out)
            }
            _ if is_bit(address) => {
                let (first, last) = item_range(address, 1, count)?;
                let base = first / 8;
                let bytes = session
                    .read_bytes(area, db, base, (last / 8 - base + 1) as usize)
                    .await?;
                Ok((first..=last)
                    .map(|pos| {
                        let rel = pos - base * 8;
                        (bytes[(rel / 8) as usize] >> (rel % 8)) & 0x01
                    })
                    .collect())
            }
            _ => {
                item_range(address, 8, count)?;
                session.read_bytes(area, db, address.offset, count).await
            }
        }
    }

    async fn write_area(&mut self, address: &Address, data: &[u8]) -> Result<()> {
        check_count(address, data.len())?;
        let (area, db) = area_of(address)?;
        let session = self.session()?;

        match address.area {
            MemoryArea::Timer | MemoryArea::Counter => {
                if data.len() % 2 != 0 {
                    return Err(DeviceError::invalid_value(
                        address.to_string(),
                        "timer and counter values are 2 bytes each",
                    ));
                }
                let size = if address.area == MemoryArea::Timer { TS_TIMER } else { TS_COUNTER };
                let (element, _) = item_range(address, 1, data.len() / 2)?;
                session
                    .write_var(area, db, element, size, data.len() / 2, data)
                    .await
            }
            _ if is_bit(address) => {
                let (first, _) = item_range(address, 1, data.len())?;
                for (i, bit) in bits_of(data).into_iter().enumerate() {
                    session
                        .write_var(area, db, first + i as u32, TS_BIT, 1, &[u8::from(bit)])
                        .await?;
                }
                Ok(())
            }
            _ => {
                item_range(address, 8, data.len())?;
                session.write_bytes(area, db, address.offset, data).await
            }
        }
    }

    async fn read_value(&mut self, name: &str) -> Result<TagValue> {
        let address = tag_address(Vendor::Siemens, name)?;
        let bytes = self.read_area(&address, value_len(&address)).await?;
        decode_tag(name, &address, &bytes, ByteOrder::Big)
    }

    async fn write_value(&mut self, name: &str, value: &Value) -> Result<()> {
        let address = tag_address(Vendor::Siemens, name)?;
        let bytes = encode_tag(name, &address, value, ByteOrder::Big)?;
        self.write_area(&address, &bytes).await
    }

    async fn read_mode(&mut self) -> Result<PlcMode> {
        let session = self.session()?;
        let records = session.read_szl(SZL_CPU_STATE, 0x0000).await?;
        let mode = match records.first().and_then(|r| r.get(3)) {
            Some(0x08) => PlcMode::Run,
            Some(0x04) => PlcMode::Stop,
            _ => PlcMode::Unknown,
        };
        Ok(mode)
    }

    async fn list_blocks(&mut self) -> Result<Vec<BlockInfo>> {
        let session = self.session()?;
        let mut blocks = Vec::new();
        for block_type in [BlockType::OB, BlockType::FB, BlockType::FC, BlockType::DB] {
            let Some(code) = block_type_code(block_type) else {
                continue;
            };
            let data = match session
                .userdata(GROUP_BLOCK, 0x02, &[0xFF, 0x09, 0x00, 0x02, 0x30, code])
                .await
            {
                Ok(data) => data,
                Err(e) if !e.is_transport_failure() => {
                    debug!("No {:?} blocks listed: {}", block_type, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            for entry in data.chunks_exact(4) {
                let number = u32::from(be16(entry));
                if number == 0 {
                    continue;
                }
                let mut info = BlockInfo::new(block_type, number);
                info.name = block_name(block_type, number);
                info.language = block_language(entry[3]);
                blocks.push(info);
            }
        }
        Ok(blocks)
    }

    async fn upload_block(&mut self, info: &BlockInfo) -> Result<Block> {
        let code = block_type_code(info.block_type)
            .ok_or_else(|| DeviceError::unsupported(Vendor::Siemens, format!("upload of {:?} blocks", info.block_type)))?;
        let session = self.session()?;

        let filename = upload_filename(code, info.number);
        let mut params = vec![FN_START_UPLOAD, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, filename.len() as u8];
        params.extend_from_slice(&filename);
        let start = session.exchange(ROSCTR_JOB, &params).await?;
        let upload_id = start
            .params
            .get(4..8)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| session.protocol("start upload response has no upload id"))?;

        let mut code_bytes = Vec::new();
        loop {
            let mut params = vec![FN_UPLOAD, 0x00, 0x00, 0x00];
            params.extend_from_slice(&upload_id);
            let part = session.exchange(ROSCTR_JOB, &params).await?;
            if part.data.len() >= 4 {
                let length = be16(&part.data[0..2]) as usize;
                let bytes = part
                    .data
                    .get(4..4 + length)
                    .ok_or_else(|| session.protocol("upload segment shorter than its length"))?;
                code_bytes.extend_from_slice(bytes);
            }
            if part.params.get(1) != Some(&0x01) {
                break;
            }
        }

        let mut params = vec![FN_END_UPLOAD, 0x00, 0x00, 0x00];
        params.extend_from_slice(&upload_id);
        session.exchange(ROSCTR_JOB, &params).await?;

        let mut info = info.clone();
        info.size = code_bytes.len() as u32;
        debug!("Uploaded {} ({} bytes)", info.name, info.size);
        Ok(Block::compiled(info, code_bytes))
    }

    async fn upload(&mut self) -> Result<PlcProgram> {
        let model = self.info.as_ref().map(|i| i.model.clone()).unwrap_or_default();
        let mut program = PlcProgram::new(Vendor::Siemens, model);
        for info in self.list_blocks().await? {
            match self.upload_block(&info).await {
                Ok(block) => program.blocks.push(block),
                Err(e) if !e.is_transport_failure() => warn!("Skipping {}: {}", info.name, e),
                Err(e) => return Err(e),
            }
        }
        info!("Uploaded {} blocks from S7 CPU", program.blocks.len());
        Ok(program)
    }

    async fn run(&mut self) -> Result<()> {
        let session = self.session()?;
        let mut hot = vec![FN_PLC_CONTROL, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFD, 0x00, 0x00];
        hot.push(PROGRAM_INVOCATION.len() as u8);
        hot.extend_from_slice(PROGRAM_INVOCATION);
        match session.control(&hot).await {
            Ok(()) => Ok(()),
            Err(e) if !e.is_transport_failure() => {
                debug!("Hot start refused ({}), trying cold start", e);
                let mut cold = vec![FN_PLC_CONTROL, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFD, 0x00, 0x02, b'C', b' '];
                cold.push(PROGRAM_INVOCATION.len() as u8);
                cold.extend_from_slice(PROGRAM_INVOCATION);
                session.control(&cold).await
            }
            Err(e) => Err(e),
        }
    }

    async fn halt(&mut self) -> Result<()> {
        let session = self.session()?;
        let mut params = vec![FN_PLC_STOP, 0x00, 0x00, 0x00, 0x00, 0x00];
        params.push(PROGRAM_INVOCATION.len() as u8);
        params.extend_from_slice(PROGRAM_INVOCATION);
        session.control(&params).await
    }

    async fn set_password(&mut self, secret: &str) -> Result<()> {
        let encoded = encode_password(secret)?;
        let session = self.session()?;
        let mut data = vec![0xFF, 0x09, 0x00, 0x08];
        data.extend_from_slice(&encoded);
        session.userdata(GROUP_SECURITY, 0x01, &data).await?;
        debug!("Session password accepted");
        Ok(())
    }

    async fn clear_password(&mut self) -> Result<()> {
        let session = self.session()?;
        session
            .userdata(GROUP_SECURITY, 0x02, &[0x0A, 0x00, 0x00, 0x00])
            .await
            .map(|_| ())
    }

    async fn diagnostics(&mut self) -> Result<Metadata> {
        let mut diagnostics = Metadata::new();
        diagnostics.insert("vendor".to_string(), Value::from(Vendor::Siemens.as_str()));
        diagnostics.insert("connected".to_string(), Value::Bool(self.session.is_some()));
        diagnostics.insert("rack".to_string(), Value::from(self.rack));
        diagnostics.insert("slot".to_string(), Value::from(self.slot));
        if let Some(pdu_size) = self.session.as_ref().map(|s| s.pdu_size) {
            diagnostics.insert("pdu_size".to_string(), Value::from(pdu_size as u32));
            let mode = self.read_mode().await?;
            diagnostics.insert("cpu_state".to_string(), Value::from(format!("{:?}", mode)));
            let protection = self.read_protection().await?;
            diagnostics.insert("protection".to_string(), Value::Struct(protection.details));
        }
        if let Some(error) = self.errors.get() {
            diagnostics.insert("last_error".to_string(), Value::String(error));
        }
        Ok(diagnostics)
    }
}

#[async_trait]
impl PlcDevice for SiemensDriver {
    fn vendor(&self) -> Vendor {
        Vendor::Siemens
    }

    async fn connect(&mut self, address: &str, options: &ProtocolOptions) -> Result<()> {
        let result = self.open(address, options).await;
        self.errors.record(result)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.close().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn last_error(&self) -> Option<String> {
        self.errors.get()
    }

    async fn get_device_info(&mut self) -> Result<DeviceInfo> {
        let result = match &self.info {
            Some(info) if self.session.is_some() => Ok(info.clone()),
            _ => Err(not_connected(&self.target)),
        };
        self.errors.record(result)
    }

    async fn get_protection_status(&mut self) -> Result<ProtectionStatus> {
        let result = self.read_protection().await;
        self.errors.record(result)
    }

    async fn read_memory(&mut self, address: &Address, count: usize) -> Result<Vec<u8>> {
        let result = self.read_area(address, count).await;
        self.errors.record(result)
    }

    async fn write_memory(&mut self, address: &Address, data: &[u8]) -> Result<()> {
        let result = self.write_area(address, data).await;
        self.errors.record(result)
    }

    async fn read_tag(&mut self, name: &str) -> Result<TagValue> {
        let result = self.read_value(name).await;
        self.errors.record(result)
    }

    async fn write_tag(&mut self, name: &str, value: &Value) -> Result<()> {
        let result = self.write_value(name, value).await;
        self.errors.record(result)
    }

    async fn upload_program(&mut self) -> Result<PlcProgram> {
        let result = self.upload().await;
        self.errors.record(result)
    }

    async fn get_block_list(&mut self) -> Result<Vec<BlockInfo>> {
        let result = self.list_blocks().await;
        self.errors.record(result)
    }

    async fn start(&mut self) -> Result<()> {
        let result = self.run().await;
        self.errors.record(result)
    }

    async fn stop(&mut self) -> Result<()> {
        let result = self.halt().await;
        self.errors.record(result)
    }

    async fn get_mode(&mut self) -> Result<PlcMode> {
        let result = self.read_mode().await;
        self.errors.record(result)
    }

    async fn authenticate(&mut self, secret: &str) -> Result<()> {
        let result = self.set_password(secret).await;
        self.errors.record(result)
    }

    async fn clear_authentication(&mut self) -> Result<()> {
        let result = self.clear_password().await;
        self.errors.record(result)
    }

    async fn get_diagnostics(&mut self) -> Result<Metadata> {
        let result = self.diagnostics().await;
        self.errors.record(result)
    }
}
