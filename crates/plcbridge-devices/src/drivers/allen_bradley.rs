/*!
 * Allen-Bradley EtherNet/IP driver.
 *
 * Logix controllers are reached through the symbolic Read Tag / Write Tag
 * services, routed to the CPU slot with Unconnected Send. Data table
 * addresses (`N7:0`, `B3:1/4`, `L9:2`) go through the PCCC object the way
 * SLC 500, MicroLogix and PLC-5 controllers expect them.
 */
use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use plcbridge_core::config::SharedConfig;
use plcbridge_core::types::{Metadata, Value};

use super::transport::TcpTransport;
use super::{check_count, decode_tag, encode_tag, is_bit, not_connected, resolve_target, value_len, words_for};
use crate::address::{self, Address, BitWidth, MemoryArea};
use crate::device::{DeviceError, DeviceInfo, ErrorSlot, PlcDevice, PlcMode, ProtectionStatus, Result};
use crate::probe::enip::{encapsulation_header, parse_identity, Identity, FRAMING, HEADER_LEN, LIST_IDENTITY};
use crate::program::{BlockInfo, BlockType, CodeLanguage, PlcProgram};
use crate::protocol::util::join_target;
use crate::protocol::{ProtocolOptions, SLOT};
use crate::tag::{ByteOrder, DataType, TagValue};
use crate::vendor::Vendor;

/// EtherNet/IP explicit messaging port
pub const DEFAULT_PORT: u16 = 44818;
/// Backplane slot of the CPU unless the `slot` option says otherwise
pub const DEFAULT_SLOT: u8 = 0;

const REGISTER_SESSION: u16 = 0x0065;
const SEND_RR_DATA: u16 = 0x006F;
const ITEM_UNCONNECTED: u16 = 0x00B2;

const SERVICE_READ_TAG: u8 = 0x4C;
const SERVICE_WRITE_TAG: u8 = 0x4D;
const SERVICE_EXECUTE_PCCC: u8 = 0x4B;
const SERVICE_UNCONNECTED_SEND: u8 = 0x52;
const SERVICE_INSTANCE_LIST: u8 = 0x55;

const STATUS_PARTIAL: u8 = 0x06;

const CONNECTION_MANAGER: [u8; 4] = [0x20, 0x06, 0x24, 0x01];
const PCCC_OBJECT: [u8; 4] = [0x20, 0x67, 0x24, 0x01];
const SYMBOL_CLASS: u8 = 0x6B;

const PCCC_COMMAND: u8 = 0x0F;
const PCCC_READ: u8 = 0xA2;
const PCCC_WRITE: u8 = 0xAA;
/// Largest PCCC payload per request
const PCCC_CHUNK: usize = 200;
/// Length byte, vendor id and serial number of this requestor
const REQUESTOR_ID: [u8; 7] = [0x07, 0x4D, 0x00, 0x2E, 0x5A, 0x1B, 0x00];
/// Sub-element holding the accumulator of a timer or counter
const ACC: u32 = 2;
/// Structured tag marker in a Read Tag reply
const STRUCT_TYPE: u16 = 0x02A0;

/// CIP elementary type codes
pub mod cip_type {
    /// BOOL
    pub const BOOL: u16 = 0x00C1;
    /// SINT
    pub const SINT: u16 = 0x00C2;
    /// INT
    pub const INT: u16 = 0x00C3;
    /// DINT
    pub const DINT: u16 = 0x00C4;
    /// USINT
    pub const USINT: u16 = 0x00C6;
    /// UINT
    pub const UINT: u16 = 0x00C7;
    /// UDINT
    pub const UDINT: u16 = 0x00C8;
    /// REAL
    pub const REAL: u16 = 0x00CA;
    /// LREAL
    pub const LREAL: u16 = 0x00CB;
    /// BYTE
    pub const BYTE: u16 = 0x00D1;
    /// WORD
    pub const WORD: u16 = 0x00D2;
    /// DWORD
    pub const DWORD: u16 = 0x00D3;
}

fn data_type(cip: u16) -> Option<DataType> {
    match cip {
        cip_type::BOOL => Some(DataType::Bool),
        cip_type::SINT | cip_type::USINT | cip_type::BYTE => Some(DataType::Byte),
        cip_type::INT => Some(DataType::Int),
        cip_type::UINT | cip_type::WORD => Some(DataType::Word),
        cip_type::DINT => Some(DataType::DInt),
        cip_type::UDINT | cip_type::DWORD => Some(DataType::DWord),
        cip_type::REAL => Some(DataType::Real),
        cip_type::LREAL => Some(DataType::LReal),
        _ => None,
    }
}

/// Logix name of a CIP type code
pub fn type_name(cip: u16) -> String {
    let name = match cip & 0x0FFF {
        cip_type::BOOL => "BOOL",
        cip_type::SINT => "SINT",
        cip_type::INT => "INT",
        cip_type::DINT => "DINT",
        cip_type::USINT => "USINT",
        cip_type::UINT => "UINT",
        cip_type::UDINT => "UDINT",
        cip_type::REAL => "REAL",
        cip_type::LREAL => "LREAL",
        cip_type::BYTE => "BYTE",
        cip_type::WORD => "WORD",
        cip_type::DWORD => "DWORD",
        _ if cip & 0x8000 != 0 => "STRUCT",
        _ => return format!("0x{:04X}", cip),
    };
    name.to_string()
}

fn decode_value(cip: u16, bytes: &[u8]) -> Option<(Value, DataType)> {
    if cip == cip_type::SINT {
        return Some((Value::from(*bytes.first()? as i8), DataType::Byte));
    }
    let data_type = data_type(cip)?;
    Some((data_type.decode(bytes, ByteOrder::Little)?, data_type))
}

fn encode_value(cip: u16, value: &Value, tag: &str) -> Result<Vec<u8>> {
    match cip {
        cip_type::BOOL => {
            let b = value
                .as_bool()
                .ok_or_else(|| DeviceError::invalid_value(tag, format!("expected a boolean, got {}", value)))?;
            Ok(vec![if b { 0xFF } else { 0x00 }])
        }
        cip_type::SINT => {
            let i = value
                .as_integer()
                .and_then(|i| i8::try_from(i).ok())
                .ok_or_else(|| DeviceError::invalid_value(tag, format!("{} does not fit a SINT", value)))?;
            Ok(vec![i as u8])
        }
        _ => data_type(cip)
            .ok_or_else(|| DeviceError::invalid_value(tag, format!("cannot write CIP type {}", type_name(cip))))?
            .encode(value, ByteOrder::Little, tag),
    }
}

/// Encode a symbolic tag name (`Tag`, `Arr[3]`, `Program:Main.Udt.Member`) as a request path
pub fn tag_path(name: &str) -> Option<Vec<u8>> {
    let mut path = Vec::new();
    for segment in name.split('.') {
        let (symbol, indices) = match segment.split_once('[') {
            Some((symbol, rest)) => (symbol, Some(rest.strip_suffix(']')?)),
            None => (segment, None),
        };
        if symbol.is_empty() || symbol.len() > 255 || !symbol.is_ascii() {
            return None;
        }
        path.extend_from_slice(&[0x91, symbol.len() as u8]);
        path.extend_from_slice(symbol.as_bytes());
        if symbol.len() % 2 == 1 {
            path.push(0x00);
        }
        for index in indices.into_iter().flat_map(|i| i.split(',')) {
            let index: u32 = index.trim().parse().ok()?;
            match index {
                0..=0xFF => path.extend_from_slice(&[0x28, index as u8]),
                0x100..=0xFFFF => {
                    path.extend_from_slice(&[0x29, 0x00]);
                    path.extend_from_slice(&(index as u16).to_le_bytes());
                }
                _ => {
                    path.extend_from_slice(&[0x2A, 0x00]);
                    path.extend_from_slice(&index.to_le_bytes());
                }
            }
        }
    }
    Some(path)
}

fn cip_request(service: u8, path: &[u8], data: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(2 + path.len() + data.len());
    request.extend_from_slice(&[service, (path.len() / 2) as u8]);
    request.extend_from_slice(path);
    request.extend_from_slice(data);
    request
}

/// Wrap a request in Unconnected Send routed to a backplane slot
fn unconnected_send(request: &[u8], slot: u8) -> Vec<u8> {
    let mut data = vec![0x0A, 0x0E]; // priority / tick, timeout ticks
    data.extend_from_slice(&(request.len() as u16).to_le_bytes());
    data.extend_from_slice(request);
    if request.len() % 2 == 1 {
        data.push(0x00);
    }
    data.extend_from_slice(&[0x01, 0x00, 0x01, slot]);
    cip_request(SERVICE_UNCONNECTED_SEND, &CONNECTION_MANAGER, &data)
}

fn send_rr_data(session: u32, cip: &[u8]) -> Vec<u8> {
    let mut body = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00];
    body.extend_from_slice(&ITEM_UNCONNECTED.to_le_bytes());
    body.extend_from_slice(&(cip.len() as u16).to_le_bytes());
    body.extend_from_slice(cip);

    let mut frame = encapsulation_header(SEND_RR_DATA, body.len() as u16, session).to_vec();
    frame.extend_from_slice(&body);
    frame
}

fn le16_at(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*bytes.get(at)?, *bytes.get(at + 1)?]))
}

fn le32_at(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// A CIP reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipReply {
    /// Service code without the reply bit
    pub service: u8,
    /// General status
    pub status: u8,
    /// First extended status word, zero when absent
    pub extended: u16,
    /// Reply data
    pub data: Vec<u8>,
}

/// Extract the CIP reply from a SendRRData frame
pub fn parse_rr_data(frame: &[u8]) -> std::result::Result<CipReply, String> {
    let status = le32_at(frame, 8).ok_or("short encapsulation frame")?;
    if status != 0 {
        return Err(format!("encapsulation status 0x{:08X}", status));
    }
    let body = &frame[HEADER_LEN..];
    let count = le16_at(body, 6).ok_or("truncated SendRRData reply")?;

    let mut at = 8;
    for _ in 0..count {
        let item_type = le16_at(body, at).ok_or("truncated item header")?;
        let len = le16_at(body, at + 2).ok_or("truncated item header")? as usize;
        let data = body.get(at + 4..at + 4 + len).ok_or("item shorter than its length")?;
        if item_type == ITEM_UNCONNECTED {
            return parse_cip(data);
        }
        at += 4 + len;
    }
    Err("reply carries no unconnected data item".to_string())
}

fn parse_cip(data: &[u8]) -> std::result::Result<CipReply, String> {
    if data.len() < 4 || data[0] & 0x80 == 0 {
        return Err("malformed CIP reply".to_string());
    }
    let extended_len = data[3] as usize * 2;
    let payload = data.get(4 + extended_len..).ok_or("truncated extended status")?;
    Ok(CipReply {
        service: data[0] & 0x7F,
        status: data[2],
        extended: if extended_len >= 2 { le16_at(data, 4).unwrap_or(0) } else { 0 },
        data: payload.to_vec(),
    })
}

fn cip_status_message(status: u8, extended: u16) -> String {
    let text = match status {
        0x01 => "connection failure",
        0x04 => "path segment error",
        0x05 => "tag or object does not exist",
        0x06 => "partial transfer",
        0x08 => "service not supported",
        0x0E => "attribute not settable",
        0x0F => "privilege violation",
        0x10 => "device state conflict",
        0x13 => "not enough data",
        0x1E => "embedded service error",
        0x26 => "invalid path size",
        0xFF => "general error",
        _ => "CIP error",
    };
    if extended != 0 {
        format!("{} (status 0x{:02X}, extended 0x{:04X})", text, status, extended)
    } else {
        format!("{} (status 0x{:02X})", text, status)
    }
}

/// Identity status to operating mode
///
/// A major fault wins; otherwise bits 4-7 report run (6) or idle (7).
pub fn mode_from_status(status: u16) -> PlcMode {
    if status & 0x0C00 != 0 {
        return PlcMode::Fault;
    }
    match (status >> 4) & 0x0F {
        6 => PlcMode::Run,
        7 => PlcMode::Program,
        _ => PlcMode::Unknown,
    }
}

/// A PCCC data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DataFile {
    number: u32,
    file_type: u8,
    element_len: usize,
}

fn data_file(address: &Address) -> DataFile {
    let (default, file_type, element_len) = match (address.area, address.width) {
        (MemoryArea::Output, _) => (0, 0x8B, 2),
        (MemoryArea::Input, _) => (1, 0x8C, 2),
        (MemoryArea::Special, _) => (2, 0x84, 2),
        (MemoryArea::Data, BitWidth::DWord) => (9, 0x91, 4),
        (MemoryArea::Data, _) => (7, 0x89, 2),
        (MemoryArea::Memory, _) => (3, 0x85, 2),
        (MemoryArea::Timer, _) => (4, 0x86, 6),
        (MemoryArea::Counter, _) => (5, 0x87, 6),
    };
    DataFile {
        number: address.block.unwrap_or(default),
        file_type,
        element_len,
    }
}

fn pccc_field(value: u32, out: &mut Vec<u8>) {
    if value < 0xFF {
        out.push(value as u8);
    } else {
        out.push(0xFF);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    }
}

/// Byte size and three address fields of a typed logical request
fn pccc_address(size: usize, file: DataFile, element: u32, sub_element: u32) -> Vec<u8> {
    let mut body = vec![size as u8];
    pccc_field(file.number, &mut body);
    body.push(file.file_type);
    pccc_field(element, &mut body);
    pccc_field(sub_element, &mut body);
    body
}

/// A registered EtherNet/IP session
#[derive(Debug)]
struct Session {
    transport: TcpTransport,
    handle: u32,
    slot: u8,
    tns: u16,
}

impl Session {
    async fn open(
        host: &str,
        port: u16,
        slot: u8,
        connect_timeout: std::time::Duration,
        request_timeout: std::time::Duration,
    ) -> Result<Self> {
        let mut transport =
            TcpTransport::connect(Vendor::AllenBradley, host, port, connect_timeout, request_timeout).await?;

        let mut frame = encapsulation_header(REGISTER_SESSION, 4, 0).to_vec();
        frame.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
        let reply = transport.request(&frame, FRAMING).await?;

        let handle = le32_at(&reply, 4).unwrap_or(0);
        if le16_at(&reply, 0) != Some(REGISTER_SESSION) || le32_at(&reply, 8) != Some(0) || handle == 0 {
            return Err(DeviceError::connection(
                Vendor::AllenBradley,
                transport.target(),
                "session registration refused",
            ));
        }
        Ok(Self {
            transport,
            handle,
            slot,
            tns: 0,
        })
    }

    fn protocol<M: ToString>(&self, message: M) -> DeviceError {
        DeviceError::protocol(Vendor::AllenBradley, self.transport.target(), message)
    }

    async fn send(&mut self, cip: &[u8]) -> Result<CipReply> {
        let reply = self.transport.request(&send_rr_data(self.handle, cip), FRAMING).await?;
        parse_rr_data(&reply).map_err(|m| self.protocol(m))
    }

    fn check(&self, reply: CipReply) -> Result<CipReply> {
        if reply.status != 0 {
            return Err(self.protocol(cip_status_message(reply.status, reply.extended)));
        }
        Ok(reply)
    }

    async fn routed(&mut self, request: &[u8]) -> Result<CipReply> {
        let wrapped = unconnected_send(request, self.slot);
        self.send(&wrapped).await
    }

    async fn list_identity(&mut self) -> Result<Identity> {
        let frame = encapsulation_header(LIST_IDENTITY, 0, 0);
        let reply = self.transport.request(&frame, FRAMING).await?;
        parse_identity(&reply).ok_or_else(|| self.protocol("malformed List Identity reply"))
    }

    async fn read_tag(&mut self, path: &[u8]) -> Result<(u16, Vec<u8>)> {
        let reply = self.routed(&cip_request(SERVICE_READ_TAG, path, &1u16.to_le_bytes())).await?;
        let reply = self.check(reply)?;
        let cip = le16_at(&reply.data, 0).ok_or_else(|| self.protocol("Read Tag reply without a type"))?;
        if cip == STRUCT_TYPE {
            return Err(self.protocol("structured tags must be read member by member"));
        }
        Ok((cip, reply.data[2..].to_vec()))
    }

    async fn write_tag(&mut self, path: &[u8], cip: u16, bytes: &[u8]) -> Result<()> {
        let mut data = cip.to_le_bytes().to_vec();
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(bytes);
        let reply = self.routed(&cip_request(SERVICE_WRITE_TAG, path, &data)).await?;
        self.check(reply).map(|_| ())
    }

    async fn pccc(&mut self, function: u8, body: &[u8]) -> Result<Vec<u8>> {
        self.tns = self.tns.wrapping_add(1);
        let mut data = REQUESTOR_ID.to_vec();
        data.extend_from_slice(&[PCCC_COMMAND, 0x00]);
        data.extend_from_slice(&self.tns.to_le_bytes());
        data.push(function);
        data.extend_from_slice(body);

        let reply = self.send(&cip_request(SERVICE_EXECUTE_PCCC, &PCCC_OBJECT, &data)).await?;
        let reply = self.check(reply)?;
        // requestor id, then command, status, transaction number
        let pccc = match reply.data.get(REQUESTOR_ID.len()..) {
            Some(pccc) if pccc.len() >= 4 => pccc,
            _ => return Err(self.protocol("short PCCC reply")),
        };
        if pccc[1] != 0 {
            return Err(self.protocol(format!("PCCC status 0x{:02X}", pccc[1])));
        }
        if le16_at(pccc, 2) != Some(self.tns) {
            return Err(self.protocol("PCCC transaction number mismatch"));
        }
        Ok(pccc[4..].to_vec())
    }

    async fn pccc_read(&mut self, file: DataFile, element: u32, sub_element: u32, size: usize) -> Result<Vec<u8>> {
        let bytes = self.pccc(PCCC_READ, &pccc_address(size, file, element, sub_element)).await?;
        if bytes.len() != size {
            return Err(self.protocol(format!("asked for {} bytes, got {}", size, bytes.len())));
        }
        Ok(bytes)
    }

    async fn pccc_write(&mut self, file: DataFile, element: u32, sub_element: u32, data: &[u8]) -> Result<()> {
        let mut body = pccc_address(data.len(), file, element, sub_element);
        body.extend_from_slice(data);
        self.pccc(PCCC_WRITE, &body).await.map(|_| ())
    }

    /// Controller and program scoped symbols with their type codes
    async fn list_symbols(&mut self) -> Result<Vec<(String, u16)>> {
        let mut symbols = Vec::new();
        let mut instance: u32 = 0;
        loop {
            let mut path = vec![0x20, SYMBOL_CLASS, 0x25, 0x00];
            path.extend_from_slice(&(instance as u16).to_le_bytes());
            // attributes 1 (name) and 2 (type)
            let request = cip_request(SERVICE_INSTANCE_LIST, &path, &[0x02, 0x00, 0x01, 0x00, 0x02, 0x00]);
            let reply = self.routed(&request).await?;
            if reply.status != 0 && reply.status != STATUS_PARTIAL {
                return Err(self.protocol(cip_status_message(reply.status, reply.extended)));
            }

            let before = symbols.len();
            let data = &reply.data;
            let mut at = 0;
            while let (Some(id), Some(len)) = (le32_at(data, at), le16_at(data, at + 4)) {
                let len = len as usize;
                let (Some(name), Some(cip)) = (data.get(at + 6..at + 6 + len), le16_at(data, at + 6 + len)) else {
                    return Err(self.protocol("truncated symbol entry"));
                };
                symbols.push((String::from_utf8_lossy(name).into_owned(), cip));
                instance = id + 1;
                at += 8 + len;
            }

            if reply.status != STATUS_PARTIAL {
                break;
            }
            if symbols.len() == before {
                return Err(self.protocol("partial symbol list without entries"));
            }
        }
        Ok(symbols)
    }
}

/// Allen-Bradley Logix / SLC driver
#[derive(Debug)]
pub struct AllenBradleyDriver {
    config: SharedConfig,
    session: Option<Session>,
    target: Option<String>,
    slot: u8,
    info: Option<DeviceInfo>,
    /// CIP types of symbolic tags seen so far
    types: HashMap<String, u16>,
    errors: ErrorSlot,
}

impl AllenBradleyDriver {
    /// Create a disconnected driver
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            session: None,
            target: None,
            slot: DEFAULT_SLOT,
            info: None,
            types: HashMap::new(),
            errors: ErrorSlot::default(),
        }
    }

    fn session(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or_else(|| not_connected(&self.target))
    }

    fn protocol<M: ToString>(&self, message: M) -> DeviceError {
        DeviceError::protocol(
            Vendor::AllenBradley,
            self.target.clone().unwrap_or_default(),
            message,
        )
    }

    async fn open(&mut self, address: &str, options: &ProtocolOptions) -> Result<()> {
        let config = self.config.clone();
        let connection = &config.get().connection;
        let (host, port) = resolve_target(address, options, DEFAULT_PORT)?;
        let slot = options.get_u16(SLOT)?.unwrap_or(u16::from(DEFAULT_SLOT));
        let slot = u8::try_from(slot).map_err(|_| DeviceError::invalid_value(SLOT, "slot must be below 256"))?;

        self.close().await;
        self.target = Some(join_target(&host, port));

        let mut session = Session::open(
            &host,
            port,
            slot,
            options.timeout_or(connection.connect_timeout()),
            options.timeout_or(connection.request_timeout()),
        )
        .await?;
        info!(
            "Connected to Allen-Bradley controller at {}:{} (session 0x{:08X}, slot {})",
            host, port, session.handle, slot
        );

        let mut info = DeviceInfo::new(Vendor::AllenBradley, host.clone());
        info.slot = Some(u16::from(slot));
        match session.list_identity().await {
            Ok(identity) => {
                info.model = identity.product_name.clone();
                info.name = identity.product_name;
                info.firmware = format!("{}.{}", identity.revision.0, identity.revision.1);
                info.serial = format!("{:08X}", identity.serial);
                info.additional
                    .insert("vendor_id".to_string(), Value::from(identity.vendor_id));
                info.additional
                    .insert("device_type".to_string(), Value::from(identity.device_type));
                info.additional
                    .insert("product_code".to_string(), Value::from(identity.product_code));
            }
            Err(e) if !e.is_transport_failure() => {
                warn!("Could not read identity of {}: {}", host, e);
            }
            Err(e) => return Err(e),
        }

        self.session = Some(session);
        self.slot = slot;
        self.info = Some(info);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.transport.shutdown().await;
            info!("Disconnected from Allen-Bradley controller at {}", session.transport.target());
        }
        self.info = None;
        self.types.clear();
    }

    async fn read_area(&mut self, address: &Address, count: usize) -> Result<Vec<u8>> {
        check_count(address, count)?;
        let file = data_file(address);
        let session = self.session()?;

        match address.area {
            MemoryArea::Timer | MemoryArea::Counter => {
                let mut out = Vec::with_capacity(count + 1);
                for i in 0..words_for(count) {
                    out.extend(session.pccc_read(file, address.offset + i as u32, ACC, 2).await?);
                }
                out.truncate(count);
                Ok(out)
            }
            _ if is_bit(address) => {
                let first = u32::from(address.bit_offset.unwrap_or(0));
                let last = first + count as u32 - 1;
                let words = session
                    .pccc_read(file, address.offset, 0, ((last / 16 + 1) * 2) as usize)
                    .await?;
                Ok((first..=last)
                    .map(|pos| {
                        let at = (pos / 16) as usize * 2;
                        let word = u16::from_le_bytes([words[at], words[at + 1]]);
                        ((word >> (pos % 16)) & 0x01) as u8
                    })
                    .collect())
            }
            _ => {
                let mut out = Vec::with_capacity(count);
                while out.len() < count {
                    let n = PCCC_CHUNK.min(count - out.len());
                    let element = address.offset + (out.len() / file.element_len) as u32;
                    out.extend(session.pccc_read(file, element, 0, n).await?);
                }
                Ok(out)
            }
        }
    }

    async fn write_area(&mut self, address: &Address, data: &[u8]) -> Result<()> {
        check_count(address, data.len())?;
        let file = data_file(address);
        let session = self.session()?;

        match address.area {
            MemoryArea::Timer | MemoryArea::Counter => {
                if data.len() % 2 != 0 {
                    return Err(DeviceError::invalid_value(
                        address.to_string(),
                        "accumulator values are 2 bytes each",
                    ));
                }
                for (i, acc) in data.chunks(2).enumerate() {
                    session.pccc_write(file, address.offset + i as u32, ACC, acc).await?;
                }
                Ok(())
            }
            _ if is_bit(address) => {
                let first = u32::from(address.bit_offset.unwrap_or(0));
                for (i, bit) in data.iter().enumerate() {
                    let pos = first + i as u32;
                    let element = address.offset + pos / 16;
                    let current = session.pccc_read(file, element, 0, 2).await?;
                    let mut word = u16::from_le_bytes([current[0], current[1]]);
                    if *bit != 0 {
                        word |= 1 << (pos % 16);
                    } else {
                        word &= !(1 << (pos % 16));
                    }
                    session.pccc_write(file, element, 0, &word.to_le_bytes()).await?;
                }
                Ok(())
            }
            _ => {
                for (i, part) in data.chunks(PCCC_CHUNK).enumerate() {
                    let element = address.offset + (i * PCCC_CHUNK / file.element_len) as u32;
                    session.pccc_write(file, element, 0, part).await?;
                }
                Ok(())
            }
        }
    }

    async fn read_symbol(&mut self, name: &str) -> Result<TagValue> {
        let path = tag_path(name).ok_or_else(|| DeviceError::invalid_value(name, "malformed tag name"))?;
        let (cip, bytes) = self.session()?.read_tag(&path).await?;
        self.types.insert(name.to_string(), cip);

        let (value, data_type) = decode_value(cip, &bytes)
            .ok_or_else(|| self.protocol(format!("{} has unsupported type {}", name, type_name(cip))))?;
        debug!("Read {} = {} ({})", name, value, type_name(cip));
        Ok(TagValue::good(name, value, data_type))
    }

    async fn write_symbol(&mut self, name: &str, value: &Value) -> Result<()> {
        let path = tag_path(name).ok_or_else(|| DeviceError::invalid_value(name, "malformed tag name"))?;
        let cip = match self.types.get(name) {
            Some(cip) => *cip,
            None => {
                // Write Tag needs the type; learn it with a read
                self.read_symbol(name).await?;
                self.types
                    .get(name)
                    .copied()
                    .ok_or_else(|| self.protocol(format!("type of {} unknown", name)))?
            }
        };
        let bytes = encode_value(cip, value, name)?;
        self.session()?.write_tag(&path, cip, &bytes).await
    }

    async fn read_value(&mut self, name: &str) -> Result<TagValue> {
        match address::parse(Vendor::AllenBradley, name) {
            Ok(address) => {
                let bytes = self.read_area(&address, value_len(&address)).await?;
                decode_tag(name, &address, &bytes, ByteOrder::Little)
            }
            Err(_) => self.read_symbol(name).await,
        }
    }

    async fn write_value(&mut self, name: &str, value: &Value) -> Result<()> {
        match address::parse(Vendor::AllenBradley, name) {
            Ok(address) => {
                let bytes = encode_tag(name, &address, value, ByteOrder::Little)?;
                self.write_area(&address, &bytes).await
            }
            Err(_) => self.write_symbol(name, value).await,
        }
    }

    async fn read_mode(&mut self) -> Result<PlcMode> {
        let identity = self.session()?.list_identity().await?;
        Ok(mode_from_status(identity.status))
    }

    async fn list_programs(&mut self) -> Result<Vec<BlockInfo>> {
        let symbols = self.session()?.list_symbols().await?;
        Ok(symbols
            .iter()
            .filter_map(|(name, _)| name.strip_prefix("Program:"))
            .filter(|name| !name.contains('.'))
            .enumerate()
            .map(|(i, name)| {
                let mut info = BlockInfo::new(BlockType::Program, i as u32);
                info.name = name.to_string();
                info.language = Some(CodeLanguage::Ladder);
                info
            })
            .collect())
    }

    async fn upload(&mut self) -> Result<PlcProgram> {
        let model = self.info.as_ref().map(|i| i.model.clone()).unwrap_or_default();
        let symbols = self.session()?.list_symbols().await?;

        let mut program = PlcProgram::new(Vendor::AllenBradley, model);
        let mut programs = Vec::new();
        for (name, cip) in symbols {
            match name.strip_prefix("Program:") {
                Some(program_name) => programs.push(Value::from(program_name)),
                None => {
                    program.tags.insert(name, Value::String(type_name(cip)));
                }
            }
        }
        program.metadata.insert("programs".to_string(), Value::Array(programs));
        info!(
            "Read {} tags from Allen-Bradley controller; program logic stays in the project file",
            program.tags.len()
        );
        Ok(program)
    }
}

#[async_trait]
impl PlcDevice for AllenBradleyDriver {
    fn vendor(&self) -> Vendor {
        Vendor::AllenBradley
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
        // security is enforced by the controller project, not reported over CIP
        let result = self.session().map(|_| ProtectionStatus::default());
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
        let result = self.list_programs().await;
        self.errors.record(result)
    }

    async fn start(&mut self) -> Result<()> {
        let result = Err(DeviceError::unsupported(Vendor::AllenBradley, "remote run"));
        self.errors.record(result)
    }

    async fn stop(&mut self) -> Result<()> {
        let result = Err(DeviceError::unsupported(Vendor::AllenBradley, "remote program mode"));
        self.errors.record(result)
    }

    async fn get_mode(&mut self) -> Result<PlcMode> {
        let result = self.read_mode().await;
        self.errors.record(result)
    }

    async fn authenticate(&mut self, _secret: &str) -> Result<()> {
        let result = Err(DeviceError::unsupported(Vendor::AllenBradley, "password authentication"));
        self.errors.record(result)
    }

    async fn get_diagnostics(&mut self) -> Result<Metadata> {
        let mut diagnostics = Metadata::new();
        diagnostics.insert("vendor".to_string(), Value::from(Vendor::AllenBradley.as_str()));
        diagnostics.insert("connected".to_string(), Value::Bool(self.session.is_some()));
        diagnostics.insert("slot".to_string(), Value::from(self.slot));
        if let Some(session) = &self.session {
            diagnostics.insert("session_handle".to_string(), Value::from(session.handle));
        }
        diagnostics.insert("known_tag_types".to_string(), Value::from(self.types.len() as u32));
        if let Some(error) = self.errors.get() {
            diagnostics.insert("last_error".to_string(), Value::String(error));
        }
        Ok(diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use plcbridge_core::config::Config;

    use super::*;
    use crate::probe::enip::frame_len;
    use crate::probe::enip::tests::identity_reply;
    use crate::probe::testing::*;

    const HANDLE: u32 = 0x1122_3344;

    fn rr_reply(service: u8, status: u8, data: &[u8]) -> Vec<u8> {
        let mut cip = vec![service | 0x80, 0x00, status, 0x00];
        cip.extend_from_slice(data);
        let mut body = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00];
        body.extend_from_slice(&ITEM_UNCONNECTED.to_le_bytes());
        body.extend_from_slice(&(cip.len() as u16).to_le_bytes());
        body.extend_from_slice(&cip);
        let mut frame = encapsulation_header(SEND_RR_DATA, body.len() as u16, HANDLE).to_vec();
        frame.extend_from_slice(&body);
        frame
    }

    fn symbol_of(path: &[u8]) -> String {
        String::from_utf8_lossy(&path[2..2 + path[1] as usize]).into_owned()
    }

    fn symbol_entry(id: u32, name: &str, cip: u16) -> Vec<u8> {
        let mut entry = id.to_le_bytes().to_vec();
        entry.extend_from_slice(&(name.len() as u16).to_le_bytes());
        entry.extend_from_slice(name.as_bytes());
        entry.extend_from_slice(&cip.to_le_bytes());
        entry
    }

    /// A CompactLogix with DINT `Speed`, BOOL `Running` and N7 holding `element * 10`
    fn fake_logix(writes: Arc<Mutex<Vec<Vec<u8>>>>) -> impl Fn(&[u8]) -> Option<Vec<u8>> + Clone + Send + Sync {
        move |req: &[u8]| {
            let command = le16_at(req, 0)?;
            if command == REGISTER_SESSION {
                let mut reply = encapsulation_header(REGISTER_SESSION, 4, HANDLE).to_vec();
                reply.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
                return Some(reply);
            }
            if command == LIST_IDENTITY {
                return Some(identity_reply());
            }
            // interface, timeout, count, null item, unconnected item header
            let cip = req.get(HEADER_LEN + 16..)?;
            match cip[0] {
                SERVICE_UNCONNECTED_SEND => {
                    let len = le16_at(cip, 8)? as usize;
                    let embedded = &cip[10..10 + len];
                    let path = &embedded[2..2 + embedded[1] as usize * 2];
                    let data = &embedded[2 + path.len()..];
                    match embedded[0] {
                        SERVICE_READ_TAG => match symbol_of(path).as_str() {
                            "Speed" => Some(rr_reply(SERVICE_READ_TAG, 0, &[0xC4, 0x00, 0xD2, 0x04, 0x00, 0x00])),
                            "Running" => Some(rr_reply(SERVICE_READ_TAG, 0, &[0xC1, 0x00, 0xFF])),
                            _ => Some(rr_reply(SERVICE_READ_TAG, 0x05, &[])),
                        },
                        SERVICE_WRITE_TAG => {
                            writes.lock().unwrap().push(data.to_vec());
                            Some(rr_reply(SERVICE_WRITE_TAG, 0, &[]))
                        }
                        SERVICE_INSTANCE_LIST => {
                            let mut list = symbol_entry(1, "Speed", cip_type::DINT);
                            list.extend(symbol_entry(2, "Program:MainProgram", 0x1068));
                            list.extend(symbol_entry(3, "Running", cip_type::BOOL));
                            Some(rr_reply(SERVICE_INSTANCE_LIST, 0, &list))
                        }
                        _ => Some(rr_reply(embedded[0], 0x08, &[])),
                    }
                }
                SERVICE_EXECUTE_PCCC => {
                    let pccc = &cip[6 + REQUESTOR_ID.len()..];
                    let tns = [pccc[2], pccc[3]];
                    let mut reply = REQUESTOR_ID.to_vec();
                    reply.extend_from_slice(&[0x4F, 0x00, tns[0], tns[1]]);
                    match pccc[4] {
                        PCCC_READ => {
                            let (size, element) = (pccc[5] as usize, pccc[8] as u16);
                            for i in 0..size / 2 {
                                reply.extend_from_slice(&((element + i as u16) * 10).to_le_bytes());
                            }
                        }
                        _ => writes.lock().unwrap().push(pccc[5..].to_vec()),
                    }
                    Some(rr_reply(SERVICE_EXECUTE_PCCC, 0, &reply))
                }
                _ => None,
            }
        }
    }

    async fn connected() -> (AllenBradleyDriver, Arc<Mutex<Vec<Vec<u8>>>>) {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let port = spawn_tcp(HEADER_LEN, |h| frame_len(h).unwrap_or(HEADER_LEN), fake_logix(writes.clone())).await;
        let mut driver = AllenBradleyDriver::new(SharedConfig::new(Config::default()));
        let options = ProtocolOptions::new()
            .with_port(port)
            .with_timeout(Duration::from_secs(2));
        driver.connect("127.0.0.1", &options).await.unwrap();
        (driver, writes)
    }

    #[test]
    fn test_tag_path() {
        assert_eq!(tag_path("Speed").unwrap(), vec![0x91, 5, b'S', b'p', b'e', b'e', b'd', 0x00]);
        assert_eq!(tag_path("Arr[3]").unwrap(), vec![0x91, 3, b'A', b'r', b'r', 0x00, 0x28, 3]);
        assert_eq!(
            tag_path("Ab.Cd[300]").unwrap(),
            vec![0x91, 2, b'A', b'b', 0x91, 2, b'C', b'd', 0x29, 0x00, 0x2C, 0x01]
        );
        assert!(tag_path("Program:Main.Tag").is_some());
        assert_eq!(tag_path("Arr[x]"), None);
        assert_eq!(tag_path("A..B"), None);
    }

    #[test]
    fn test_mode_from_status() {
        assert_eq!(mode_from_status(0x0060), PlcMode::Run);
        assert_eq!(mode_from_status(0x0070), PlcMode::Program);
        assert_eq!(mode_from_status(0x0460), PlcMode::Fault);
        assert_eq!(mode_from_status(0x0030), PlcMode::Unknown);
    }

    #[test]
    fn test_value_codec() {
        assert_eq!(decode_value(cip_type::SINT, &[0xFE]), Some((Value::Integer(-2), DataType::Byte)));
        assert_eq!(
            decode_value(cip_type::DINT, &[0xD2, 0x04, 0x00, 0x00]),
            Some((Value::Integer(1234), DataType::DInt))
        );
        assert_eq!(decode_value(0x02A0, &[0x00]), None);
        assert_eq!(encode_value(cip_type::BOOL, &Value::Bool(true), "b").unwrap(), vec![0xFF]);
        assert!(encode_value(cip_type::SINT, &Value::Integer(200), "s").is_err());
        assert_eq!(type_name(cip_type::REAL), "REAL");
    }

    #[test]
    fn test_pccc_address_fields() {
        let file = DataFile {
            number: 7,
            file_type: 0x89,
            element_len: 2,
        };
        assert_eq!(pccc_address(2, file, 5, 0), vec![2, 7, 0x89, 5, 0]);
        assert_eq!(pccc_address(2, file, 300, 0), vec![2, 7, 0x89, 0xFF, 0x2C, 0x01, 0]);
    }

    #[test]
    fn test_rr_data_errors() {
        let mut reply = rr_reply(SERVICE_READ_TAG, 0, &[]);
        reply[8] = 0x64;
        assert!(parse_rr_data(&reply).unwrap_err().contains("encapsulation status"));
        assert!(parse_rr_data(&reply[..10]).is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_connect_reads_identity() {
        let (mut driver, _) = connected().await;
        let info = driver.get_device_info().await.unwrap();
        assert_eq!(info.model, "1756-L71/B LOGIX5571");
        assert_eq!(info.firmware, "20.11");
        assert_eq!(info.serial, "00C0FFEE");
        assert_eq!(info.slot, Some(0));
        assert_eq!(driver.get_mode().await.unwrap(), PlcMode::Run);
    }

    #[test_log::test(tokio::test)]
    async fn test_symbolic_tags() {
        let (mut driver, writes) = connected().await;

        let speed = driver.read_tag("Speed").await.unwrap();
        assert_eq!(speed.value, Value::Integer(1234));
        assert_eq!(speed.data_type, DataType::DInt);
        assert_eq!(driver.read_tag("Running").await.unwrap().value, Value::Bool(true));

        driver.write_tag("Speed", &Value::Integer(42)).await.unwrap();
        assert_eq!(
            writes.lock().unwrap()[0],
            vec![0xC4, 0x00, 0x01, 0x00, 0x2A, 0x00, 0x00, 0x00]
        );

        let err = driver.read_tag("Missing").await.unwrap_err();
        assert!(matches!(err, DeviceError::ProtocolError { .. }));
        assert!(err.to_string().contains("does not exist"));
        assert!(driver.is_connected());
    }

    #[test_log::test(tokio::test)]
    async fn test_data_table_addresses() {
        let (mut driver, writes) = connected().await;

        assert_eq!(driver.read_tag("N7:2").await.unwrap().value, Value::Integer(20));
        // N7:1 holds 10 = 0b1010
        assert_eq!(driver.read_tag("N7:1/1").await.unwrap().value, Value::Bool(true));
        assert_eq!(driver.read_tag("N7:1/2").await.unwrap().value, Value::Bool(false));

        let address = address::parse(Vendor::AllenBradley, "N7:0").unwrap();
        assert_eq!(driver.read_memory(&address, 4).await.unwrap(), vec![0, 0, 10, 0]);

        driver.write_tag("N7:5", &Value::Integer(99)).await.unwrap();
        assert_eq!(writes.lock().unwrap()[0], vec![2, 7, 0x89, 5, 0, 99, 0]);
    }

    #[test_log::test(tokio::test)]
    async fn test_program_listing() {
        let (mut driver, _) = connected().await;
        let blocks = driver.get_block_list().await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].name, "MainProgram");
        assert_eq!(blocks[0].block_type, BlockType::Program);

        let program = driver.upload_program().await.unwrap();
        assert_eq!(program.tags.get("Speed"), Some(&Value::String("DINT".to_string())));
        assert_eq!(program.tags.len(), 2);
        assert_eq!(
            program.metadata.get("programs"),
            Some(&Value::Array(vec![Value::from("MainProgram")]))
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_unsupported_operations_keep_session() {
        let (mut driver, _) = connected().await;
        assert!(matches!(driver.start().await, Err(DeviceError::Unsupported { .. })));
        assert!(matches!(driver.authenticate("pw").await, Err(DeviceError::Unsupported { .. })));
        assert_eq!(
            driver.get_protection_status().await.unwrap(),
            ProtectionStatus::default()
        );
        assert!(driver.is_connected());
    }

    #[test_log::test(tokio::test)]
    async fn test_disconnect() {
        let (mut driver, _) = connected().await;
        driver.disconnect().await.unwrap();
        driver.disconnect().await.unwrap();
        assert!(matches!(
            driver.read_tag("Speed").await,
            Err(DeviceError::NotConnected { .. })
        ));
        assert!(matches!(
            driver.get_protection_status().await,
            Err(DeviceError::NotConnected { .. })
        ));
    }
}
