/*!
 * Beckhoff TwinCAT driver over AMS/TCP (ADS).
 *
 * Symbolic tags (`MAIN.counter`, `GVL.speed`) are accessed through symbol
 * handles; IEC direct addresses (`%MW10`, `%IX0.1`) through the process
 * image and flag index groups.
 */
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use plcbridge_core::config::SharedConfig;
use plcbridge_core::types::{Metadata, Value};

use super::transport::TcpTransport;
use super::{check_count, decode_tag, encode_tag, is_bit, not_connected, resolve_target, value_len};
use crate::address::{self, Address, MemoryArea};
use crate::device::{DeviceError, DeviceInfo, ErrorSlot, PlcDevice, PlcMode, ProtectionStatus, Result};
use crate::probe::ads::{
    net_id_for_host, parse_device_info, parse_net_id, parse_response, request, AmsRoute, CMD_READ,
    CMD_READ_DEVICE_INFO, CMD_READ_STATE, CMD_READ_WRITE, CMD_WRITE, CMD_WRITE_CONTROL, FRAMING, SOURCE_PORT,
};
use crate::program::{BlockInfo, BlockType, CodeLanguage, PlcProgram};
use crate::protocol::util::join_target;
use crate::protocol::{ProtocolOptions, AMS_NET_ID, AMS_PORT};
use crate::tag::{ByteOrder, DataType, TagValue};
use crate::vendor::Vendor;

/// AMS/TCP port
pub const DEFAULT_PORT: u16 = 48898;

/// Index groups used by the driver
pub mod index_group {
    /// Flag area (%M), byte offsets
    pub const MEMORY: u32 = 0x4020;
    /// Flag area (%MX), bit offsets
    pub const MEMORY_BIT: u32 = 0x4021;
    /// Process image inputs (%I), byte offsets
    pub const INPUT: u32 = 0xF020;
    /// Process image inputs (%IX), bit offsets
    pub const INPUT_BIT: u32 = 0xF021;
    /// Process image outputs (%Q), byte offsets
    pub const OUTPUT: u32 = 0xF030;
    /// Process image outputs (%QX), bit offsets
    pub const OUTPUT_BIT: u32 = 0xF031;
    /// Symbol handle by name
    pub const SYM_HNDBYNAME: u32 = 0xF003;
    /// Symbol value by handle
    pub const SYM_VALBYHND: u32 = 0xF005;
    /// Release a symbol handle
    pub const SYM_RELEASEHND: u32 = 0xF006;
    /// Extended symbol information by name
    pub const SYM_INFOBYNAMEEX: u32 = 0xF009;
    /// Symbol table upload
    pub const SYM_UPLOAD: u32 = 0xF00B;
    /// Symbol table size
    pub const SYM_UPLOADINFO: u32 = 0xF00C;
}

/// ADS data type ids
pub mod ads_type {
    /// INT
    pub const INT16: u32 = 2;
    /// DINT
    pub const INT32: u32 = 3;
    /// REAL
    pub const REAL32: u32 = 4;
    /// LREAL
    pub const REAL64: u32 = 5;
    /// SINT
    pub const INT8: u32 = 16;
    /// USINT / BYTE
    pub const UINT8: u32 = 17;
    /// UINT / WORD
    pub const UINT16: u32 = 18;
    /// UDINT / DWORD
    pub const UINT32: u32 = 19;
    /// STRING
    pub const STRING: u32 = 30;
    /// BOOL
    pub const BIT: u32 = 33;
}

/// ADS device states
pub mod ads_state {
    /// Invalid
    pub const INVALID: u16 = 0;
    /// Idle
    pub const IDLE: u16 = 1;
    /// Reset
    pub const RESET: u16 = 2;
    /// Init
    pub const INIT: u16 = 3;
    /// Start
    pub const START: u16 = 4;
    /// Run
    pub const RUN: u16 = 5;
    /// Stop
    pub const STOP: u16 = 6;
    /// Error
    pub const ERROR: u16 = 11;
    /// Config
    pub const CONFIG: u16 = 15;
    /// Reconfig
    pub const RECONFIG: u16 = 16;
}

const MAX_CHUNK: usize = 16 * 1024;

fn ads_error_message(code: u32) -> String {
    let text = match code {
        0x0006 => "target port not found",
        0x0007 => "target machine not found",
        0x0701 => "service not supported",
        0x0702 => "invalid index group",
        0x0703 => "invalid index offset",
        0x0704 => "access denied",
        0x0705 => "invalid size",
        0x0706 => "invalid data",
        0x0707 => "device not ready",
        0x0708 => "device busy",
        0x0710 => "symbol not found",
        0x0711 => "symbol version invalid",
        0x0745 => "device timeout",
        _ => "ADS error",
    };
    format!("{} (0x{:04X})", text, code)
}

/// Operating mode of an ADS state
pub fn mode_from_state(state: u16) -> PlcMode {
    match state {
        ads_state::START | ads_state::RUN => PlcMode::Run,
        ads_state::IDLE | ads_state::RESET | ads_state::INIT | ads_state::STOP => PlcMode::Stop,
        ads_state::CONFIG | ads_state::RECONFIG => PlcMode::Program,
        ads_state::ERROR => PlcMode::Fault,
        _ => PlcMode::Unknown,
    }
}

/// Index group and offset of an IEC direct address
pub fn direct_location(address: &Address) -> Result<(u32, u32)> {
    let bit = is_bit(address);
    let group = match address.area {
        MemoryArea::Input if bit => index_group::INPUT_BIT,
        MemoryArea::Input => index_group::INPUT,
        MemoryArea::Output if bit => index_group::OUTPUT_BIT,
        MemoryArea::Output => index_group::OUTPUT,
        MemoryArea::Memory if bit => index_group::MEMORY_BIT,
        MemoryArea::Memory => index_group::MEMORY,
        _ => {
            return Err(DeviceError::unsupported(
                Vendor::Beckhoff,
                format!("{} has no ADS index group", address),
            ))
        }
    };
    let offset = if bit {
        address.offset * 8 + u32::from(address.bit_offset.unwrap_or(0))
    } else {
        address.offset
    };
    Ok((group, offset))
}

/// One entry of the PLC symbol table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    /// Symbol name
    pub name: String,
    /// Index group of the value
    pub group: u32,
    /// Index offset of the value
    pub offset: u32,
    /// Size in bytes
    pub size: u32,
    /// ADS data type id
    pub data_type: u32,
    /// IEC type name
    pub type_name: String,
}

fn le32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

fn le16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(bytes.get(at..at + 2)?.try_into().ok()?))
}

/// Parse one symbol entry; returns it with its encoded length
pub fn parse_symbol_entry(bytes: &[u8]) -> Option<(SymbolEntry, usize)> {
    let entry_len = le32(bytes, 0)? as usize;
    let name_len = le16(bytes, 24)? as usize;
    let type_len = le16(bytes, 26)? as usize;
    let name = bytes.get(30..30 + name_len)?;
    let type_at = 30 + name_len + 1;
    let type_name = bytes.get(type_at..type_at + type_len)?;
    if entry_len < type_at + type_len {
        return None;
    }
    let entry = SymbolEntry {
        name: String::from_utf8_lossy(name).into_owned(),
        group: le32(bytes, 4)?,
        offset: le32(bytes, 8)?,
        size: le32(bytes, 12)?,
        data_type: le32(bytes, 16)?,
        type_name: String::from_utf8_lossy(type_name).into_owned(),
    };
    Some((entry, entry_len))
}

/// Decode a symbol value according to its ADS type
fn decode_symbol(entry: &SymbolEntry, bytes: &[u8]) -> Option<(Value, DataType)> {
    let data_type = match entry.data_type {
        ads_type::BIT => DataType::Bool,
        ads_type::INT8 => return Some((Value::from(*bytes.first()? as i8), DataType::Byte)),
        ads_type::UINT8 => DataType::Byte,
        ads_type::INT16 => DataType::Int,
        ads_type::UINT16 => DataType::Word,
        ads_type::INT32 => DataType::DInt,
        ads_type::UINT32 => DataType::DWord,
        ads_type::REAL32 => DataType::Real,
        ads_type::REAL64 => DataType::LReal,
        ads_type::STRING => DataType::String,
        _ => DataType::Raw,
    };
    Some((data_type.decode(bytes, ByteOrder::Little)?, data_type))
}

fn encode_symbol(entry: &SymbolEntry, value: &Value) -> Result<Vec<u8>> {
    let data_type = match entry.data_type {
        ads_type::BIT => DataType::Bool,
        ads_type::INT8 => {
            let v = value
                .as_integer()
                .filter(|v| (-128..=127).contains(v))
                .ok_or_else(|| DeviceError::invalid_value(&entry.name, format!("{} is not a SINT", value)))?;
            return Ok(vec![v as i8 as u8]);
        }
        ads_type::UINT8 => DataType::Byte,
        ads_type::INT16 => DataType::Int,
        ads_type::UINT16 => DataType::Word,
        ads_type::INT32 => DataType::DInt,
        ads_type::UINT32 => DataType::DWord,
        ads_type::REAL32 => DataType::Real,
        ads_type::REAL64 => DataType::LReal,
        ads_type::STRING => {
            let text = value
                .as_str()
                .ok_or_else(|| DeviceError::invalid_value(&entry.name, "expected a string"))?;
            if text.len() >= entry.size as usize {
                return Err(DeviceError::invalid_value(
                    &entry.name,
                    format!("string longer than {} bytes", entry.size.saturating_sub(1)),
                ));
            }
            let mut bytes = text.as_bytes().to_vec();
            bytes.resize(entry.size as usize, 0);
            return Ok(bytes);
        }
        _ => {
            return Err(DeviceError::invalid_value(
                &entry.name,
                format!("writing {} values is not supported", entry.type_name),
            ))
        }
    };
    data_type.encode(value, ByteOrder::Little, &entry.name)
}

fn name_bytes(name: &str) -> Vec<u8> {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

/// An AMS/TCP connection routed to one ADS device
#[derive(Debug)]
struct Session {
    transport: TcpTransport,
    route: AmsRoute,
    invoke_id: u32,
}

impl Session {
    fn protocol<M: ToString>(&self, message: M) -> DeviceError {
        DeviceError::protocol(Vendor::Beckhoff, self.transport.target(), message)
    }

    /// Run one ADS command; returns the payload after the result code
    async fn command(&mut self, command: u16, data: &[u8]) -> Result<Vec<u8>> {
        self.invoke_id = self.invoke_id.wrapping_add(1);
        let frame = request(&self.route, command, self.invoke_id, data);
        let reply = self.transport.request(&frame, FRAMING).await?;

        let response = parse_response(&reply).ok_or_else(|| self.protocol("malformed AMS response"))?;
        if response.command != command || response.invoke_id != self.invoke_id {
            return Err(self.protocol(format!(
                "response to command {} / invoke {} does not match the request",
                response.command, response.invoke_id
            )));
        }
        if response.error != 0 {
            return Err(self.protocol(ads_error_message(response.error)));
        }
        let result = le32(&response.data, 0).ok_or_else(|| self.protocol("ADS response without result"))?;
        if result != 0 {
            return Err(self.protocol(ads_error_message(result)));
        }
        Ok(response.data[4..].to_vec())
    }

    fn sized<'a>(&self, payload: &'a [u8]) -> Result<&'a [u8]> {
        let length = le32(payload, 0).ok_or_else(|| self.protocol("ADS response without length"))? as usize;
        payload
            .get(4..4 + length)
            .ok_or_else(|| self.protocol("ADS response shorter than its length"))
    }

    async fn read(&mut self, group: u32, offset: u32, length: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(length);
        while out.len() < length {
            let n = MAX_CHUNK.min(length - out.len());
            let mut body = group.to_le_bytes().to_vec();
            body.extend_from_slice(&(offset + out.len() as u32).to_le_bytes());
            body.extend_from_slice(&(n as u32).to_le_bytes());
            let payload = self.command(CMD_READ, &body).await?;
            let data = self.sized(&payload)?;
            if data.len() != n {
                return Err(self.protocol(format!("asked for {} bytes, got {}", n, data.len())));
            }
            out.extend_from_slice(data);
        }
        Ok(out)
    }

    async fn write(&mut self, group: u32, offset: u32, data: &[u8]) -> Result<()> {
        for (i, part) in data.chunks(MAX_CHUNK).enumerate() {
            let mut body = group.to_le_bytes().to_vec();
            body.extend_from_slice(&(offset + (i * MAX_CHUNK) as u32).to_le_bytes());
            body.extend_from_slice(&(part.len() as u32).to_le_bytes());
            body.extend_from_slice(part);
            self.command(CMD_WRITE, &body).await?;
        }
        Ok(())
    }

    async fn read_write(&mut self, group: u32, offset: u32, read_len: u32, data: &[u8]) -> Result<Vec<u8>> {
        let mut body = group.to_le_bytes().to_vec();
        body.extend_from_slice(&offset.to_le_bytes());
        body.extend_from_slice(&read_len.to_le_bytes());
        body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        body.extend_from_slice(data);
        let payload = self.command(CMD_READ_WRITE, &body).await?;
        Ok(self.sized(&payload)?.to_vec())
    }

    async fn read_state(&mut self) -> Result<(u16, u16)> {
        let payload = self.command(CMD_READ_STATE, &[]).await?;
        match (le16(&payload, 0), le16(&payload, 2)) {
            (Some(ads), Some(device)) => Ok((ads, device)),
            _ => Err(self.protocol("short Read State response")),
        }
    }

    async fn write_control(&mut self, ads: u16, device: u16) -> Result<()> {
        let mut body = ads.to_le_bytes().to_vec();
        body.extend_from_slice(&device.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        self.command(CMD_WRITE_CONTROL, &body).await.map(|_| ())
    }

    async fn symbol_info(&mut self, name: &str) -> Result<SymbolEntry> {
        let data = self
            .read_write(index_group::SYM_INFOBYNAMEEX, 0, 0xFFFF, &name_bytes(name))
            .await?;
        parse_symbol_entry(&data)
            .map(|(entry, _)| entry)
            .ok_or_else(|| self.protocol(format!("malformed symbol information for {}", name)))
    }

    async fn symbol_handle(&mut self, name: &str) -> Result<u32> {
        let data = self
            .read_write(index_group::SYM_HNDBYNAME, 0, 4, &name_bytes(name))
            .await?;
        le32(&data, 0).ok_or_else(|| self.protocol("short symbol handle"))
    }

    async fn upload_symbols(&mut self) -> Result<Vec<SymbolEntry>> {
        let info = self.read(index_group::SYM_UPLOADINFO, 0, 24).await?;
        let (count, length) = match (le32(&info, 0), le32(&info, 4)) {
            (Some(count), Some(length)) => (count as usize, length as usize),
            _ => return Err(self.protocol("short symbol upload info")),
        };
        let table = self.read(index_group::SYM_UPLOAD, 0, length).await?;

        let mut symbols = Vec::with_capacity(count);
        let mut pos = 0;
        while symbols.len() < count && pos < table.len() {
            let Some((entry, len)) = parse_symbol_entry(&table[pos..]) else {
                return Err(self.protocol(format!("malformed symbol table entry at {}", pos)));
            };
            if len == 0 {
                break;
            }
            symbols.push(entry);
            pos += len;
        }
        Ok(symbols)
    }
}

/// A symbol with a live handle
#[derive(Debug, Clone)]
struct Symbol {
    handle: u32,
    entry: SymbolEntry,
}

/// Beckhoff TwinCAT driver
#[derive(Debug)]
pub struct BeckhoffDriver {
    config: SharedConfig,
    session: Option<Session>,
    target: Option<String>,
    info: Option<DeviceInfo>,
    symbols: HashMap<String, Symbol>,
    errors: ErrorSlot,
}

impl BeckhoffDriver {
    /// Create a disconnected driver
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            session: None,
            target: None,
            info: None,
            symbols: HashMap::new(),
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
        let target_net_id = match options.get_string(AMS_NET_ID) {
            Some(text) => parse_net_id(&text)
                .ok_or_else(|| DeviceError::invalid_value(AMS_NET_ID, format!("{} is not an AMS net id", text)))?,
            None => net_id_for_host(&host),
        };
        let source = parse_net_id(&connection.ams_source_net_id).ok_or_else(|| {
            DeviceError::invalid_value(
                "connection.ams_source_net_id",
                format!("{} is not an AMS net id", connection.ams_source_net_id),
            )
        })?;
        let ams_port = options.get_u16(AMS_PORT)?.unwrap_or(connection.ams_port);
        let connect_timeout: Duration = options.timeout_or(connection.connect_timeout());

        self.close().await;
        self.target = Some(join_target(&host, port));

        let transport = TcpTransport::connect(
            Vendor::Beckhoff,
            &host,
            port,
            connect_timeout,
            options.timeout_or(connection.request_timeout()),
        )
        .await?;
        let mut session = Session {
            transport,
            route: AmsRoute {
                target: target_net_id,
                target_port: ams_port,
                source,
                source_port: SOURCE_PORT,
            },
            invoke_id: 0,
        };

        let mut info = DeviceInfo::new(Vendor::Beckhoff, host.clone());
        info.model = "TwinCAT".to_string();
        info.additional.insert(
            "ams_net_id".to_string(),
            Value::String(target_net_id.iter().map(u8::to_string).collect::<Vec<_>>().join(".")),
        );
        info.additional.insert("ams_port".to_string(), Value::from(ams_port));
        match session.command(CMD_READ_DEVICE_INFO, &[]).await {
            Ok(payload) => {
                // parse_device_info expects the result code in front
                let mut data = vec![0u8; 4];
                data.extend_from_slice(&payload);
                if let Some((name, version)) = parse_device_info(&data) {
                    if !name.is_empty() {
                        info.model = name.clone();
                        info.name = name;
                    }
                    info.firmware = version;
                }
            }
            Err(e) if !e.is_transport_failure() => {
                warn!("Read Device Info from {} failed: {}", host, e);
            }
            Err(e) => return Err(e),
        }

        info!("Connected to Beckhoff ADS device at {}:{} (AMS port {})", host, port, ams_port);
        self.session = Some(session);
        self.info = Some(info);
        Ok(())
    }

    async fn close(&mut self) {
        let symbols: Vec<Symbol> = self.symbols.drain().map(|(_, symbol)| symbol).collect();
        if let Some(mut session) = self.session.take() {
            for symbol in symbols {
                if let Err(e) = session
                    .write(index_group::SYM_RELEASEHND, 0, &symbol.handle.to_le_bytes())
                    .await
                {
                    debug!("Releasing handle of {} failed: {}", symbol.entry.name, e);
                    break;
                }
            }
            session.transport.shutdown().await;
            info!("Disconnected from Beckhoff ADS device at {}", session.transport.target());
        }
        self.info = None;
    }

    async fn read_area(&mut self, address: &Address, count: usize) -> Result<Vec<u8>> {
        check_count(address, count)?;
        let (group, offset) = direct_location(address)?;
        self.session()?.read(group, offset, count).await
    }

    async fn write_area(&mut self, address: &Address, data: &[u8]) -> Result<()> {
        check_count(address, data.len())?;
        let (group, offset) = direct_location(address)?;
        let data: Vec<u8> = if is_bit(address) {
            data.iter().map(|b| u8::from(*b != 0)).collect()
        } else {
            data.to_vec()
        };
        self.session()?.write(group, offset, &data).await
    }

    async fn symbol(&mut self, name: &str) -> Result<Symbol> {
        if let Some(symbol) = self.symbols.get(name) {
            return Ok(symbol.clone());
        }
        let session = self.session()?;
        let entry = session.symbol_info(name).await?;
        let handle = session.symbol_handle(name).await?;
        debug!("Symbol {} has handle 0x{:08X} ({}, {} bytes)", name, handle, entry.type_name, entry.size);
        let symbol = Symbol { handle, entry };
        self.symbols.insert(name.to_string(), symbol.clone());
        Ok(symbol)
    }

    async fn read_symbol(&mut self, name: &str) -> Result<TagValue> {
        let symbol = self.symbol(name).await?;
        let session = self.session()?;
        let bytes = session
            .read(index_group::SYM_VALBYHND, symbol.handle, symbol.entry.size as usize)
            .await?;
        let (value, data_type) = decode_symbol(&symbol.entry, &bytes)
            .ok_or_else(|| session.protocol(format!("{} returned {} bytes", name, bytes.len())))?;
        Ok(TagValue::good(name, value, data_type))
    }

    async fn write_symbol(&mut self, name: &str, value: &Value) -> Result<()> {
        let symbol = self.symbol(name).await?;
        let bytes = encode_symbol(&symbol.entry, value)?;
        self.session()?
            .write(index_group::SYM_VALBYHND, symbol.handle, &bytes)
            .await
    }

    async fn read_value(&mut self, name: &str) -> Result<TagValue> {
        match address::parse(Vendor::Beckhoff, name) {
            Ok(address) => {
                let bytes = self.read_area(&address, value_len(&address)).await?;
                decode_tag(name, &address, &bytes, ByteOrder::Little)
            }
            Err(_) if name.starts_with('%') => Err(DeviceError::invalid_value(name, "malformed direct address")),
            Err(_) => self.read_symbol(name).await,
        }
    }

    async fn write_value(&mut self, name: &str, value: &Value) -> Result<()> {
        match address::parse(Vendor::Beckhoff, name) {
            Ok(address) => {
                let bytes = encode_tag(name, &address, value, ByteOrder::Little)?;
                self.write_area(&address, &bytes).await
            }
            Err(_) if name.starts_with('%') => Err(DeviceError::invalid_value(name, "malformed direct address")),
            Err(_) => self.write_symbol(name, value).await,
        }
    }

    async fn read_mode(&mut self) -> Result<PlcMode> {
        let (ads, _) = self.session()?.read_state().await?;
        Ok(mode_from_state(ads))
    }

    /// POUs owning symbols, in first-seen order
    async fn list_pous(&mut self) -> Result<Vec<BlockInfo>> {
        let symbols = self.session()?.upload_symbols().await?;
        let mut names: Vec<String> = Vec::new();
        for symbol in &symbols {
            if let Some((pou, _)) = symbol.name.split_once('.') {
                if !names.iter().any(|n| n == pou) {
                    names.push(pou.to_string());
                }
            }
        }
        Ok(names
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let mut info = BlockInfo::new(BlockType::Program, i as u32);
                info.name = name;
                info.language = Some(CodeLanguage::StructuredText);
                info
            })
            .collect())
    }

    async fn upload(&mut self) -> Result<PlcProgram> {
        let model = self.info.as_ref().map(|i| i.model.clone()).unwrap_or_default();
        let symbols = self.session()?.upload_symbols().await?;

        let mut program = PlcProgram::new(Vendor::Beckhoff, model);
        for symbol in symbols {
            program.tags.insert(symbol.name, Value::String(symbol.type_name));
        }
        info!("Read {} symbols from Beckhoff device", program.tags.len());
        Ok(program)
    }

    async fn set_state(&mut self, state: u16) -> Result<()> {
        self.session()?.write_control(state, 0).await
    }
}

#[async_trait]
impl PlcDevice for BeckhoffDriver {
    fn vendor(&self) -> Vendor {
        Vendor::Beckhoff
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
        let result = self.list_pous().await;
        self.errors.record(result)
    }

    async fn start(&mut self) -> Result<()> {
        let result = self.set_state(ads_state::RUN).await;
        self.errors.record(result)
    }

    async fn stop(&mut self) -> Result<()> {
        let result = self.set_state(ads_state::STOP).await;
        self.errors.record(result)
    }

    async fn get_mode(&mut self) -> Result<PlcMode> {
        let result = self.read_mode().await;
        self.errors.record(result)
    }

    async fn authenticate(&mut self, _secret: &str) -> Result<()> {
        let result = Err(DeviceError::unsupported(Vendor::Beckhoff, "authenticate"));
        self.errors.record(result)
    }

    async fn get_diagnostics(&mut self) -> Result<Metadata> {
        let mut diagnostics = Metadata::new();
        diagnostics.insert("vendor".to_string(), Value::from(Vendor::Beckhoff.as_str()));
        diagnostics.insert("connected".to_string(), Value::Bool(self.session.is_some()));
        diagnostics.insert("symbol_handles".to_string(), Value::from(self.symbols.len() as u32));
        if let Some(session) = &self.session {
            diagnostics.insert("ams_port".to_string(), Value::from(session.route.target_port));
        }
        if let Some(error) = self.errors.get() {
            diagnostics.insert("last_error".to_string(), Value::String(error));
        }
        Ok(diagnostics)
    }
}
