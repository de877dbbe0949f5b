/*!
 * Modbus-TCP driver for Delta, Schneider and generic Modbus servers.
 *
 * The transport is a `tokio-modbus` client context. What differs between
 * vendors is only the mapping from device addresses to the four Modbus
 * tables, see [`map_address`].
 */
use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tokio::sync::Mutex;
use tokio::time::{error::Elapsed, timeout};
use tokio_modbus::client::{tcp, Client, Context, Reader, Writer};
use tokio_modbus::{Request, Response, Slave};
use tracing::{debug, info, warn};

use plcbridge_core::config::SharedConfig;
use plcbridge_core::types::{Metadata, Value};

use super::{check_count, decode_tag, encode_tag, is_bit, not_connected, resolve_target, tag_address, value_len, words_for};
use crate::address::{Address, BitWidth, MemoryArea};
use crate::device::{AccessLevel, DeviceError, DeviceInfo, ErrorSlot, PlcDevice, PlcMode, ProtectionStatus, Result};
use crate::probe::modbus::{parse_device_id, FC_MEI, MEI_DEVICE_ID, OBJECT_PRODUCT_CODE, OBJECT_REVISION, OBJECT_VENDOR_NAME};
use crate::protocol::util::join_target;
use crate::protocol::{ProtocolOptions, UNIT_ID};
use crate::tag::{bytes_to_words, words_to_bytes, ByteOrder, TagValue};
use crate::vendor::Vendor;

/// Modbus-TCP port
pub const DEFAULT_PORT: u16 = 502;

/// Delta remote run/stop register: 1 runs, 0 stops
pub const DELTA_RUN_REGISTER: u16 = 0x1000 + 9046;

const MAX_READ_REGISTERS: usize = 125;
const MAX_WRITE_REGISTERS: usize = 123;
const MAX_READ_BITS: usize = 2000;
const MAX_WRITE_BITS: usize = 1968;

/// The four Modbus data tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// Read/write bits (function codes 1, 5, 15)
    Coils,
    /// Read-only bits (function code 2)
    DiscreteInputs,
    /// Read-only registers (function code 4)
    InputRegisters,
    /// Read/write registers (function codes 3, 6, 16)
    HoldingRegisters,
}

impl Table {
    /// Bit tables count bits, register tables count 16-bit words
    pub fn is_bit(&self) -> bool {
        matches!(self, Table::Coils | Table::DiscreteInputs)
    }

    /// Whether the table accepts writes
    pub fn is_writable(&self) -> bool {
        matches!(self, Table::Coils | Table::HoldingRegisters)
    }
}

/// Where a device address lives in the Modbus address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapped {
    /// Table
    pub table: Table,
    /// First coil or register number
    pub start: u32,
}

/// Map a device address onto a Modbus table for a vendor
pub fn map_address(vendor: Vendor, address: &Address) -> Result<Mapped> {
    let n = address.offset;
    let mapped = match (vendor, address.area, address.width) {
        (Vendor::Delta, MemoryArea::Input, _) => (Table::DiscreteInputs, 0x0400 + n),
        (Vendor::Delta, MemoryArea::Output, _) => (Table::Coils, 0x0500 + n),
        (Vendor::Delta, MemoryArea::Memory, _) if n < 1536 => (Table::Coils, 0x0800 + n),
        (Vendor::Delta, MemoryArea::Memory, _) => (Table::Coils, 0xB000 + (n - 1536)),
        (Vendor::Delta, MemoryArea::Special, _) => (Table::Coils, n),
        (Vendor::Delta, MemoryArea::Data, _) if n < 4096 => (Table::HoldingRegisters, 0x1000 + n),
        (Vendor::Delta, MemoryArea::Data, _) => (Table::HoldingRegisters, 0x9000 + (n - 4096)),
        (Vendor::Delta, MemoryArea::Timer, _) => (Table::HoldingRegisters, 0x0600 + n),
        (Vendor::Delta, MemoryArea::Counter, _) => (Table::HoldingRegisters, 0x0E00 + n),

        (Vendor::Schneider, MemoryArea::Input, BitWidth::Bit) => (Table::DiscreteInputs, n),
        (Vendor::Schneider, MemoryArea::Input, _) => (Table::InputRegisters, n),
        (Vendor::Schneider, MemoryArea::Output | MemoryArea::Memory, BitWidth::Bit) => (Table::Coils, n),
        (Vendor::Schneider, MemoryArea::Memory, BitWidth::DWord) => (Table::HoldingRegisters, n * 2),
        (Vendor::Schneider, MemoryArea::Output | MemoryArea::Memory, _) => (Table::HoldingRegisters, n),

        (_, MemoryArea::Output, BitWidth::Bit) => (Table::Coils, n),
        (_, MemoryArea::Input, BitWidth::Bit) => (Table::DiscreteInputs, n),
        (_, MemoryArea::Input, _) => (Table::InputRegisters, n),
        (_, MemoryArea::Data, _) => (Table::HoldingRegisters, n),
        _ => {
            return Err(DeviceError::unsupported(
                vendor,
                format!("{} has no Modbus mapping", address),
            ))
        }
    };
    Ok(Mapped {
        table: mapped.0,
        start: mapped.1,
    })
}

/// Check that `count` items from `start` stay inside the 16-bit address space
fn span(address: &Address, start: u32, count: usize) -> Result<u16> {
    if start as usize + count > 0x1_0000 {
        return Err(DeviceError::invalid_value(
            address.to_string(),
            "outside the Modbus address space",
        ));
    }
    Ok(start as u16)
}

/// Device identification objects of a Modbus server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identification {
    /// Object 0x00
    pub vendor_name: Option<String>,
    /// Object 0x01
    pub product_code: Option<String>,
    /// Object 0x02
    pub revision: Option<String>,
}

impl Identification {
    /// Pick the basic objects out of a device identification response PDU
    pub fn from_pdu(pdu: &[u8]) -> Self {
        let mut id = Self::default();
        for (object, value) in parse_device_id(pdu) {
            let value = Some(value).filter(|v| !v.is_empty());
            match object {
                OBJECT_VENDOR_NAME => id.vendor_name = value,
                OBJECT_PRODUCT_CODE => id.product_code = value,
                OBJECT_REVISION => id.revision = value,
                _ => {}
            }
        }
        id
    }
}

struct Session {
    // Context is Send but not Sync; only ever reached through `get_mut`
    ctx: Mutex<Context>,
    vendor: Vendor,
    target: String,
    unit: u8,
    request_timeout: Duration,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target)
            .field("unit", &self.unit)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn ctx(&mut self) -> &mut Context {
        self.ctx.get_mut()
    }

    /// Flatten timeout, transport error and Modbus exception into one result
    fn settle<T>(&self, result: std::result::Result<tokio_modbus::Result<T>, Elapsed>) -> Result<T> {
        match result {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(exception))) => Err(DeviceError::protocol(
                self.vendor,
                self.target.clone(),
                format!("Modbus exception: {}", exception),
            )),
            Ok(Err(e)) => Err(DeviceError::connection(self.vendor, self.target.clone(), e)),
            Err(_) => Err(DeviceError::Timeout {
                vendor: self.vendor,
                target: self.target.clone(),
            }),
        }
    }

    async fn read_bits(&mut self, table: Table, start: u16, count: usize) -> Result<Vec<bool>> {
        let mut bits = Vec::with_capacity(count);
        while bits.len() < count {
            let n = MAX_READ_BITS.min(count - bits.len());
            let addr = start + bits.len() as u16;
            let result = match table {
                Table::Coils => timeout(self.request_timeout, self.ctx().read_coils(addr, n as u16)).await,
                _ => timeout(self.request_timeout, self.ctx().read_discrete_inputs(addr, n as u16)).await,
            };
            let mut chunk = self.settle(result)?;
            chunk.truncate(n);
            bits.extend(chunk);
        }
        Ok(bits)
    }

    async fn read_registers(&mut self, table: Table, start: u16, count: usize) -> Result<Vec<u16>> {
        let mut words = Vec::with_capacity(count);
        while words.len() < count {
            let n = MAX_READ_REGISTERS.min(count - words.len());
            let addr = start + words.len() as u16;
            let result = match table {
                Table::InputRegisters => {
                    timeout(self.request_timeout, self.ctx().read_input_registers(addr, n as u16)).await
                }
                _ => timeout(self.request_timeout, self.ctx().read_holding_registers(addr, n as u16)).await,
            };
            let chunk = self.settle(result)?;
            if chunk.len() < n {
                return Err(DeviceError::protocol(
                    self.vendor,
                    self.target.clone(),
                    format!("asked for {} registers, got {}", n, chunk.len()),
                ));
            }
            words.extend_from_slice(&chunk[..n]);
        }
        Ok(words)
    }

    async fn write_bits(&mut self, start: u16, bits: &[bool]) -> Result<()> {
        if let [bit] = bits {
            let result = timeout(self.request_timeout, self.ctx().write_single_coil(start, *bit)).await;
            return self.settle(result);
        }
        for (i, part) in bits.chunks(MAX_WRITE_BITS).enumerate() {
            let addr = start + (i * MAX_WRITE_BITS) as u16;
            let result = timeout(self.request_timeout, self.ctx().write_multiple_coils(addr, part)).await;
            self.settle(result)?;
        }
        Ok(())
    }

    async fn write_registers(&mut self, start: u16, words: &[u16]) -> Result<()> {
        if let [word] = words {
            let result = timeout(self.request_timeout, self.ctx().write_single_register(start, *word)).await;
            return self.settle(result);
        }
        for (i, part) in words.chunks(MAX_WRITE_REGISTERS).enumerate() {
            let addr = start + (i * MAX_WRITE_REGISTERS) as u16;
            let result = timeout(self.request_timeout, self.ctx().write_multiple_registers(addr, part)).await;
            self.settle(result)?;
        }
        Ok(())
    }

    /// Read Device Identification, basic objects (function 43, MEI 14)
    async fn identify(&mut self) -> Result<Identification> {
        let request = Request::Custom(FC_MEI, Cow::Borrowed(&[MEI_DEVICE_ID, 0x01, 0x00]));
        let result = timeout(self.request_timeout, self.ctx().call(request)).await;
        match self.settle(result)? {
            Response::Custom(function, data) if function == FC_MEI => {
                let mut pdu = vec![function];
                pdu.extend_from_slice(&data);
                Ok(Identification::from_pdu(&pdu))
            }
            other => Err(DeviceError::protocol(
                self.vendor,
                self.target.clone(),
                format!("unexpected identification response {:?}", other),
            )),
        }
    }
}

/// Modbus-TCP driver
///
/// One type serves Delta, Schneider and generic servers; the vendor picks
/// the register map and whether run/stop is available.
#[derive(Debug)]
pub struct ModbusDriver {
    vendor: Vendor,
    config: SharedConfig,
    session: Option<Session>,
    target: Option<String>,
    info: Option<DeviceInfo>,
    identification: Identification,
    errors: ErrorSlot,
}

impl ModbusDriver {
    /// Create a disconnected driver for a Modbus vendor
    pub fn new(vendor: Vendor, config: SharedConfig) -> Self {
        Self {
            vendor,
            config,
            session: None,
            target: None,
            info: None,
            identification: Identification::default(),
            errors: ErrorSlot::default(),
        }
    }

    fn session(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or_else(|| not_connected(&self.target))
    }

    fn default_model(&self) -> &'static str {
        match self.vendor {
            Vendor::Delta => "DVP",
            Vendor::Schneider => "Modicon",
            _ => "Modbus server",
        }
    }

    async fn open(&mut self, address: &str, options: &ProtocolOptions) -> Result<()> {
        let config = self.config.clone();
        let connection = &config.get().connection;
        let (host, port) = resolve_target(address, options, DEFAULT_PORT)?;
        let unit = match options.get_u16(UNIT_ID)? {
            Some(unit) => {
                u8::try_from(unit).map_err(|_| DeviceError::invalid_value(UNIT_ID, "unit id must be below 256"))?
            }
            None => connection.modbus_unit_id,
        };
        let connect_timeout = options.timeout_or(connection.connect_timeout());
        let request_timeout = options.timeout_or(connection.request_timeout());

        self.close().await;
        let target = join_target(&host, port);
        self.target = Some(target.clone());

        let peer = lookup_host((host.as_str(), port))
            .await
            .map_err(|e| DeviceError::connection(self.vendor, target.clone(), e))?
            .next()
            .ok_or_else(|| DeviceError::connection(self.vendor, target.clone(), "host did not resolve"))?;
        let ctx = match timeout(connect_timeout, tcp::connect_slave(peer, Slave(unit))).await {
            Ok(Ok(ctx)) => ctx,
            Ok(Err(e)) => return Err(DeviceError::connection(self.vendor, target, e)),
            Err(_) => {
                return Err(DeviceError::Timeout {
                    vendor: self.vendor,
                    target,
                })
            }
        };
        let mut session = Session {
            ctx: Mutex::new(ctx),
            vendor: self.vendor,
            target,
            unit,
            request_timeout,
        };

        let identification = match session.identify().await {
            Ok(id) => id,
            Err(e) if !e.is_transport_failure() => {
                // many small controllers answer function 43 with an exception
                debug!("Device identification unavailable at {}: {}", session.target, e);
                Identification::default()
            }
            Err(e) => return Err(e),
        };
        if let Some(name) = &identification.vendor_name {
            let named = crate::probe::modbus::modbus_vendor(Some(name), self.vendor);
            if named != self.vendor {
                warn!("{} identifies as {} but is driven as {}", session.target, name, self.vendor);
            }
        }

        let mut info = DeviceInfo::new(self.vendor, host.clone());
        info.model = identification
            .product_code
            .clone()
            .unwrap_or_else(|| self.default_model().to_string());
        info.firmware = identification.revision.clone().unwrap_or_default();
        info.additional.insert("unit_id".to_string(), Value::from(unit));
        if let Some(name) = &identification.vendor_name {
            info.additional
                .insert("vendor_name".to_string(), Value::from(name.as_str()));
        }

        info!("Connected to {} Modbus server at {}:{} (unit {})", self.vendor, host, port, unit);
        self.session = Some(session);
        self.info = Some(info);
        self.identification = identification;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.ctx().disconnect().await {
                debug!("Modbus disconnect from {}: {}", session.target, e);
            }
            info!("Disconnected from Modbus server at {}", session.target);
        }
        self.info = None;
        self.identification = Identification::default();
    }

    async fn read_area(&mut self, address: &Address, count: usize) -> Result<Vec<u8>> {
        check_count(address, count)?;
        let mapped = map_address(self.vendor, address)?;
        let session = self.session()?;

        if mapped.table.is_bit() {
            let start = span(address, mapped.start, count)?;
            let bits = session.read_bits(mapped.table, start, count).await?;
            return Ok(bits.into_iter().map(u8::from).collect());
        }
        let words = words_for(count);
        let start = span(address, mapped.start, words)?;
        let mut bytes = words_to_bytes(&session.read_registers(mapped.table, start, words).await?);
        bytes.truncate(count);
        Ok(bytes)
    }

    async fn write_area(&mut self, address: &Address, data: &[u8]) -> Result<()> {
        check_count(address, data.len())?;
        let mapped = map_address(self.vendor, address)?;
        if !mapped.table.is_writable() {
            return Err(DeviceError::invalid_value(
                address.to_string(),
                format!("{:?} are read only", mapped.table),
            ));
        }
        let session = self.session()?;

        if mapped.table.is_bit() {
            let start = span(address, mapped.start, data.len())?;
            let bits: Vec<bool> = data.iter().map(|b| *b != 0).collect();
            return session.write_bits(start, &bits).await;
        }
        if data.len() % 2 != 0 {
            return Err(DeviceError::invalid_value(
                address.to_string(),
                "registers are written in whole words",
            ));
        }
        let words = bytes_to_words(data);
        let start = span(address, mapped.start, words.len())?;
        session.write_registers(start, &words).await
    }

    async fn read_value(&mut self, name: &str) -> Result<TagValue> {
        let address = tag_address(self.vendor, name)?;
        let bytes = self.read_area(&address, value_len(&address)).await?;
        decode_tag(name, &address, &bytes, ByteOrder::Big)
    }

    async fn write_value(&mut self, name: &str, value: &Value) -> Result<()> {
        let address = tag_address(self.vendor, name)?;
        let bytes = encode_tag(name, &address, value, ByteOrder::Big)?;
        if is_bit(&address) && bytes.len() != 1 {
            return Err(DeviceError::invalid_value(name, "expected a single bit"));
        }
        self.write_area(&address, &bytes).await
    }

    async fn set_run(&mut self, run: bool) -> Result<()> {
        if self.vendor != Vendor::Delta {
            let operation = if run { "start" } else { "stop" };
            return Err(DeviceError::unsupported(self.vendor, operation));
        }
        self.session()?.write_registers(DELTA_RUN_REGISTER, &[u16::from(run)]).await
    }

    async fn read_mode(&mut self) -> Result<PlcMode> {
        if self.vendor != Vendor::Delta {
            self.session()?;
            return Ok(PlcMode::Unknown);
        }
        let words = self
            .session()?
            .read_registers(Table::HoldingRegisters, DELTA_RUN_REGISTER, 1)
            .await?;
        Ok(match words.first() {
            Some(1) => PlcMode::Run,
            Some(_) => PlcMode::Stop,
            None => PlcMode::Unknown,
        })
    }
}

#[async_trait]
impl PlcDevice for ModbusDriver {
    fn vendor(&self) -> Vendor {
        self.vendor
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
        let result = self.session().map(|_| ());
        let result = result.map(|_| {
            let mut status = ProtectionStatus::default();
            // plain Modbus reaches process data only
            if self.vendor != Vendor::Delta {
                status.access_level = AccessLevel::ReadWrite;
            }
            status
        });
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

    async fn start(&mut self) -> Result<()> {
        let result = self.set_run(true).await;
        self.errors.record(result)
    }

    async fn stop(&mut self) -> Result<()> {
        let result = self.set_run(false).await;
        self.errors.record(result)
    }

    async fn get_mode(&mut self) -> Result<PlcMode> {
        let result = self.read_mode().await;
        self.errors.record(result)
    }

    async fn authenticate(&mut self, _secret: &str) -> Result<()> {
        let result = Err(DeviceError::unsupported(self.vendor, "authenticate"));
        self.errors.record(result)
    }

    async fn get_diagnostics(&mut self) -> Result<Metadata> {
        let mut diagnostics = Metadata::new();
        diagnostics.insert("vendor".to_string(), Value::from(self.vendor.as_str()));
        diagnostics.insert("connected".to_string(), Value::Bool(self.session.is_some()));
        if let Some(session) = &self.session {
            diagnostics.insert("unit_id".to_string(), Value::from(session.unit));
        }
        if let Some(name) = &self.identification.vendor_name {
            diagnostics.insert("vendor_name".to_string(), Value::from(name.as_str()));
        }
        if let Some(error) = self.errors.get() {
            diagnostics.insert("last_error".to_string(), Value::String(error));
        }
        Ok(diagnostics)
    }
}
