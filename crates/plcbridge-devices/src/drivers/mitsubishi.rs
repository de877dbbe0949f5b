/*!
 * Mitsubishi MELSEC driver: MC protocol, 3E frame, binary code.
 */
use async_trait::async_trait;
use tracing::{debug, info, warn};

use plcbridge_core::config::SharedConfig;
use plcbridge_core::types::{Metadata, Value};

use super::transport::TcpTransport;
use super::{check_count, decode_tag, encode_tag, is_bit, not_connected, resolve_target, tag_address, value_len, words_for};
use crate::address::{Address, BitWidth, MemoryArea};
use crate::device::{DeviceError, DeviceInfo, ErrorSlot, PlcDevice, PlcMode, ProtectionStatus, Result};
use crate::probe::ascii_field;
use crate::probe::mc::{parse_response, request, CMD_CPU_MODEL, DEFAULT_TIMER, FRAMING};
use crate::protocol::util::join_target;
use crate::protocol::ProtocolOptions;
use crate::tag::{ByteOrder, TagValue};
use crate::vendor::Vendor;

/// MC protocol TCP port
pub const DEFAULT_PORT: u16 = 5000;

const CMD_BATCH_READ: u16 = 0x0401;
const CMD_BATCH_WRITE: u16 = 0x1401;
const CMD_REMOTE_RUN: u16 = 0x1001;
const CMD_REMOTE_STOP: u16 = 0x1002;
const CMD_PASSWORD_UNLOCK: u16 = 0x1630;
const CMD_PASSWORD_LOCK: u16 = 0x1631;
const SUB_WORD: u16 = 0x0000;
const SUB_BIT: u16 = 0x0001;

/// Points per batch request
const MAX_WORDS: usize = 960;
const MAX_BITS: usize = 3584;

/// Special register holding the CPU operating status
const SD_CPU_STATUS: u32 = 203;

/// Device codes of the binary frame
pub mod device_code {
    /// Input relay X
    pub const X: u8 = 0x9C;
    /// Output relay Y
    pub const Y: u8 = 0x9D;
    /// Internal relay M
    pub const M: u8 = 0x90;
    /// Special relay SM
    pub const SM: u8 = 0x91;
    /// Special register SD
    pub const SD: u8 = 0xA9;
    /// Data register D
    pub const D: u8 = 0xA8;
    /// Link register W
    pub const W: u8 = 0xB4;
    /// Timer current value TN
    pub const TN: u8 = 0xC2;
    /// Counter current value CN
    pub const CN: u8 = 0xC5;
}

/// Device code of an address
pub fn device_code_of(address: &Address) -> u8 {
    match (address.area, address.width) {
        (MemoryArea::Input, _) => device_code::X,
        (MemoryArea::Output, _) => device_code::Y,
        (MemoryArea::Memory, BitWidth::Bit) => device_code::M,
        (MemoryArea::Memory, _) => device_code::W,
        (MemoryArea::Special, BitWidth::Bit) => device_code::SM,
        (MemoryArea::Special, _) => device_code::SD,
        (MemoryArea::Data, _) => device_code::D,
        (MemoryArea::Timer, _) => device_code::TN,
        (MemoryArea::Counter, _) => device_code::CN,
    }
}

/// Highest device number a 3E batch request can carry
const MAX_DEVICE: u32 = 0xFF_FFFF;

/// Check that `points` devices from `address` stay within the 24-bit head
/// device field and return the head device
fn device_span(address: &Address, points: usize) -> Result<u32> {
    let last = u32::try_from(points)
        .ok()
        .and_then(|points| address.offset.checked_add(points.saturating_sub(1)));
    match last {
        Some(last) if last <= MAX_DEVICE => Ok(address.offset),
        _ => Err(DeviceError::invalid_value(
            address.to_string(),
            format!("{} points from device {} exceed the 3E device range", points, address.offset),
        )),
    }
}

/// Head device, device code and point count of a batch request
fn batch_data(head: u32, code: u8, points: usize) -> Vec<u8> {
    let mut data = head.to_le_bytes()[..3].to_vec();
    data.push(code);
    data.extend_from_slice(&(points as u16).to_le_bytes());
    data
}

/// Bit-unit device data: two points per byte, the first in the high nibble
pub fn pack_nibbles(bits: &[u8]) -> Vec<u8> {
    bits.chunks(2)
        .map(|pair| {
            let high = u8::from(pair[0] != 0) << 4;
            let low = pair.get(1).map_or(0, |b| u8::from(*b != 0));
            high | low
        })
        .collect()
}

/// Inverse of [`pack_nibbles`]
pub fn unpack_nibbles(bytes: &[u8], count: usize) -> Vec<u8> {
    (0..count)
        .map(|i| {
            let byte = bytes.get(i / 2).copied().unwrap_or(0);
            if i % 2 == 0 {
                (byte >> 4) & 0x01
            } else {
                byte & 0x01
            }
        })
        .collect()
}

fn end_code_message(code: u16) -> String {
    let text = match code {
        0x4013 => "not possible while the CPU is running",
        0x4030 => "device not specified correctly",
        0x4031 => "device number out of range",
        0xC051..=0xC054 => "number of points out of range",
        0xC056 => "address exceeds the device range",
        0xC058 => "request data length mismatch",
        0xC059 => "command or subcommand not supported",
        0xC05B => "device cannot be read or written",
        0xC05C => "request content error",
        0xC061 => "request data length error",
        0xC200..=0xC205 => "remote password error",
        0xC810..=0xC815 => "remote password mismatch",
        _ => "MC protocol error",
    };
    format!("{} (end code 0x{:04X})", text, code)
}

/// Operating mode from the SD203 CPU status word
pub fn mode_from_cpu_status(status: u16) -> PlcMode {
    match status & 0x000F {
        0 => PlcMode::Run,
        2 | 3 => PlcMode::Stop,
        _ => PlcMode::Unknown,
    }
}

#[derive(Debug)]
struct Session {
    transport: TcpTransport,
}

impl Session {
    fn protocol<M: ToString>(&self, message: M) -> DeviceError {
        DeviceError::protocol(Vendor::Mitsubishi, self.transport.target(), message)
    }

    async fn command(&mut self, command: u16, subcommand: u16, data: &[u8]) -> Result<Vec<u8>> {
        let frame = request(command, subcommand, data, DEFAULT_TIMER);
        let reply = self.transport.request(&frame, FRAMING).await?;
        let (end_code, data) = parse_response(&reply).ok_or_else(|| self.protocol("malformed 3E response"))?;
        if end_code != 0 {
            return Err(self.protocol(end_code_message(end_code)));
        }
        Ok(data.to_vec())
    }

    async fn read_words(&mut self, code: u8, head: u32, words: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(words * 2);
        let mut done = 0;
        while done < words {
            let n = MAX_WORDS.min(words - done);
            let data = self
                .command(CMD_BATCH_READ, SUB_WORD, &batch_data(head + done as u32, code, n))
                .await?;
            if data.len() != n * 2 {
                return Err(self.protocol(format!("asked for {} words, got {} bytes", n, data.len())));
            }
            out.extend_from_slice(&data);
            done += n;
        }
        Ok(out)
    }

    async fn read_bits(&mut self, code: u8, head: u32, count: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let n = MAX_BITS.min(count - out.len());
            let data = self
                .command(CMD_BATCH_READ, SUB_BIT, &batch_data(head + out.len() as u32, code, n))
                .await?;
            if data.len() < (n + 1) / 2 {
                return Err(self.protocol(format!("asked for {} points, got {} bytes", n, data.len())));
            }
            out.extend(unpack_nibbles(&data, n));
        }
        Ok(out)
    }

    async fn write_words(&mut self, code: u8, head: u32, data: &[u8]) -> Result<()> {
        for (i, part) in data.chunks(MAX_WORDS * 2).enumerate() {
            let mut body = batch_data(head + (i * MAX_WORDS) as u32, code, part.len() / 2);
            body.extend_from_slice(part);
            self.command(CMD_BATCH_WRITE, SUB_WORD, &body).await?;
        }
        Ok(())
    }

    async fn write_bits(&mut self, code: u8, head: u32, bits: &[u8]) -> Result<()> {
        for (i, part) in bits.chunks(MAX_BITS).enumerate() {
            let mut body = batch_data(head + (i * MAX_BITS) as u32, code, part.len());
            body.extend(pack_nibbles(part));
            self.command(CMD_BATCH_WRITE, SUB_BIT, &body).await?;
        }
        Ok(())
    }
}

/// Mitsubishi MELSEC iQ-R / Q / L / iQ-F driver
#[derive(Debug)]
pub struct MitsubishiDriver {
    config: SharedConfig,
    session: Option<Session>,
    target: Option<String>,
    info: Option<DeviceInfo>,
    errors: ErrorSlot,
}

impl MitsubishiDriver {
    /// Create a disconnected driver
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            session: None,
            target: None,
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

        self.close().await;
        self.target = Some(join_target(&host, port));

        let transport = TcpTransport::connect(
            Vendor::Mitsubishi,
            &host,
            port,
            options.timeout_or(connection.connect_timeout()),
            options.timeout_or(connection.request_timeout()),
        )
        .await?;
        let mut session = Session { transport };

        let mut info = DeviceInfo::new(Vendor::Mitsubishi, host.clone());
        match session.command(CMD_CPU_MODEL, 0x0000, &[]).await {
            Ok(data) => {
                info.model = data.get(..16).and_then(ascii_field).unwrap_or_default();
                if let Some(code) = data.get(16..18) {
                    let code = u16::from_le_bytes([code[0], code[1]]);
                    info.additional
                        .insert("model_code".to_string(), Value::String(format!("0x{:04X}", code)));
                }
            }
            // FX3 Ethernet modules answer the model read with an error
            Err(e) if !e.is_transport_failure() => warn!("CPU model read from {} failed: {}", host, e),
            Err(e) => return Err(e),
        }

        info!("Connected to Mitsubishi CPU at {}:{} ({})", host, port, info.model);
        self.session = Some(session);
        self.info = Some(info);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.transport.shutdown().await;
            info!("Disconnected from Mitsubishi CPU at {}", session.transport.target());
        }
        self.info = None;
    }

    async fn read_area(&mut self, address: &Address, count: usize) -> Result<Vec<u8>> {
        check_count(address, count)?;
        let code = device_code_of(address);
        let points = if is_bit(address) { count } else { words_for(count) };
        let head = device_span(address, points)?;
        let session = self.session()?;
        if is_bit(address) {
            return session.read_bits(code, head, count).await;
        }
        let mut bytes = session.read_words(code, head, points).await?;
        bytes.truncate(count);
        Ok(bytes)
    }

    async fn write_area(&mut self, address: &Address, data: &[u8]) -> Result<()> {
        check_count(address, data.len())?;
        let code = device_code_of(address);
        if !is_bit(address) && data.len() % 2 != 0 {
            return Err(DeviceError::invalid_value(
                address.to_string(),
                "word devices are written in whole words",
            ));
        }
        let points = if is_bit(address) { data.len() } else { data.len() / 2 };
        let head = device_span(address, points)?;
        let session = self.session()?;
        if is_bit(address) {
            session.write_bits(code, head, data).await
        } else {
            session.write_words(code, head, data).await
        }
    }

    async fn read_value(&mut self, name: &str) -> Result<TagValue> {
        let address = tag_address(Vendor::Mitsubishi, name)?;
        let bytes = self.read_area(&address, value_len(&address)).await?;
        decode_tag(name, &address, &bytes, ByteOrder::Little)
    }

    async fn write_value(&mut self, name: &str, value: &Value) -> Result<()> {
        let address = tag_address(Vendor::Mitsubishi, name)?;
        let bytes = encode_tag(name, &address, value, ByteOrder::Little)?;
        self.write_area(&address, &bytes).await
    }

    async fn read_mode(&mut self) -> Result<PlcMode> {
        let bytes = self.session()?.read_words(device_code::SD, SD_CPU_STATUS, 1).await?;
        Ok(mode_from_cpu_status(u16::from_le_bytes([bytes[0], bytes[1]])))
    }

    async fn remote_run(&mut self) -> Result<()> {
        // do not force, keep device memory
        self.session()?
            .command(CMD_REMOTE_RUN, 0x0000, &[0x01, 0x00, 0x00, 0x00])
            .await
            .map(|_| ())
    }

    async fn remote_stop(&mut self) -> Result<()> {
        self.session()?
            .command(CMD_REMOTE_STOP, 0x0000, &[0x01, 0x00])
            .await
            .map(|_| ())
    }

    async fn unlock(&mut self, password: &str) -> Result<()> {
        if password.is_empty() || password.len() > 32 || !password.is_ascii() {
            return Err(DeviceError::invalid_value(
                "password",
                "remote passwords are 1 to 32 ASCII characters",
            ));
        }
        let mut data = (password.len() as u16).to_le_bytes().to_vec();
        data.extend_from_slice(password.as_bytes());
        self.session()?.command(CMD_PASSWORD_UNLOCK, 0x0000, &data).await?;
        debug!("Remote password accepted");
        Ok(())
    }

    async fn lock(&mut self) -> Result<()> {
        self.session()?.command(CMD_PASSWORD_LOCK, 0x0000, &[]).await.map(|_| ())
    }
}

#[async_trait]
impl PlcDevice for MitsubishiDriver {
    fn vendor(&self) -> Vendor {
        Vendor::Mitsubishi
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

    async fn start(&mut self) -> Result<()> {
        let result = self.remote_run().await;
        self.errors.record(result)
    }

    async fn stop(&mut self) -> Result<()> {
        let result = self.remote_stop().await;
        self.errors.record(result)
    }

    async fn get_mode(&mut self) -> Result<PlcMode> {
        let result = self.read_mode().await;
        self.errors.record(result)
    }

    async fn authenticate(&mut self, secret: &str) -> Result<()> {
        let result = self.unlock(secret).await;
        self.errors.record(result)
    }

    async fn clear_authentication(&mut self) -> Result<()> {
        let result = self.lock().await;
        self.errors.record(result)
    }

    async fn get_diagnostics(&mut self) -> Result<Metadata> {
        let mut diagnostics = Metadata::new();
        diagnostics.insert("vendor".to_string(), Value::from(Vendor::Mitsubishi.as_str()));
        diagnostics.insert("connected".to_string(), Value::Bool(self.session.is_some()));
        diagnostics.insert("frame".to_string(), Value::from("3E binary"));
        if let Some(error) = self.errors.get() {
            diagnostics.insert("last_error".to_string(), Value::String(error));
        }
        Ok(diagnostics)
    }
}
