/*!
 * Omron FINS driver.
 *
 * FINS commands over UDP port 9600. Word and bit accesses use the native
 * memory area codes, so bit writes never read-modify-write.
 */
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use plcbridge_core::config::SharedConfig;
use plcbridge_core::types::{Metadata, Value};

use super::transport::UdpTransport;
use super::{check_count, decode_tag, encode_tag, is_bit, not_connected, resolve_target, tag_address, value_len, words_for};
use crate::address::{Address, MemoryArea};
use crate::device::{DeviceError, DeviceInfo, ErrorSlot, PlcDevice, PlcMode, ProtectionStatus, Result};
use crate::probe::ascii_field;
use crate::probe::fins::{header, response_end_code, CONTROLLER_DATA_READ, DEFAULT_SOURCE_NODE, HEADER_LEN};
use crate::protocol::util::join_target;
use crate::protocol::{ProtocolOptions, FINS_NODE};
use crate::tag::{ByteOrder, TagValue};
use crate::vendor::Vendor;

/// FINS/UDP port
pub const DEFAULT_PORT: u16 = 9600;

const MEMORY_AREA_READ: [u8; 2] = [0x01, 0x01];
const MEMORY_AREA_WRITE: [u8; 2] = [0x01, 0x02];
const RUN: [u8; 2] = [0x04, 0x01];
const STOP: [u8; 2] = [0x04, 0x02];
const CONTROLLER_STATUS_READ: [u8; 2] = [0x06, 0x01];
const ACCESS_RIGHT_ACQUIRE: [u8; 2] = [0x0C, 0x01];
const ACCESS_RIGHT_RELEASE: [u8; 2] = [0x0C, 0x03];

/// Program number addressing every program
const ALL_PROGRAMS: [u8; 2] = [0xFF, 0xFF];
const MODE_RUN: u8 = 0x04;
/// Largest word count per memory area command
const MAX_WORDS: usize = 500;
/// Counter PVs share the timer area, offset by this much
const COUNTER_BASE: u32 = 0x8000;

/// FINS memory area code for an address
fn area_code(address: &Address) -> u8 {
    let bit = is_bit(address);
    match address.area {
        MemoryArea::Input | MemoryArea::Output if bit => 0x30,
        MemoryArea::Input | MemoryArea::Output => 0xB0,
        MemoryArea::Memory if bit => 0x31,
        MemoryArea::Memory => 0xB1,
        MemoryArea::Special if bit => 0x33,
        MemoryArea::Special => 0xB3,
        MemoryArea::Data if bit => 0x02,
        MemoryArea::Data => 0x82,
        MemoryArea::Timer | MemoryArea::Counter => 0x89,
    }
}

fn area_item(area: u8, word: u16, bit: u8, count: u16) -> [u8; 6] {
    let word = word.to_be_bytes();
    let count = count.to_be_bytes();
    [area, word[0], word[1], bit, count[0], count[1]]
}

/// First FINS word of `units` units from `address`, rejecting spans that
/// run past the end of the area. Bit addresses count bits, the rest bytes.
fn word_span(address: &Address, units: usize) -> Result<u16> {
    let (base, limit) = match address.area {
        MemoryArea::Timer => (0, COUNTER_BASE - 1),
        MemoryArea::Counter => (COUNTER_BASE, u32::from(u16::MAX)),
        _ => (0, u32::from(u16::MAX)),
    };
    let words = if is_bit(address) {
        (usize::from(address.bit_offset.unwrap_or(0)) + units + 15) / 16
    } else {
        words_for(units)
    };
    let out_of_range = || {
        DeviceError::invalid_value(
            address.to_string(),
            format!("{} units from word {} run past the end of the area", units, address.offset),
        )
    };

    let first = base.checked_add(address.offset).ok_or_else(out_of_range)?;
    let words = u32::try_from(words).map_err(|_| out_of_range())?;
    let last = first.checked_add(words.saturating_sub(1)).ok_or_else(out_of_range)?;
    if last > limit || u16::try_from(units).is_err() {
        return Err(out_of_range());
    }
    u16::try_from(first).map_err(|_| out_of_range())
}

fn end_code_message(code: u16) -> String {
    let text = match code {
        0x0101 => "local node not in network",
        0x0205 => "response timeout in the network",
        0x0401 => "undefined command",
        0x1001 => "command too long",
        0x1002 => "command too short",
        0x1101 => "no such memory area",
        0x1103 => "address out of range",
        0x1104 => "address range exceeded",
        0x2002 => "program area protected",
        0x2101 => "area is read only",
        0x2201 => "not possible in the current mode",
        0x2202 => "not possible while stopped",
        0x2203 => "unit busy",
        0x3001 => "no access right",
        0x4001 => "service canceled",
        _ => "FINS error",
    };
    format!("{} (end code 0x{:04X})", text, code)
}

/// Operating mode from a controller status read
///
/// A fatal error wins; then the run and program bits of the status byte.
pub fn mode_from_status(data: &[u8]) -> PlcMode {
    match data.first() {
        Some(status) if status & 0x40 != 0 => PlcMode::Fault,
        Some(status) if status & 0x01 != 0 => PlcMode::Run,
        Some(status) if status & 0x02 != 0 => PlcMode::Program,
        Some(_) => PlcMode::Stop,
        None => PlcMode::Unknown,
    }
}

/// A FINS/UDP association with one CPU
#[derive(Debug)]
struct Session {
    transport: UdpTransport,
    dest_node: u8,
    source_node: u8,
    sid: u8,
}

impl Session {
    fn protocol<M: ToString>(&self, message: M) -> DeviceError {
        DeviceError::protocol(Vendor::Omron, self.transport.target(), message)
    }

    /// Send a command and return the response data after the end code
    async fn command(&mut self, command: [u8; 2], data: &[u8]) -> Result<Vec<u8>> {
        self.sid = self.sid.wrapping_add(1);
        let sid = self.sid;
        let mut frame = header(self.dest_node, self.source_node, sid).to_vec();
        frame.extend_from_slice(&command);
        frame.extend_from_slice(data);

        let reply = self
            .transport
            .request(&frame, |r| response_end_code(r, command, sid).is_some())
            .await?;
        let end_code = response_end_code(&reply, command, sid).unwrap_or(0);
        // relay and CPU error flags are not part of the completion code
        let code = end_code & 0x7F3F;
        if code != 0 {
            return Err(self.protocol(end_code_message(code)));
        }
        if end_code & 0x0040 != 0 {
            debug!("Omron CPU at {} reports a non-fatal error", self.transport.target());
        }
        Ok(reply[HEADER_LEN + 4..].to_vec())
    }

    async fn read_words(&mut self, area: u8, start: u16, words: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(words * 2);
        let mut done = 0;
        while done < words {
            let n = MAX_WORDS.min(words - done);
            let data = self
                .command(MEMORY_AREA_READ, &area_item(area, start + done as u16, 0, n as u16))
                .await?;
            if data.len() != n * 2 {
                return Err(self.protocol(format!("asked for {} words, got {} bytes", n, data.len())));
            }
            out.extend_from_slice(&data);
            done += n;
        }
        Ok(out)
    }

    async fn write_words(&mut self, area: u8, start: u16, data: &[u8]) -> Result<()> {
        for (i, part) in data.chunks(MAX_WORDS * 2).enumerate() {
            let word = start + (i * MAX_WORDS) as u16;
            let mut body = area_item(area, word, 0, (part.len() / 2) as u16).to_vec();
            body.extend_from_slice(part);
            self.command(MEMORY_AREA_WRITE, &body).await?;
        }
        Ok(())
    }
}

/// Omron CS/CJ/NJ driver
#[derive(Debug)]
pub struct OmronDriver {
    config: SharedConfig,
    session: Option<Session>,
    target: Option<String>,
    info: Option<DeviceInfo>,
    errors: ErrorSlot,
}

impl OmronDriver {
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
        let dest_node = options.get_u16(FINS_NODE)?.unwrap_or(0);
        let dest_node =
            u8::try_from(dest_node).map_err(|_| DeviceError::invalid_value(FINS_NODE, "node must be below 256"))?;
        let request_timeout: Duration = options.timeout_or(connection.request_timeout());

        self.close().await;
        self.target = Some(join_target(&host, port));

        let transport = UdpTransport::connect(Vendor::Omron, &host, port, request_timeout).await?;
        let mut session = Session {
            transport,
            dest_node,
            source_node: DEFAULT_SOURCE_NODE,
            sid: 0,
        };

        // UDP has no handshake; the controller data read proves the CPU answers
        let data = session.command(CONTROLLER_DATA_READ, &[0x00]).await;
        let mut info = DeviceInfo::new(Vendor::Omron, host.clone());
        match data {
            Ok(data) => {
                info.model = data.get(..20).and_then(ascii_field).unwrap_or_default();
                info.firmware = data.get(20..40).and_then(ascii_field).unwrap_or_default();
                info.additional
                    .insert("fins_node".to_string(), Value::from(dest_node));
            }
            Err(e) if !e.is_transport_failure() => {
                warn!("Controller data read from {} failed: {}", host, e);
            }
            Err(e) => return Err(e),
        }

        info!("Connected to Omron CPU at {}:{} ({})", host, port, info.model);
        self.session = Some(session);
        self.info = Some(info);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Disconnected from Omron CPU at {}", session.transport.target());
        }
        self.info = None;
    }

    async fn read_area(&mut self, address: &Address, count: usize) -> Result<Vec<u8>> {
        check_count(address, count)?;
        let area = area_code(address);
        let word = word_span(address, count)?;
        let session = self.session()?;

        if is_bit(address) {
            let bit = address.bit_offset.unwrap_or(0);
            let bits = session
                .command(MEMORY_AREA_READ, &area_item(area, word, bit, count as u16))
                .await?;
            if bits.len() != count {
                return Err(session.protocol(format!("asked for {} bits, got {}", count, bits.len())));
            }
            return Ok(bits.into_iter().map(|b| b & 0x01).collect());
        }
        let mut words = session.read_words(area, word, words_for(count)).await?;
        words.truncate(count);
        Ok(words)
    }

    async fn write_area(&mut self, address: &Address, data: &[u8]) -> Result<()> {
        check_count(address, data.len())?;
        let area = area_code(address);
        let word = word_span(address, data.len())?;
        let session = self.session()?;

        if is_bit(address) {
            let bit = address.bit_offset.unwrap_or(0);
            let mut body = area_item(area, word, bit, data.len() as u16).to_vec();
            body.extend(data.iter().map(|b| u8::from(*b != 0)));
            return session.command(MEMORY_AREA_WRITE, &body).await.map(|_| ());
        }
        if data.len() % 2 != 0 {
            return Err(DeviceError::invalid_value(
                address.to_string(),
                "Omron memory is written in whole words",
            ));
        }
        session.write_words(area, word, data).await
    }

    async fn read_value(&mut self, name: &str) -> Result<TagValue> {
        let address = tag_address(Vendor::Omron, name)?;
        let bytes = self.read_area(&address, value_len(&address)).await?;
        decode_tag(name, &address, &bytes, ByteOrder::Big)
    }

    async fn write_value(&mut self, name: &str, value: &Value) -> Result<()> {
        let address = tag_address(Vendor::Omron, name)?;
        let bytes = encode_tag(name, &address, value, ByteOrder::Big)?;
        self.write_area(&address, &bytes).await
    }

    async fn read_status(&mut self) -> Result<Vec<u8>> {
        self.session()?.command(CONTROLLER_STATUS_READ, &[]).await
    }

    async fn read_protection(&mut self) -> Result<ProtectionStatus> {
        let status = self.read_status().await?;
        let flags = status.first().copied().unwrap_or(0);
        let mut protection = ProtectionStatus::default();
        protection
            .details
            .insert("fatal_error".to_string(), Value::Bool(flags & 0x40 != 0));
        protection
            .details
            .insert("non_fatal_error".to_string(), Value::Bool(flags & 0x80 != 0));
        Ok(protection)
    }

    async fn acquire_access(&mut self, _secret: &str) -> Result<()> {
        // FINS access rights are not password based
        debug!("Acquiring FINS access right; the secret is not sent");
        self.session()?
            .command(ACCESS_RIGHT_ACQUIRE, &ALL_PROGRAMS)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl PlcDevice for OmronDriver {
    fn vendor(&self) -> Vendor {
        Vendor::Omron
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

    async fn start(&mut self) -> Result<()> {
        let mut data = ALL_PROGRAMS.to_vec();
        data.push(MODE_RUN);
        let result = match self.session() {
            Ok(session) => session.command(RUN, &data).await.map(|_| ()),
            Err(e) => Err(e),
        };
        self.errors.record(result)
    }

    async fn stop(&mut self) -> Result<()> {
        let result = match self.session() {
            Ok(session) => session.command(STOP, &ALL_PROGRAMS).await.map(|_| ()),
            Err(e) => Err(e),
        };
        self.errors.record(result)
    }

    async fn get_mode(&mut self) -> Result<PlcMode> {
        let result = self.read_status().await.map(|status| mode_from_status(&status));
        self.errors.record(result)
    }

    async fn authenticate(&mut self, secret: &str) -> Result<()> {
        let result = self.acquire_access(secret).await;
        self.errors.record(result)
    }

    async fn clear_authentication(&mut self) -> Result<()> {
        let result = match self.session() {
            Ok(session) => session.command(ACCESS_RIGHT_RELEASE, &ALL_PROGRAMS).await.map(|_| ()),
            Err(e) => Err(e),
        };
        self.errors.record(result)
    }

    async fn get_diagnostics(&mut self) -> Result<Metadata> {
        let mut diagnostics = Metadata::new();
        diagnostics.insert("vendor".to_string(), Value::from(Vendor::Omron.as_str()));
        diagnostics.insert("connected".to_string(), Value::Bool(self.session.is_some()));
        if let Some(session) = &self.session {
            diagnostics.insert("fins_node".to_string(), Value::from(session.dest_node));
            diagnostics.insert("last_sid".to_string(), Value::from(session.sid));
        }
        if let Some(error) = self.errors.get() {
            diagnostics.insert("last_error".to_string(), Value::String(error));
        }
        Ok(diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use plcbridge_core::config::Config;

    use super::*;
    use crate::address;
    use crate::probe::fins::tests::{model_block, respond};
    use crate::probe::testing::*;

    /// A CJ2M where D word n holds n, CIO 0 holds 0x00F0 and W is write protected
    fn fake_cpu(writes: Arc<Mutex<Vec<Vec<u8>>>>) -> impl Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static {
        move |req: &[u8]| {
            let command = [req[10], req[11]];
            let body = &req[12..];
            let reply = match command {
                CONTROLLER_DATA_READ => respond(req, 0, &model_block("CJ2M-CPU31")),
                CONTROLLER_STATUS_READ => respond(req, 0, &[0x01, 0x04, 0x00, 0x00]),
                MEMORY_AREA_READ => {
                    let (area, word, bit) = (body[0], u16::from_be_bytes([body[1], body[2]]), body[3]);
                    let count = u16::from_be_bytes([body[4], body[5]]);
                    let data: Vec<u8> = match area {
                        0x82 => (word..word + count).flat_map(|w| w.to_be_bytes()).collect(),
                        0x30 => (bit..bit + count as u8).map(|b| ((0x00F0u16 >> b) & 1) as u8).collect(),
                        _ => return Some(respond(req, 0x1101, &[])),
                    };
                    respond(req, 0, &data)
                }
                MEMORY_AREA_WRITE if body[0] == 0xB1 => respond(req, 0x2101, &[]),
                MEMORY_AREA_WRITE | RUN | STOP | ACCESS_RIGHT_ACQUIRE => {
                    writes.lock().unwrap().push(req[10..].to_vec());
                    respond(req, 0, &[])
                }
                _ => respond(req, 0x0401, &[]),
            };
            Some(reply)
        }
    }

    async fn connected() -> (OmronDriver, Arc<Mutex<Vec<Vec<u8>>>>) {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let port = spawn_udp(fake_cpu(writes.clone())).await;
        let mut driver = OmronDriver::new(SharedConfig::new(Config::default()));
        let options = ProtocolOptions::new()
            .with_port(port)
            .with_timeout(Duration::from_millis(500));
        driver.connect("127.0.0.1", &options).await.unwrap();
        (driver, writes)
    }

    #[test]
    fn test_area_codes() {
        let d = address::parse(Vendor::Omron, "D100").unwrap();
        let cio_bit = address::parse(Vendor::Omron, "CIO0.05").unwrap();
        let w = address::parse(Vendor::Omron, "W3").unwrap();
        assert_eq!(area_code(&d), 0x82);
        assert_eq!(area_code(&cio_bit), 0x30);
        assert_eq!(area_code(&w), 0xB1);
        assert_eq!(area_item(0x82, 100, 0, 2), [0x82, 0x00, 0x64, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn test_mode_from_status() {
        assert_eq!(mode_from_status(&[0x01, 0x04]), PlcMode::Run);
        assert_eq!(mode_from_status(&[0x02, 0x00]), PlcMode::Program);
        assert_eq!(mode_from_status(&[0x00, 0x00]), PlcMode::Stop);
        assert_eq!(mode_from_status(&[0x41]), PlcMode::Fault);
        assert_eq!(mode_from_status(&[]), PlcMode::Unknown);
    }

    #[test_log::test(tokio::test)]
    async fn test_connect_reads_model() {
        let (mut driver, _) = connected().await;
        let info = driver.get_device_info().await.unwrap();
        assert_eq!(info.model, "CJ2M-CPU31");
        assert_eq!(info.firmware, "V2.1");
        assert_eq!(driver.get_mode().await.unwrap(), PlcMode::Run);
    }

    #[test_log::test(tokio::test)]
    async fn test_silent_host_fails_connect() {
        let port = spawn_udp(|_| None).await;
        let mut driver = OmronDriver::new(SharedConfig::default());
        let options = ProtocolOptions::new()
            .with_port(port)
            .with_timeout(Duration::from_millis(100));
        let err = driver.connect("127.0.0.1", &options).await.unwrap_err();
        assert!(err.is_transport_failure());
        assert!(!driver.is_connected());
    }

    #[test_log::test(tokio::test)]
    async fn test_read_and_write() {
        let (mut driver, writes) = connected().await;

        assert_eq!(driver.read_tag("D100").await.unwrap().value, Value::Integer(100));
        assert_eq!(driver.read_tag("CIO0.05").await.unwrap().value, Value::Bool(true));
        assert_eq!(driver.read_tag("CIO0.03").await.unwrap().value, Value::Bool(false));

        let bits = address::parse(Vendor::Omron, "CIO0.03").unwrap();
        assert_eq!(driver.read_memory(&bits, 3).await.unwrap(), vec![0, 1, 1]);

        driver.write_tag("D10", &Value::Integer(0x0102)).await.unwrap();
        driver.write_tag("CIO1.02", &Value::Bool(true)).await.unwrap();
        let writes = writes.lock().unwrap();
        assert_eq!(writes[0], vec![0x01, 0x02, 0x82, 0x00, 0x0A, 0x00, 0x00, 0x01, 0x01, 0x02]);
        assert_eq!(writes[1], vec![0x01, 0x02, 0x30, 0x00, 0x01, 0x02, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn test_word_span() {
        let parse = |s: &str| address::parse(Vendor::Omron, s).unwrap();
        assert_eq!(word_span(&parse("D100"), 2).unwrap(), 100);
        assert_eq!(word_span(&parse("D65535"), 2).unwrap(), 0xFFFF);
        assert!(word_span(&parse("D65535"), 4).is_err());
        assert!(word_span(&parse("D65636"), 2).is_err());
        assert_eq!(word_span(&parse("CIO0.15"), 1).unwrap(), 0);
        assert!(word_span(&parse("CIO65535.15"), 2).is_err());

        // timers and counters share area 0x89, counters from 0x8000
        assert_eq!(word_span(&parse("T5"), 2).unwrap(), 5);
        assert_eq!(word_span(&parse("C5"), 2).unwrap(), 0x8005);
        assert!(word_span(&parse("T32768"), 2).is_err());
        assert!(word_span(&parse("C32768"), 2).is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_words_past_area_end_are_rejected() {
        let (mut driver, writes) = connected().await;

        let err = driver.read_tag("D65636").await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidValue { .. }), "{}", err);
        let err = driver.write_tag("D65636", &Value::Integer(7)).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidValue { .. }), "{}", err);
        assert!(writes.lock().unwrap().is_empty());

        assert_eq!(driver.read_tag("D100").await.unwrap().value, Value::Integer(100));
        assert!(driver.is_connected());
    }

    #[test_log::test(tokio::test)]
    async fn test_end_code_is_protocol_error() {
        let (mut driver, _) = connected().await;
        let err = driver.write_tag("W0", &Value::Integer(1)).await.unwrap_err();
        assert!(matches!(err, DeviceError::ProtocolError { .. }));
        assert!(err.to_string().contains("read only"));
        assert!(driver.is_connected());

        let odd = address::parse(Vendor::Omron, "D0").unwrap();
        assert!(matches!(
            driver.write_memory(&odd, &[1, 2, 3]).await,
            Err(DeviceError::InvalidValue { .. })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_control_commands() {
        let (mut driver, writes) = connected().await;
        driver.stop().await.unwrap();
        driver.start().await.unwrap();
        driver.authenticate("ignored").await.unwrap();
        let writes = writes.lock().unwrap();
        assert_eq!(writes[0], vec![0x04, 0x02, 0xFF, 0xFF]);
        assert_eq!(writes[1], vec![0x04, 0x01, 0xFF, 0xFF, 0x04]);
        assert_eq!(writes[2], vec![0x0C, 0x01, 0xFF, 0xFF]);
    }

    #[test_log::test(tokio::test)]
    async fn test_not_connected() {
        let mut driver = OmronDriver::new(SharedConfig::default());
        assert!(matches!(driver.read_tag("D0").await, Err(DeviceError::NotConnected { .. })));
        assert!(matches!(driver.start().await, Err(DeviceError::NotConnected { .. })));
        driver.disconnect().await.unwrap();
        assert!(driver.last_error().is_some());
    }
}
