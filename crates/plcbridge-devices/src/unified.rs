/*!
 * The unified PLC façade.
 *
 * [`UnifiedPlc`] owns exactly one driver and proxies the capability
 * interface to it while connected. It tracks a small state machine:
 *
 * ```text
 * Disconnected -> Probing -> Connected -> Disconnected
 *        \            \          \
 *         +------------+----------+--> Faulted (terminal)
 * ```
 *
 * Calls made outside `Connected` fail with `NotConnected` without any
 * network I/O. A transport failure while connected moves the façade to
 * `Faulted`; a device that merely rejects a request leaves it connected.
 * Dropping the façade drops the driver and with it the socket.
 *
 * [`UnifiedPlc::monitor`] hands the façade to a background task that polls
 * a set of tags and reports value changes; [`TagMonitor::stop`] gives it
 * back.
 */
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use plcbridge_core::types::{Metadata, Value};

use crate::address::Address;
use crate::device::{AccessLevel, DeviceError, DeviceInfo, PlcDevice, PlcMode, ProtectionStatus, Result};
use crate::program::{BlockInfo, PlcProgram};
use crate::protocol::ProtocolOptions;
use crate::tag::TagValue;
use crate::vendor::Vendor;

/// Connection state of a façade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session
    Disconnected,
    /// Detecting the vendor
    Probing,
    /// Session open, calls are proxied
    Connected,
    /// An unrecoverable error occurred; create a new façade to retry
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Probing => "probing",
            ConnectionState::Connected => "connected",
            ConnectionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    target: String,
    vendor: Option<Vendor>,
    last_error: Option<String>,
}

/// Read-only view of a façade's state
///
/// Cloned handles stay valid while the façade is busy with I/O, so other
/// tasks can poll connection state and the last error.
#[derive(Debug, Clone)]
pub struct StatusHandle(Arc<RwLock<Status>>);

impl StatusHandle {
    fn new(target: &str) -> Self {
        Self(Arc::new(RwLock::new(Status {
            state: ConnectionState::Disconnected,
            target: target.to_string(),
            vendor: None,
            last_error: None,
        })))
    }

    fn read<T>(&self, f: impl FnOnce(&Status) -> T) -> T {
        f(&self.0.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn update(&self, f: impl FnOnce(&mut Status)) {
        f(&mut self.0.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.read(|s| s.state)
    }

    /// Whether calls are currently proxied to the driver
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The last error seen through the façade
    pub fn last_error(&self) -> Option<String> {
        self.read(|s| s.last_error.clone())
    }

    /// Target address
    pub fn target(&self) -> String {
        self.read(|s| s.target.clone())
    }

    /// Vendor of the attached driver
    pub fn vendor(&self) -> Option<Vendor> {
        self.read(|s| s.vendor)
    }
}

/// Proxy a driver call: fail fast when not connected, then settle the result
macro_rules! proxy {
    ($plc:ident, |$driver:ident| $call:expr) => {{
        let result = match $plc.connected_driver() {
            Ok($driver) => $call.await,
            Err(e) => Err(e),
        };
        $plc.settle(result).await
    }};
}

/// Shortest polling interval a monitor accepts
pub const MIN_MONITOR_INTERVAL: Duration = Duration::from_millis(1);

/// Background polling of a set of tags, started by [`UnifiedPlc::monitor`]
///
/// The monitor owns the façade while it runs. Dropping it stops polling
/// and drops the façade with it.
#[derive(Debug)]
pub struct TagMonitor {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<UnifiedPlc>,
}

impl TagMonitor {
    /// Whether polling has ended on its own because the façade left `Connected`
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop polling and take the façade back
    ///
    /// A read in flight completes first; no callback runs after this returns.
    pub async fn stop(mut self) -> Result<UnifiedPlc> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.task)
            .await
            .map_err(|e| DeviceError::InvalidState(format!("tag monitor ended abnormally: {}", e)))
    }
}

/// A vendor-neutral handle to one PLC
#[derive(Debug)]
pub struct UnifiedPlc {
    driver: Option<Box<dyn PlcDevice>>,
    status: StatusHandle,
}

impl UnifiedPlc {
    /// Wrap a disconnected driver that will talk to `target`
    pub fn new<S: AsRef<str>>(driver: Box<dyn PlcDevice>, target: S) -> Self {
        let plc = Self::detached(target.as_ref());
        plc.status.update(|s| s.vendor = Some(driver.vendor()));
        Self {
            driver: Some(driver),
            ..plc
        }
    }

    /// A façade with no driver yet, used while the factory detects the vendor
    pub(crate) fn detached(target: &str) -> Self {
        Self {
            driver: None,
            status: StatusHandle::new(target),
        }
    }

    pub(crate) fn begin_probing(&self) {
        self.status.update(|s| s.state = ConnectionState::Probing);
    }

    /// Attach the driver picked by the factory
    pub(crate) fn attach(&mut self, driver: Box<dyn PlcDevice>) {
        self.status.update(|s| s.vendor = Some(driver.vendor()));
        self.driver = Some(driver);
    }

    /// Move to `Faulted` and remember why
    pub(crate) fn fault(&self, error: &DeviceError) {
        warn!("PLC at {} faulted: {}", self.status.target(), error);
        self.status.update(|s| {
            s.state = ConnectionState::Faulted;
            s.last_error = Some(error.to_string());
        });
    }

    /// Open the session
    ///
    /// A failed connect faults the façade.
    pub async fn connect(&mut self, options: &ProtocolOptions) -> Result<()> {
        match self.status.state() {
            ConnectionState::Faulted => {
                return Err(DeviceError::InvalidState(format!(
                    "connection to {} is faulted; create a new connection to retry",
                    self.status.target()
                )))
            }
            ConnectionState::Connected => return Ok(()),
            _ => {}
        }

        let target = self.status.target();
        let Some(driver) = self.driver.as_mut() else {
            return Err(DeviceError::InvalidState(format!("no driver attached for {}", target)));
        };
        match driver.connect(&target, options).await {
            Ok(()) => {
                info!("Connected to {} PLC at {}", driver.vendor(), target);
                self.status.update(|s| s.state = ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.fault(&e);
                Err(e)
            }
        }
    }

    /// Close the session; a no-op when not connected
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(driver) = self.driver.as_mut() {
            if driver.is_connected() {
                if let Err(e) = driver.disconnect().await {
                    warn!("Disconnect from {} failed: {}", self.status.target(), e);
                }
            }
        }
        self.status.update(|s| {
            if s.state != ConnectionState::Faulted {
                s.state = ConnectionState::Disconnected;
            }
        });
        Ok(())
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.status.state()
    }

    /// Whether calls are proxied to the driver
    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// The last error seen through the façade
    pub fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    /// Vendor of the driver
    pub fn vendor(&self) -> Option<Vendor> {
        self.status.vendor()
    }

    /// Target address
    pub fn target(&self) -> String {
        self.status.target()
    }

    /// A handle for observing state from other tasks
    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// The driver, for vendor specific access
    pub fn driver(&self) -> Option<&dyn PlcDevice> {
        self.driver.as_deref()
    }

    fn connected_driver(&mut self) -> Result<&mut Box<dyn PlcDevice>> {
        match (self.status.state(), self.driver.as_mut()) {
            (ConnectionState::Connected, Some(driver)) => Ok(driver),
            _ => Err(DeviceError::NotConnected {
                target: self.status.target(),
            }),
        }
    }

    /// Record errors; a dead transport faults the façade and releases it
    async fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_transport_failure() {
                self.fault(e);
                if let Some(driver) = self.driver.as_mut() {
                    let _ = driver.disconnect().await;
                }
            } else {
                debug!("Request to {} failed: {}", self.status.target(), e);
                self.status.update(|s| s.last_error = Some(e.to_string()));
            }
        }
        result
    }

    /// Controller identity
    pub async fn get_device_info(&mut self) -> Result<DeviceInfo> {
        proxy!(self, |driver| driver.get_device_info())
    }

    /// Protection status, read fresh
    pub async fn get_protection_status(&mut self) -> Result<ProtectionStatus> {
        proxy!(self, |driver| driver.get_protection_status())
    }

    /// Access level granted to this session
    pub async fn get_access_level(&mut self) -> Result<AccessLevel> {
        proxy!(self, |driver| driver.get_access_level())
    }

    /// Read raw memory
    pub async fn read_memory(&mut self, address: &Address, count: usize) -> Result<Vec<u8>> {
        proxy!(self, |driver| driver.read_memory(address, count))
    }

    /// Write raw memory
    pub async fn write_memory(&mut self, address: &Address, data: &[u8]) -> Result<()> {
        proxy!(self, |driver| driver.write_memory(address, data))
    }

    /// Read a tag with quality and timestamp
    pub async fn read_tag(&mut self, name: &str) -> Result<TagValue> {
        proxy!(self, |driver| driver.read_tag(name))
    }

    /// Write a tag
    pub async fn write_tag(&mut self, name: &str, value: &Value) -> Result<()> {
        proxy!(self, |driver| driver.write_tag(name, value))
    }

    /// Read a value by symbolic tag or vendor address (`Motor1.Speed`, `DB1.DBD0`, `D100`)
    pub async fn read(&mut self, tag_or_address: &str) -> Result<Value> {
        Ok(self.read_tag(tag_or_address).await?.value)
    }

    /// Write a value by symbolic tag or vendor address
    pub async fn write<V: Into<Value>>(&mut self, tag_or_address: &str, value: V) -> Result<()> {
        let value = value.into();
        self.write_tag(tag_or_address, &value).await
    }

    /// Read several tags into a name to value map
    pub async fn read_multiple(&mut self, names: &[String]) -> Result<HashMap<String, Value>> {
        let tags = proxy!(self, |driver| driver.read_tags(names))?;
        Ok(tags.into_iter().map(|tag| (tag.name, tag.value)).collect())
    }

    /// Write several tags
    pub async fn write_multiple(&mut self, values: &[(String, Value)]) -> Result<()> {
        proxy!(self, |driver| driver.write_tags(values))
    }

    /// Upload the program
    pub async fn upload_program(&mut self) -> Result<PlcProgram> {
        proxy!(self, |driver| driver.upload_program())
    }

    /// Download a program
    pub async fn download_program(&mut self, program: &PlcProgram) -> Result<()> {
        proxy!(self, |driver| driver.download_program(program))
    }

    /// List program blocks
    pub async fn get_block_list(&mut self) -> Result<Vec<BlockInfo>> {
        proxy!(self, |driver| driver.get_block_list())
    }

    /// Put the controller in run mode
    pub async fn start(&mut self) -> Result<()> {
        proxy!(self, |driver| driver.start())
    }

    /// Put the controller in stop mode
    pub async fn stop(&mut self) -> Result<()> {
        proxy!(self, |driver| driver.stop())
    }

    /// Operating mode
    pub async fn get_mode(&mut self) -> Result<PlcMode> {
        proxy!(self, |driver| driver.get_mode())
    }

    /// Whether the controller is in run mode
    pub async fn is_running(&mut self) -> Result<bool> {
        Ok(self.get_mode().await? == PlcMode::Run)
    }

    /// Authenticate the session
    pub async fn authenticate(&mut self, secret: &str) -> Result<()> {
        proxy!(self, |driver| driver.authenticate(secret))
    }

    /// Alias of [`authenticate`](Self::authenticate)
    pub async fn unlock(&mut self, password: &str) -> Result<()> {
        self.authenticate(password).await
    }

    /// Drop any authentication held by the session
    pub async fn clear_authentication(&mut self) -> Result<()> {
        proxy!(self, |driver| driver.clear_authentication())
    }

    /// Driver diagnostics plus façade state
    pub async fn get_diagnostics(&mut self) -> Result<Metadata> {
        let mut diagnostics = proxy!(self, |driver| driver.get_diagnostics())?;
        diagnostics.insert("state".to_string(), Value::String(self.state().to_string()));
        Ok(diagnostics)
    }

    /// Upload the program and save it as JSON
    pub async fn backup<P: AsRef<Path>>(&mut self, path: P) -> Result<PlcProgram> {
        let program = self.upload_program().await?;
        program.save(path.as_ref()).await?;
        info!(
            "Backed up {} program ({} blocks) to {}",
            program.vendor,
            program.blocks.len(),
            path.as_ref().display()
        );
        Ok(program)
    }

    /// Poll `tags` every `interval` on a background task
    ///
    /// `on_change` gets each tag's first good read and then every read whose
    /// value differs from the previous one. A tag that fails to read is
    /// skipped for that round and the failure lands in `last_error`. Polling
    /// stops when the monitor is stopped or dropped, or when the façade is
    /// no longer connected (a transport failure faults it as usual).
    pub fn monitor<F>(self, tags: Vec<String>, interval: Duration, mut on_change: F) -> TagMonitor
    where
        F: FnMut(&str, &TagValue) + Send + 'static,
    {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let mut plc = self;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_MONITOR_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: HashMap<String, Value> = HashMap::new();
            info!(
                "Monitoring {} tags on {} every {} ms",
                tags.len(),
                plc.target(),
                interval.as_millis()
            );

            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {}
                }
                for name in &tags {
                    match plc.read_tag(name).await {
                        Ok(sample) if last.get(name) != Some(&sample.value) => {
                            last.insert(name.clone(), sample.value.clone());
                            on_change(name, &sample);
                        }
                        Ok(_) => {}
                        Err(e) => debug!("Monitored read of {} failed: {}", name, e),
                    }
                }
                if !plc.is_connected() {
                    warn!("Monitoring of {} ended: {}", plc.target(), plc.state());
                    break;
                }
            }
            debug!("Monitor on {} stopped", plc.target());
            plc
        });

        TagMonitor { stop: Some(stop), task }
    }

    /// Load a JSON program and download it
    pub async fn restore<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let program = PlcProgram::load(path.as_ref()).await?;
        if Some(program.vendor) != self.vendor() {
            return Err(DeviceError::invalid_value(
                path.as_ref().display().to_string(),
                format!("program was taken from a {} controller", program.vendor),
            ));
        }
        self.download_program(&program).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::device::ErrorSlot;
    use crate::program::{BlockType, CodeLanguage};
    use crate::tag::DataType;

    /// An in-memory driver
    ///
    /// `Lost.*` tags drop the transport, `Bad.*` tags are rejected by the
    /// device, `Ramp.*` tags step up by one every third tag read and
    /// connecting to `unreachable` fails.
    #[derive(Debug)]
    pub(crate) struct MockDriver {
        vendor: Vendor,
        connected: bool,
        running: bool,
        values: HashMap<String, Value>,
        errors: ErrorSlot,
        pub(crate) connects: Arc<AtomicUsize>,
        reads: Arc<AtomicUsize>,
    }

    impl MockDriver {
        pub(crate) fn new(vendor: Vendor) -> Self {
            Self {
                vendor,
                connected: false,
                running: true,
                values: HashMap::from([("Motor1.Speed".to_string(), Value::Float(1450.0))]),
                errors: ErrorSlot::default(),
                connects: Arc::new(AtomicUsize::new(0)),
                reads: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn check(&self, name: &str) -> Result<()> {
            if !self.connected {
                return Err(DeviceError::NotConnected {
                    target: "mock".to_string(),
                });
            }
            if name.starts_with("Lost.") {
                return Err(DeviceError::connection(self.vendor, "mock", "connection reset"));
            }
            if name.starts_with("Bad.") {
                return Err(DeviceError::protocol(self.vendor, "mock", "tag does not exist"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PlcDevice for MockDriver {
        fn vendor(&self) -> Vendor {
            self.vendor
        }

        async fn connect(&mut self, address: &str, _options: &ProtocolOptions) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if address == "unreachable" {
                let result = Err(DeviceError::connection(self.vendor, address, "no route to host"));
                return self.errors.record(result);
            }
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn last_error(&self) -> Option<String> {
            self.errors.get()
        }

        async fn get_device_info(&mut self) -> Result<DeviceInfo> {
            self.check("")?;
            let mut info = DeviceInfo::new(self.vendor, "mock");
            info.model = "Mock PLC".to_string();
            Ok(info)
        }

        async fn get_protection_status(&mut self) -> Result<ProtectionStatus> {
            self.check("")?;
            Ok(ProtectionStatus::default())
        }

        async fn read_memory(&mut self, _address: &Address, count: usize) -> Result<Vec<u8>> {
            self.check("")?;
            Ok(vec![0; count])
        }

        async fn write_memory(&mut self, _address: &Address, _data: &[u8]) -> Result<()> {
            self.check("")
        }

        async fn read_tag(&mut self, name: &str) -> Result<TagValue> {
            let reads = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            self.check(name)?;
            if name.starts_with("Ramp.") {
                return Ok(TagValue::good(name, Value::Integer((reads / 3) as i64), DataType::DInt));
            }
            let value = self.values.get(name).cloned().unwrap_or(Value::Integer(0));
            Ok(TagValue::good(name, value, DataType::LReal))
        }

        async fn write_tag(&mut self, name: &str, value: &Value) -> Result<()> {
            self.check(name)?;
            self.values.insert(name.to_string(), value.clone());
            Ok(())
        }

        async fn upload_program(&mut self) -> Result<PlcProgram> {
            self.check("")?;
            let mut program = PlcProgram::new(self.vendor, "Mock PLC");
            let mut info = BlockInfo::new(BlockType::Program, 1);
            info.name = "MAIN".to_string();
            info.language = Some(CodeLanguage::StructuredText);
            program.blocks.push(crate::program::Block::compiled(info, vec![1, 2, 3]));
            Ok(program)
        }

        async fn download_program(&mut self, program: &PlcProgram) -> Result<()> {
            self.check("")?;
            self.values
                .insert("Downloaded.Blocks".to_string(), Value::from(program.blocks.len() as u32));
            Ok(())
        }

        async fn start(&mut self) -> Result<()> {
            self.check("")?;
            self.running = true;
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            self.check("")?;
            self.running = false;
            Ok(())
        }

        async fn get_mode(&mut self) -> Result<PlcMode> {
            self.check("")?;
            Ok(if self.running { PlcMode::Run } else { PlcMode::Stop })
        }

        async fn authenticate(&mut self, secret: &str) -> Result<()> {
            self.check("")?;
            if secret == "letmein" {
                Ok(())
            } else {
                Err(DeviceError::protocol(self.vendor, "mock", "wrong password"))
            }
        }
    }

    async fn connected() -> UnifiedPlc {
        let mut plc = UnifiedPlc::new(Box::new(MockDriver::new(Vendor::Generic)), "10.0.0.5");
        plc.connect(&ProtocolOptions::new()).await.unwrap();
        plc
    }

    #[test_log::test(tokio::test)]
    async fn test_calls_before_connect_fail_without_io() {
        let mut plc = UnifiedPlc::new(Box::new(MockDriver::new(Vendor::Generic)), "10.0.0.5");
        assert_eq!(plc.state(), ConnectionState::Disconnected);
        assert!(matches!(plc.read("Motor1.Speed").await, Err(DeviceError::NotConnected { .. })));
        assert!(plc.last_error().unwrap().contains("10.0.0.5"));
        // the driver never saw a connect
        assert!(!plc.driver().unwrap().is_connected());
    }

    #[test_log::test(tokio::test)]
    async fn test_proxied_reads_and_writes() {
        let mut plc = connected().await;
        assert!(plc.is_connected());
        assert_eq!(plc.vendor(), Some(Vendor::Generic));
        assert_eq!(plc.read("Motor1.Speed").await.unwrap(), Value::Float(1450.0));

        plc.write("Pump.Enable", true).await.unwrap();
        plc.write_multiple(&[("Valve.Open".to_string(), Value::Integer(40))])
            .await
            .unwrap();
        let values = plc
            .read_multiple(&["Pump.Enable".to_string(), "Valve.Open".to_string()])
            .await
            .unwrap();
        assert_eq!(values["Pump.Enable"], Value::Bool(true));
        assert_eq!(values["Valve.Open"], Value::Integer(40));
        assert_eq!(plc.get_device_info().await.unwrap().model, "Mock PLC");
    }

    #[test_log::test(tokio::test)]
    async fn test_device_rejection_keeps_connection() {
        let mut plc = connected().await;
        assert!(matches!(plc.read("Bad.Tag").await, Err(DeviceError::ProtocolError { .. })));
        assert_eq!(plc.state(), ConnectionState::Connected);
        assert!(plc.last_error().unwrap().contains("tag does not exist"));
        tokio_test::assert_err!(plc.unlock("nope").await);
        plc.unlock("letmein").await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_transport_failure_faults() {
        let mut plc = connected().await;
        let status = plc.status_handle();
        assert!(plc.read("Lost.Tag").await.unwrap_err().is_transport_failure());
        assert_eq!(status.state(), ConnectionState::Faulted);
        assert!(!plc.driver().unwrap().is_connected());

        assert!(matches!(plc.get_mode().await, Err(DeviceError::NotConnected { .. })));
        assert!(matches!(
            plc.connect(&ProtocolOptions::new()).await,
            Err(DeviceError::InvalidState(_))
        ));
        plc.disconnect().await.unwrap();
        assert_eq!(plc.state(), ConnectionState::Faulted);
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_connect_faults() {
        let mut plc = UnifiedPlc::new(Box::new(MockDriver::new(Vendor::Omron)), "unreachable");
        tokio_test::assert_err!(plc.connect(&ProtocolOptions::new()).await);
        assert_eq!(plc.state(), ConnectionState::Faulted);
        assert!(plc.last_error().unwrap().contains("no route to host"));
    }

    #[test_log::test(tokio::test)]
    async fn test_disconnect_is_idempotent() {
        let mut plc = connected().await;
        plc.disconnect().await.unwrap();
        assert_eq!(plc.state(), ConnectionState::Disconnected);
        plc.disconnect().await.unwrap();
        assert_eq!(plc.state(), ConnectionState::Disconnected);
        assert!(matches!(plc.start().await, Err(DeviceError::NotConnected { .. })));

        plc.connect(&ProtocolOptions::new()).await.unwrap();
        assert!(plc.is_connected());
    }

    #[test_log::test(tokio::test)]
    async fn test_run_state() {
        let mut plc = connected().await;
        assert!(plc.is_running().await.unwrap());
        plc.stop().await.unwrap();
        assert!(!plc.is_running().await.unwrap());
        plc.start().await.unwrap();
        assert_eq!(plc.get_mode().await.unwrap(), PlcMode::Run);
        let diagnostics = plc.get_diagnostics().await.unwrap();
        assert_eq!(diagnostics.get("state"), Some(&Value::from("connected")));
    }

    #[test_log::test(tokio::test)]
    async fn test_backup_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plc.json");

        let mut plc = connected().await;
        let program = plc.backup(&path).await.unwrap();
        assert_eq!(program.blocks.len(), 1);
        assert!(path.exists());
        plc.restore(&path).await.unwrap();
        assert_eq!(plc.read("Downloaded.Blocks").await.unwrap(), Value::Integer(1));

        let mut other = UnifiedPlc::new(Box::new(MockDriver::new(Vendor::Siemens)), "10.0.0.6");
        other.connect(&ProtocolOptions::new()).await.unwrap();
        assert!(matches!(other.restore(&path).await, Err(DeviceError::InvalidValue { .. })));
    }

    type Seen = Arc<std::sync::Mutex<Vec<(String, Value)>>>;

    fn recorder() -> (Seen, impl FnMut(&str, &TagValue) + Send + 'static) {
        let seen: Seen = Arc::default();
        let sink = seen.clone();
        (seen, move |name: &str, sample: &TagValue| {
            sink.lock().unwrap().push((name.to_string(), sample.value.clone()));
        })
    }

    fn values_of(seen: &Seen, name: &str) -> Vec<Value> {
        seen.lock()
            .unwrap()
            .iter()
            .filter(|(tag, _)| tag == name)
            .map(|(_, value)| value.clone())
            .collect()
    }

    #[test_log::test(tokio::test)]
    async fn test_monitor_reports_first_value_and_changes() {
        let plc = connected().await;
        let (seen, on_change) = recorder();
        let monitor = plc.monitor(vec!["Ramp.Level".to_string()], Duration::from_millis(10), on_change);

        for _ in 0..100 {
            if values_of(&seen, "Ramp.Level").len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let plc = monitor.stop().await.unwrap();
        assert!(plc.is_connected());

        let values = values_of(&seen, "Ramp.Level");
        assert!(values.len() >= 3, "{:?}", values);
        assert_eq!(values[0], Value::Integer(0));
        // only changes are reported
        assert!(values.windows(2).all(|pair| pair[0] != pair[1]), "{:?}", values);
    }

    #[test_log::test(tokio::test)]
    async fn test_monitor_skips_failing_tags() {
        let plc = connected().await;
        let (seen, on_change) = recorder();
        let tags = vec![
            "Motor1.Speed".to_string(),
            "Bad.Tag".to_string(),
            "Ramp.Level".to_string(),
        ];
        let monitor = plc.monitor(tags, Duration::from_millis(10), on_change);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let plc = monitor.stop().await.unwrap();

        // an unchanging tag is reported once
        assert_eq!(values_of(&seen, "Motor1.Speed"), vec![Value::Float(1450.0)]);
        assert!(values_of(&seen, "Bad.Tag").is_empty());
        assert!(!values_of(&seen, "Ramp.Level").is_empty());
        assert!(plc.is_connected());
        assert!(plc.last_error().unwrap().contains("tag does not exist"));
    }

    #[test_log::test(tokio::test)]
    async fn test_monitor_stops_cleanly() {
        let plc = connected().await;
        let (seen, on_change) = recorder();
        let monitor = plc.monitor(vec!["Ramp.Level".to_string()], Duration::from_millis(10), on_change);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut plc = monitor.stop().await.unwrap();
        let count = seen.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), count);

        // the façade is usable again once handed back
        assert_eq!(plc.read("Motor1.Speed").await.unwrap(), Value::Float(1450.0));
    }

    #[test_log::test(tokio::test)]
    async fn test_monitor_ends_when_transport_drops() {
        let plc = connected().await;
        let status = plc.status_handle();
        let (seen, on_change) = recorder();
        let monitor = plc.monitor(vec!["Lost.Tag".to_string()], Duration::from_millis(10), on_change);

        for _ in 0..100 {
            if monitor.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(monitor.is_finished());
        assert_eq!(status.state(), ConnectionState::Faulted);
        let plc = monitor.stop().await.unwrap();
        assert_eq!(plc.state(), ConnectionState::Faulted);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_monitor_on_disconnected_plc_ends_at_once() {
        let plc = UnifiedPlc::new(Box::new(MockDriver::new(Vendor::Generic)), "10.0.0.5");
        let (seen, on_change) = recorder();
        let monitor = plc.monitor(vec!["Motor1.Speed".to_string()], Duration::from_millis(10), on_change);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.is_finished());
        let plc = monitor.stop().await.unwrap();
        assert_eq!(plc.state(), ConnectionState::Disconnected);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_monitor_polls_at_the_interval() {
        let driver = MockDriver::new(Vendor::Generic);
        let counter = driver.reads.clone();
        let mut plc = UnifiedPlc::new(Box::new(driver), "10.0.0.7");
        plc.connect(&ProtocolOptions::new()).await.unwrap();

        let (_seen, on_change) = recorder();
        let monitor = plc.monitor(vec!["Motor1.Speed".to_string()], Duration::from_millis(100), on_change);
        tokio::time::sleep(Duration::from_millis(450)).await;
        monitor.stop().await.unwrap();

        // ticks at 0, 100, 200, 300 and 400 ms
        let reads = counter.load(Ordering::SeqCst);
        assert!((4..=5).contains(&reads), "{} reads", reads);
    }
}
