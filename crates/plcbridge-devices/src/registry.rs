/*!
 * Driver registry and factory.
 *
 * The factory maps vendors to driver constructors and turns an address
 * plus an optional vendor into a connected [`UnifiedPlc`]. When no vendor
 * is given it detects one with the wire probes, either one family after
 * the other in registration order or all families at once.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use plcbridge_core::config::{DetectionMode, SharedConfig};

use crate::device::{DeviceError, PlcDevice, Result};
use crate::drivers;
use crate::probe::{modbus_vendor, ProbeResult, ProbeSet};
use crate::protocol::util::split_target;
use crate::protocol::{ProtocolOptions, PORT};
use crate::unified::UnifiedPlc;
use crate::vendor::{ProtocolFamily, Vendor};

/// Builds a disconnected driver
pub type DriverConstructor = Arc<dyn Fn(&SharedConfig) -> Result<Box<dyn PlcDevice>> + Send + Sync>;

/// Outcome of vendor detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// The detected vendor
    pub vendor: Vendor,
    /// Port the matching probe answered on
    pub port: Option<u16>,
    /// Identity string reported by the device, if any
    pub identity: Option<String>,
    /// Time spent probing
    pub elapsed: Duration,
}

/// Maps vendors to driver constructors
///
/// Constructors are kept in registration order; that order is the
/// sequential detection order. Registering a vendor again replaces its
/// constructor in place.
pub struct DeviceFactory {
    config: SharedConfig,
    probes: ProbeSet,
    constructors: RwLock<Vec<(Vendor, DriverConstructor)>>,
}

impl fmt::Debug for DeviceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFactory")
            .field("vendors", &self.registered_vendors().unwrap_or_default())
            .field("probes", &self.probes)
            .finish()
    }
}

impl DeviceFactory {
    /// A factory with the native driver of every vendor registered
    pub fn new(config: SharedConfig) -> Self {
        let factory = Self::empty(config);
        let builtin: Vec<(Vendor, DriverConstructor)> = Vendor::ALL
            .into_iter()
            .filter(|vendor| vendor.protocol_family().is_some())
            .map(|vendor| {
                let ctor: DriverConstructor = Arc::new(move |config: &SharedConfig| drivers::create_driver(vendor, config));
                (vendor, ctor)
            })
            .collect();
        if let Ok(mut constructors) = factory.constructors.write() {
            *constructors = builtin;
        }
        factory
    }

    /// A factory with no drivers registered
    pub fn empty(config: SharedConfig) -> Self {
        let probes = ProbeSet::from_config(config.get());
        Self {
            config,
            probes,
            constructors: RwLock::new(Vec::new()),
        }
    }

    /// Replace the probe set used for detection
    pub fn with_probes(mut self, probes: ProbeSet) -> Self {
        self.probes = probes;
        self
    }

    /// The probe set used for detection
    pub fn probes(&self) -> &ProbeSet {
        &self.probes
    }

    /// The configuration handed to constructors
    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Register (or replace) the constructor for a vendor
    pub fn register<F>(&self, vendor: Vendor, constructor: F) -> Result<()>
    where
        F: Fn(&SharedConfig) -> Result<Box<dyn PlcDevice>> + Send + Sync + 'static,
    {
        let mut constructors = self
            .constructors
            .write()
            .map_err(|_| DeviceError::InvalidState("Failed to acquire write lock on driver registry".to_string()))?;

        let constructor: DriverConstructor = Arc::new(constructor);
        match constructors.iter_mut().find(|(v, _)| *v == vendor) {
            Some(entry) => {
                entry.1 = constructor;
                debug!("Replaced driver constructor for {}", vendor);
            }
            None => {
                constructors.push((vendor, constructor));
                debug!("Registered driver constructor for {}", vendor);
            }
        }
        Ok(())
    }

    /// Remove a vendor; returns whether it was registered
    pub fn unregister(&self, vendor: Vendor) -> Result<bool> {
        let mut constructors = self
            .constructors
            .write()
            .map_err(|_| DeviceError::InvalidState("Failed to acquire write lock on driver registry".to_string()))?;
        let before = constructors.len();
        constructors.retain(|(v, _)| *v != vendor);
        Ok(constructors.len() != before)
    }

    /// Registered vendors in registration order
    pub fn registered_vendors(&self) -> Result<Vec<Vendor>> {
        let constructors = self
            .constructors
            .read()
            .map_err(|_| DeviceError::InvalidState("Failed to acquire read lock on driver registry".to_string()))?;
        Ok(constructors.iter().map(|(v, _)| *v).collect())
    }

    /// Whether a vendor has a constructor
    pub fn is_registered(&self, vendor: Vendor) -> Result<bool> {
        Ok(self.registered_vendors()?.contains(&vendor))
    }

    /// Build a disconnected driver for a vendor
    pub fn build(&self, vendor: Vendor) -> Result<Box<dyn PlcDevice>> {
        let constructor = {
            let constructors = self
                .constructors
                .read()
                .map_err(|_| DeviceError::InvalidState("Failed to acquire read lock on driver registry".to_string()))?;
            constructors
                .iter()
                .find(|(v, _)| *v == vendor)
                .map(|(_, c)| c.clone())
                .ok_or_else(|| DeviceError::UnsupportedVendor(vendor.as_str().to_string()))?
        };
        constructor(&self.config)
    }

    /// Create a connected façade
    ///
    /// With `vendor` the matching driver is built directly. Without it the
    /// vendor is detected first and the port its probe answered on is used
    /// unless the address or the options name one.
    pub async fn create(&self, address: &str, vendor: Option<Vendor>, options: &ProtocolOptions) -> Result<UnifiedPlc> {
        let mut plc = UnifiedPlc::detached(address);
        let (vendor, options) = match vendor {
            Some(vendor) => (vendor, options.clone()),
            None => {
                plc.begin_probing();
                let detection = match self.detect(address).await {
                    Ok(detection) => detection,
                    Err(e) => {
                        plc.fault(&e);
                        return Err(e);
                    }
                };
                let (_, explicit_port) = split_target(address)?;
                let mut options = options.clone();
                if let (None, false, Some(port)) = (explicit_port, options.has(PORT), detection.port) {
                    options = options.with_port(port);
                }
                (detection.vendor, options)
            }
        };

        let driver = match self.build(vendor) {
            Ok(driver) => driver,
            Err(e) => {
                plc.fault(&e);
                return Err(e);
            }
        };
        plc.attach(driver);
        plc.connect(&options).await?;
        Ok(plc)
    }

    /// Detect the vendor of the controller at `address`
    pub async fn detect(&self, address: &str) -> Result<Detection> {
        let (host, _) = split_target(address)?;
        let order = self.registered_vendors()?;
        let started = tokio::time::Instant::now();

        let mut results: HashMap<ProtocolFamily, ProbeResult> = HashMap::new();
        match self.config.get().probe.detection {
            DetectionMode::Sequential => {
                for vendor in &order {
                    let Some(family) = vendor.protocol_family() else {
                        continue;
                    };
                    if !results.contains_key(&family) {
                        let result = self.probes.probe_family(family, &host).await;
                        let matched = result.is_match();
                        results.insert(family, result);
                        if matched {
                            break;
                        }
                    }
                }
            }
            DetectionMode::Parallel => {
                let mut families: Vec<ProtocolFamily> = Vec::new();
                for family in order.iter().filter_map(|v| v.protocol_family()) {
                    if !families.contains(&family) {
                        families.push(family);
                    }
                }
                let probed = join_all(families.iter().map(|family| self.probes.probe_family(*family, &host))).await;
                results.extend(families.into_iter().zip(probed));
            }
        }

        // first registered vendor whose family matched
        for vendor in &order {
            let Some(family) = vendor.protocol_family() else {
                continue;
            };
            let Some(result) = results.get(&family).filter(|r| r.is_match()) else {
                continue;
            };
            let vendor = match family {
                ProtocolFamily::Modbus => self.modbus_vendor(*vendor, result.identity.as_deref(), &order),
                _ => *vendor,
            };
            info!(
                "Detected {} at {} ({}, port {:?})",
                vendor,
                host,
                family,
                result.port
            );
            return Ok(Detection {
                vendor,
                port: result.port,
                identity: result.identity.clone(),
                elapsed: started.elapsed(),
            });
        }

        debug!("No probe matched {} after {:?}", host, started.elapsed());
        Err(DeviceError::VendorDetectionFailed { target: host })
    }

    /// Settle Delta vs Schneider vs generic Modbus from device identification
    fn modbus_vendor(&self, first: Vendor, identity: Option<&str>, registered: &[Vendor]) -> Vendor {
        let configured = &self.config.get().probe.modbus_default_vendor;
        let default = configured.parse::<Vendor>().unwrap_or_else(|_| {
            warn!("Unknown Modbus default vendor '{}', using {}", configured, first);
            first
        });
        let vendor = modbus_vendor(identity, default);
        if registered.contains(&vendor) {
            vendor
        } else {
            first
        }
    }
}

/// Connect to a PLC with the built-in drivers
///
/// Shorthand for [`DeviceFactory::new`] followed by
/// [`create`](DeviceFactory::create).
pub async fn connect(address: &str, vendor: Option<Vendor>, config: SharedConfig) -> Result<UnifiedPlc> {
    DeviceFactory::new(config)
        .create(address, vendor, &ProtocolOptions::new())
        .await
}
