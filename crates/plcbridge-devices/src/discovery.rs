/*!
 * Network discovery.
 *
 * Fans the wire probes out over a subnet or address range with a bounded
 * number of hosts in flight. Each host gets a port sweep over the known
 * industrial ports; open ports that belong to a probed protocol family are
 * confirmed with the matching wire probe, which also identifies the vendor.
 *
 * Cancellation is cooperative: once cancelled no new host is started and
 * running hosts stop between ports, but a port check or probe already in
 * flight always completes or times out.
 */
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

use plcbridge_core::config::Config;
use plcbridge_core::types::Id;
use plcbridge_core::utils::with_timeout;

use crate::probe::{modbus_vendor, ProbeSet};
use crate::vendor::{ProtocolFamily, Vendor};

/// A well known industrial service port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownPort {
    /// Port number
    pub port: u16,
    /// Service name
    pub service: &'static str,
    /// Vendor typically behind the port
    pub vendor: &'static str,
    /// Served over UDP rather than TCP
    pub udp: bool,
    /// An automation protocol, as opposed to a general purpose one
    pub industrial: bool,
}

const fn known(port: u16, service: &'static str, vendor: &'static str, udp: bool, industrial: bool) -> KnownPort {
    KnownPort {
        port,
        service,
        vendor,
        udp,
        industrial,
    }
}

/// Ports checked by a full scan
pub const INDUSTRIAL_PORTS: &[KnownPort] = &[
    known(102, "S7comm", "Siemens", false, true),
    known(80, "HTTP", "Multiple", false, false),
    known(443, "HTTPS", "Multiple", false, false),
    known(44818, "EtherNet/IP", "Allen-Bradley", false, true),
    known(2222, "EtherNet/IP", "Allen-Bradley", false, true),
    known(502, "Modbus TCP", "Multiple", false, true),
    known(9600, "FINS", "Omron", true, true),
    known(48898, "ADS", "Beckhoff", false, true),
    known(851, "ADS Runtime", "Beckhoff", false, true),
    known(5000, "MC Protocol", "Mitsubishi", false, true),
    known(5001, "MC Protocol", "Mitsubishi", false, true),
    known(47808, "BACnet", "Multiple", false, true),
    known(4840, "OPC UA", "Multiple", false, true),
    known(20000, "DNP3", "Multiple", false, true),
    known(1962, "PCWorx", "Phoenix Contact", false, true),
    known(20547, "ProConOS", "Phoenix Contact", false, true),
];

/// Ports checked by a quick scan
pub const QUICK_PORTS: &[u16] = &[102, 502, 44818, 9600, 5000, 4840];

/// Networks larger than this are refused
const MAX_HOSTS: usize = 65_536;

/// Look up a known port
pub fn known_port(port: u16) -> Option<&'static KnownPort> {
    INDUSTRIAL_PORTS.iter().find(|k| k.port == port)
}

/// Lifecycle of a subnet scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    /// Not started
    Pending,
    /// In progress
    Running,
    /// Every host was scanned
    Completed,
    /// Stopped early by a cancel request
    Cancelled,
    /// The scan could not run
    Error,
}

/// Severity of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Exploitable right now
    Critical,
    /// Serious exposure
    High,
    /// Worth fixing
    Medium,
    /// Minor
    Low,
    /// Informational
    Info,
}

impl RiskLevel {
    fn label(&self) -> &'static str {
        match self {
            RiskLevel::Critical => "CRITICAL",
            RiskLevel::High => "HIGH",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::Low => "LOW",
            RiskLevel::Info => "INFO",
        }
    }
}

/// An exposure noticed on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Short title
    pub title: String,
    /// What was observed
    pub description: String,
    /// Severity
    pub risk: RiskLevel,
    /// What to do about it
    pub recommendation: String,
}

impl Finding {
    fn new(title: &str, description: String, risk: RiskLevel, recommendation: &str) -> Self {
        Self {
            title: title.to_string(),
            description,
            risk,
            recommendation: recommendation.to_string(),
        }
    }
}

/// An open port on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPort {
    /// Port number
    pub port: u16,
    /// `tcp` or `udp`
    pub transport: String,
    /// Service name from the port table, empty when unknown
    pub service: String,
    /// Protocol confirmed by a wire probe
    pub protocol: Option<ProtocolFamily>,
}

/// What a scan found on one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostScan {
    /// Host address
    pub address: String,
    /// Open ports in ascending order
    pub open_ports: Vec<OpenPort>,
    /// Vendor identified by a wire probe
    pub vendor: Option<Vendor>,
    /// Product or vendor name reported by the device
    pub identity: Option<String>,
    /// Whether the host looks like a controller
    pub is_plc: bool,
    /// Exposure findings
    pub findings: Vec<Finding>,
    /// Time spent on the host
    pub elapsed: Duration,
}

/// Result of a subnet or range scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkScan {
    /// Unique scan identifier
    pub id: Id,
    /// CIDR block or range that was scanned
    pub subnet: String,
    /// Status
    pub status: ScanStatus,
    /// When the scan started
    pub started_at: DateTime<Utc>,
    /// When the scan finished
    pub finished_at: Option<DateTime<Utc>>,
    /// Hosts with an open port or a matched probe, ordered by address
    pub hosts: Vec<HostScan>,
    /// Hosts in the block
    pub total_hosts: usize,
    /// Hosts scanned before completion or cancellation
    pub scanned_hosts: usize,
    /// Hosts that look like controllers
    pub plc_count: usize,
    /// Findings across all hosts
    pub finding_count: usize,
    /// Why the scan failed, for `Error`
    pub error: Option<String>,
}

impl NetworkScan {
    fn new(subnet: &str) -> Self {
        Self {
            id: Id::new(),
            subnet: subnet.to_string(),
            status: ScanStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            hosts: Vec::new(),
            total_hosts: 0,
            scanned_hosts: 0,
            plc_count: 0,
            finding_count: 0,
            error: None,
        }
    }

    fn failed(mut self, message: String) -> Self {
        self.status = ScanStatus::Error;
        self.error = Some(message);
        self.finished_at = Some(Utc::now());
        self
    }
}

/// Scan settings
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Hosts scanned concurrently
    pub max_workers: usize,
    /// Timeout of a single port check or probe
    pub port_timeout: Duration,
    /// Ports to check on every host
    pub ports: Vec<u16>,
    /// Vendor assumed for an unidentified Modbus server
    pub modbus_default: Vendor,
}

impl ScanOptions {
    /// Settings from the scan and probe configuration
    pub fn from_config(config: &Config) -> Self {
        let ports = if !config.scan.ports.is_empty() {
            config.scan.ports.clone()
        } else if config.scan.quick_scan {
            QUICK_PORTS.to_vec()
        } else {
            INDUSTRIAL_PORTS.iter().map(|k| k.port).collect()
        };
        Self {
            max_workers: config.scan.max_workers.max(1),
            port_timeout: config.scan.port_timeout(),
            ports,
            modbus_default: config.probe.modbus_default_vendor.parse().unwrap_or(Vendor::Delta),
        }
    }

    /// Only check the quick port subset
    pub fn quick(mut self) -> Self {
        self.ports = QUICK_PORTS.to_vec();
        self
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Requests cancellation of a running scan
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Stop dispatching new hosts and ports
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a cancel was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Scans networks for controllers
pub struct NetworkScanner {
    probes: ProbeSet,
    options: ScanOptions,
    cancel: CancelHandle,
    progress: Option<ProgressFn>,
}

impl std::fmt::Debug for NetworkScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkScanner")
            .field("probes", &self.probes)
            .field("options", &self.options)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl NetworkScanner {
    /// Scanner with explicit probes and options
    pub fn new(probes: ProbeSet, options: ScanOptions) -> Self {
        Self {
            probes,
            options,
            cancel: CancelHandle::default(),
            progress: None,
        }
    }

    /// Scanner configured from a configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(ProbeSet::from_config(config), ScanOptions::from_config(config))
    }

    /// Report `(scanned, total)` after every host
    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// The scan options
    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Handle for cancelling a scan from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Request cancellation of the running scan
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Scan every host of a CIDR block
    ///
    /// A malformed or oversized block yields a result with status `Error`.
    pub async fn scan_subnet(&self, cidr: &str) -> NetworkScan {
        let scan = NetworkScan::new(cidr);
        match subnet_hosts(cidr) {
            Ok(hosts) => self.scan_hosts(scan, hosts).await,
            Err(message) => scan.failed(message),
        }
    }

    /// Scan an inclusive IPv4 range
    pub async fn scan_range(&self, start: Ipv4Addr, end: Ipv4Addr) -> NetworkScan {
        let scan = NetworkScan::new(&format!("{}-{}", start, end));
        let (first, last) = (u32::from(start), u32::from(end));
        if first > last {
            return scan.failed(format!("range start {} is after end {}", start, end));
        }
        if (last - first) as usize >= MAX_HOSTS {
            return scan.failed(format!("range {}-{} has more than {} hosts", start, end, MAX_HOSTS));
        }
        let hosts = (first..=last).map(|n| IpAddr::V4(Ipv4Addr::from(n))).collect();
        self.scan_hosts(scan, hosts).await
    }

    async fn scan_hosts(&self, mut scan: NetworkScan, hosts: Vec<IpAddr>) -> NetworkScan {
        self.cancel.reset();
        scan.status = ScanStatus::Running;
        scan.total_hosts = hosts.len();
        info!(
            "Scanning {} ({} hosts, {} ports, {} workers)",
            scan.subnet,
            scan.total_hosts,
            self.options.ports.len(),
            self.options.max_workers
        );

        let cancel = self.cancel.clone();
        let results = stream::iter(hosts)
            .take_while(move |_| futures::future::ready(!cancel.is_cancelled()))
            .map(|ip| self.scan_ip(ip))
            .buffer_unordered(self.options.max_workers);
        futures::pin_mut!(results);

        while let Some(host) = results.next().await {
            scan.scanned_hosts += 1;
            if !host.open_ports.is_empty() || host.is_plc {
                scan.plc_count += usize::from(host.is_plc);
                scan.finding_count += host.findings.len();
                scan.hosts.push(host);
            }
            if let Some(progress) = &self.progress {
                progress(scan.scanned_hosts, scan.total_hosts);
            }
        }

        scan.hosts.sort_by_key(|h| IpAddr::from_str(&h.address).ok());
        scan.status = if self.cancel.is_cancelled() {
            ScanStatus::Cancelled
        } else {
            ScanStatus::Completed
        };
        scan.finished_at = Some(Utc::now());
        info!(
            "Scan of {} {:?}: {}/{} hosts, {} controllers, {} findings",
            scan.subnet,
            scan.status,
            scan.scanned_hosts,
            scan.total_hosts,
            scan.plc_count,
            scan.finding_count
        );
        scan
    }

    async fn scan_ip(&self, ip: IpAddr) -> HostScan {
        self.scan_host(&ip.to_string()).await
    }

    /// Scan one host
    pub async fn scan_host(&self, host: &str) -> HostScan {
        let started = Instant::now();
        let mut result = HostScan {
            address: host.to_string(),
            open_ports: Vec::new(),
            vendor: None,
            identity: None,
            is_plc: false,
            findings: Vec::new(),
            elapsed: Duration::ZERO,
        };

        for &port in &self.options.ports {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Some(open) = self.check_port(host, port, &mut result).await {
                result.open_ports.push(open);
            }
        }

        result.open_ports.sort_by_key(|p| p.port);
        result.is_plc = result.vendor.is_some()
            || result
                .open_ports
                .iter()
                .any(|p| known_port(p.port).map_or(false, |k| k.industrial));
        result.findings = assess(&result);
        result.elapsed = started.elapsed();
        debug!(
            "{}: {} open ports, vendor {:?}",
            host,
            result.open_ports.len(),
            result.vendor
        );
        result
    }

    /// Check one port; a probed family confirms the protocol and names the vendor
    async fn check_port(&self, host: &str, port: u16, result: &mut HostScan) -> Option<OpenPort> {
        let family = self.probes.family_for_port(port);
        let udp = known_port(port).map_or(false, |k| k.udp);
        let service = known_port(port).map(|k| k.service.to_string()).unwrap_or_default();

        if !udp {
            let what = format!("connect to {}:{}", host, port);
            if let Err(e) = with_timeout(self.options.port_timeout, &what, TcpStream::connect((host, port))).await {
                debug!("{}: {}", what, e);
                return None;
            }
        }

        let mut open = OpenPort {
            port,
            transport: if udp { "udp" } else { "tcp" }.to_string(),
            service,
            protocol: None,
        };
        let Some(family) = family else {
            return (!udp).then_some(open);
        };

        let probe = self.probes.probe_port(family, host, port, self.options.port_timeout).await;
        if probe.is_match() {
            open.protocol = Some(family);
            if result.vendor.is_none() {
                result.vendor = Some(match family {
                    ProtocolFamily::Modbus => modbus_vendor(probe.identity.as_deref(), self.options.modbus_default),
                    other => family_vendor(other),
                });
            }
            if result.identity.is_none() {
                result.identity = probe.identity;
            }
        } else if udp {
            return None;
        }
        Some(open)
    }
}

/// The vendor speaking a single-vendor protocol family
fn family_vendor(family: ProtocolFamily) -> Vendor {
    match family {
        ProtocolFamily::S7 => Vendor::Siemens,
        ProtocolFamily::EtherNetIp => Vendor::AllenBradley,
        ProtocolFamily::Fins => Vendor::Omron,
        ProtocolFamily::Modbus => Vendor::Generic,
        ProtocolFamily::Ads => Vendor::Beckhoff,
        ProtocolFamily::McProtocol => Vendor::Mitsubishi,
    }
}

/// Host addresses of a CIDR block; network and broadcast addresses are
/// skipped for IPv4 blocks of four or more addresses
pub fn subnet_hosts(cidr: &str) -> std::result::Result<Vec<IpAddr>, String> {
    let network = IpNetwork::from_str(cidr.trim()).map_err(|e| format!("invalid subnet '{}': {}", cidr, e))?;
    match network {
        IpNetwork::V4(net) => {
            if net.prefix() < 16 {
                return Err(format!("subnet {} has more than {} hosts", cidr, MAX_HOSTS));
            }
            let edges = net.prefix() <= 30;
            Ok(net
                .iter()
                .filter(|ip| !edges || (*ip != net.network() && *ip != net.broadcast()))
                .map(IpAddr::V4)
                .collect())
        }
        IpNetwork::V6(net) => {
            if net.prefix() < 112 {
                return Err(format!("subnet {} has more than {} hosts", cidr, MAX_HOSTS));
            }
            Ok(net.iter().map(IpAddr::V6).collect())
        }
    }
}

/// Exposure findings for a scanned host
pub fn assess(host: &HostScan) -> Vec<Finding> {
    let open = |port: u16| host.open_ports.iter().any(|p| p.port == port);
    let mut findings = Vec::new();

    if open(102) {
        findings.push(Finding::new(
            "S7comm Port Exposed",
            "Siemens S7 communication port 102 is reachable and allows unauthenticated controller access.".to_string(),
            RiskLevel::Medium,
            "Restrict access to port 102 with network segmentation and firewall rules",
        ));
    }
    if open(502) {
        findings.push(Finding::new(
            "Modbus TCP Without Authentication",
            "Modbus TCP port 502 is open. Modbus has no built-in authentication.".to_string(),
            RiskLevel::High,
            "Segment the network and consider Modbus/TCP Security",
        ));
    }
    if open(44818) {
        findings.push(Finding::new(
            "EtherNet/IP Port Exposed",
            "EtherNet/IP port 44818 is reachable.".to_string(),
            RiskLevel::Medium,
            "Restrict access with CIP Security or network segmentation",
        ));
    }
    if open(80) {
        findings.push(Finding::new(
            "Unencrypted Web Interface",
            "HTTP port 80 is open; web traffic can be intercepted.".to_string(),
            RiskLevel::Medium,
            "Serve the web interface over HTTPS only",
        ));
    }

    let industrial = host
        .open_ports
        .iter()
        .filter(|p| known_port(p.port).map_or(false, |k| k.industrial))
        .count();
    if industrial > 3 {
        findings.push(Finding::new(
            "Multiple Industrial Protocols Exposed",
            format!("{} industrial protocol ports are open.", industrial),
            RiskLevel::High,
            "Expose only the protocols the installation needs",
        ));
    }
    findings
}

/// Markdown report of a scan
pub fn markdown_report(scan: &NetworkScan) -> String {
    let mut out = String::new();
    let count = |risk: RiskLevel| {
        scan.hosts
            .iter()
            .flat_map(|h| &h.findings)
            .filter(|f| f.risk == risk)
            .count()
    };

    // writing to a String cannot fail
    let _ = writeln!(out, "# PLC Network Scan Report\n");
    let _ = writeln!(out, "**Scan Date:** {}", scan.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(out, "**Scan ID:** {}", scan.id);
    let _ = writeln!(out, "**Subnet:** {}", scan.subnet);
    let _ = writeln!(out, "**Status:** {:?}", scan.status);
    let _ = writeln!(out, "**Hosts Scanned:** {} of {}", scan.scanned_hosts, scan.total_hosts);
    let _ = writeln!(out, "**PLCs Discovered:** {}", scan.plc_count);
    let _ = writeln!(out, "**Findings:** {}\n", scan.finding_count);
    if let Some(error) = &scan.error {
        let _ = writeln!(out, "**Error:** {}\n", error);
    }

    let _ = writeln!(out, "## Risk Summary\n");
    for risk in [RiskLevel::Critical, RiskLevel::High, RiskLevel::Medium, RiskLevel::Low] {
        let _ = writeln!(out, "- **{}:** {}", risk.label(), count(risk));
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Discovered Devices\n");
    for host in scan.hosts.iter().filter(|h| h.is_plc || !h.findings.is_empty()) {
        let _ = writeln!(out, "### {}\n", host.address);
        if let Some(vendor) = host.vendor {
            let _ = writeln!(out, "**Vendor:** {}", vendor);
        }
        if let Some(identity) = &host.identity {
            let _ = writeln!(out, "**Identity:** {}", identity);
        }
        if !host.open_ports.is_empty() {
            let _ = writeln!(out, "\n**Open Ports:**");
            for port in &host.open_ports {
                let _ = writeln!(out, "- {}/{} ({})", port.port, port.transport, port.service);
            }
        }
        if !host.findings.is_empty() {
            let _ = writeln!(out, "\n**Findings:**");
            for finding in &host.findings {
                let _ = writeln!(out, "- **{}** ({})", finding.title, finding.risk.label());
                let _ = writeln!(out, "  - {}", finding.description);
                let _ = writeln!(out, "  - *Recommendation:* {}", finding.recommendation);
            }
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "## General Recommendations\n");
    for (i, line) in [
        "**Network Segmentation:** Isolate control networks from office networks",
        "**Firewall Rules:** Restrict access to industrial protocol ports",
        "**Firmware Updates:** Keep controller firmware up to date",
        "**Monitoring:** Run industrial network monitoring and intrusion detection",
        "**Authentication:** Enable authentication where the controller supports it",
    ]
    .iter()
    .enumerate()
    {
        let _ = writeln!(out, "{}. {}", i + 1, line);
    }
    out
}
