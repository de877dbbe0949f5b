/*!
 * Wire probes for vendor detection.
 *
 * Each probe opens a fresh short-lived socket, sends the smallest request
 * its protocol answers, and checks the structural signature of the reply.
 * Network failure is an outcome, never an error: a probe always returns a
 * [`ProbeResult`] within its timeout. Sockets are owned by the probe
 * future and closed when it completes or is dropped.
 */
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use plcbridge_core::config::Config;
use plcbridge_core::utils::hex_dump;

use crate::vendor::{ProtocolFamily, Vendor};

pub mod ads;
pub mod enip;
pub mod fins;
pub mod mc;
pub mod modbus;
pub mod s7;

pub use ads::AdsProbe;
pub use enip::EnipProbe;
pub use fins::FinsProbe;
pub use mc::McProbe;
pub use modbus::{modbus_vendor, ModbusProbe};
pub use s7::S7Probe;

/// Result of probing one host for one protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeOutcome {
    /// The peer answered with the protocol's signature
    Matched,
    /// The port is reachable but the reply (or its absence) does not match
    NotMatched,
    /// Nothing listening, host down or no reply in time
    Unreachable,
}

/// What a probe found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Protocol family probed, `None` when the vendor has no probe
    pub family: Option<ProtocolFamily>,
    /// The outcome
    pub outcome: ProbeOutcome,
    /// Port that produced the outcome
    pub port: Option<u16>,
    /// Identity string from the reply (product or vendor name), if any
    pub identity: Option<String>,
    /// Wall-clock time spent
    pub elapsed: Duration,
}

impl ProbeResult {
    /// True for a matched probe
    pub fn is_match(&self) -> bool {
        self.outcome == ProbeOutcome::Matched
    }
}

/// Outcome of a probe against a single port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOutcome {
    /// The outcome
    pub outcome: ProbeOutcome,
    /// Identity string from the reply, if any
    pub identity: Option<String>,
}

impl PortOutcome {
    /// A match with an optional identity
    pub fn matched(identity: Option<String>) -> Self {
        Self {
            outcome: ProbeOutcome::Matched,
            identity,
        }
    }

    /// A reachable port that did not answer correctly
    pub fn not_matched() -> Self {
        Self {
            outcome: ProbeOutcome::NotMatched,
            identity: None,
        }
    }

    /// Nothing reachable
    pub fn unreachable() -> Self {
        Self {
            outcome: ProbeOutcome::Unreachable,
            identity: None,
        }
    }
}

/// A protocol specific detection probe
#[async_trait]
pub trait WireProbe: Send + Sync + Debug {
    /// Protocol family this probe detects
    fn family(&self) -> ProtocolFamily;

    /// Probe one port, finishing before `deadline`
    async fn probe_port(&self, host: &str, port: u16, deadline: Instant) -> PortOutcome;
}

/// Run a probe over candidate ports until one matches
///
/// The whole attempt, across all ports, is bounded by `timeout`. Each port
/// gets an equal share of what is left when its turn comes, so a port that
/// swallows packets cannot starve the ones after it.
pub async fn run_probe(
    probe: &dyn WireProbe,
    host: &str,
    ports: &[u16],
    timeout: Duration,
) -> ProbeResult {
    let start = Instant::now();
    let deadline = start + timeout;
    let mut best: Option<(u16, PortOutcome)> = None;

    for (i, &port) in ports.iter().enumerate() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let share = (deadline - now) / (ports.len() - i) as u32;
        let outcome = probe.probe_port(host, port, now + share).await;
        debug!(
            "{} probe of {}:{} -> {:?}",
            probe.family(),
            host,
            port,
            outcome.outcome
        );

        let matched = outcome.outcome == ProbeOutcome::Matched;
        let better = match &best {
            None => true,
            Some((_, b)) => rank(outcome.outcome) > rank(b.outcome),
        };
        if better {
            best = Some((port, outcome));
        }
        if matched {
            break;
        }
    }

    let (port, outcome) = match best {
        Some((port, outcome)) => (Some(port), outcome),
        None => (None, PortOutcome::unreachable()),
    };
    ProbeResult {
        family: Some(probe.family()),
        outcome: outcome.outcome,
        port,
        identity: outcome.identity,
        elapsed: start.elapsed(),
    }
}

fn rank(outcome: ProbeOutcome) -> u8 {
    match outcome {
        ProbeOutcome::Unreachable => 0,
        ProbeOutcome::NotMatched => 1,
        ProbeOutcome::Matched => 2,
    }
}

/// How to find the end of a reply on a stream socket
#[derive(Debug, Clone, Copy)]
pub(crate) struct Framing {
    /// Bytes to read before the total length is known
    pub header_len: usize,
    /// Total frame length computed from the header, `None` if the header is invalid
    pub total_len: fn(&[u8]) -> Option<usize>,
}

/// Largest reply a probe accepts
const MAX_REPLY: usize = 4096;

/// What a single request/reply exchange produced
#[derive(Debug)]
pub(crate) enum Exchange {
    /// Connection refused, host unreachable or connect timeout
    Unreachable,
    /// Connected, but no complete or plausible reply
    NoReply,
    /// A framed reply
    Reply(Vec<u8>),
}

/// Connect, send `request` and read one framed reply, all before `deadline`
pub(crate) async fn tcp_exchange(
    host: &str,
    port: u16,
    request: &[u8],
    framing: Framing,
    deadline: Instant,
) -> Exchange {
    let mut stream = match timeout_at(deadline, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            trace!("connect {}:{} failed: {}", host, port, e);
            return Exchange::Unreachable;
        }
        Err(_) => return Exchange::Unreachable,
    };

    match timeout_at(deadline, request_reply(&mut stream, request, framing)).await {
        Ok(Some(reply)) => {
            trace!("reply from {}:{}: {}", host, port, hex_dump(&reply));
            Exchange::Reply(reply)
        }
        _ => Exchange::NoReply,
    }
}

async fn request_reply(stream: &mut TcpStream, request: &[u8], framing: Framing) -> Option<Vec<u8>> {
    stream.write_all(request).await.ok()?;

    let mut reply = vec![0u8; framing.header_len];
    stream.read_exact(&mut reply).await.ok()?;

    let total = (framing.total_len)(&reply)?;
    if total < framing.header_len || total > MAX_REPLY {
        return None;
    }
    reply.resize(total, 0);
    stream.read_exact(&mut reply[framing.header_len..]).await.ok()?;
    Some(reply)
}

/// Send one datagram and wait for one reply before `deadline`
pub(crate) async fn udp_exchange(host: &str, port: u16, request: &[u8], deadline: Instant) -> Exchange {
    let target: SocketAddr = match timeout_at(deadline, lookup_host((host, port))).await {
        Ok(Ok(mut addrs)) => match addrs.next() {
            Some(addr) => addr,
            None => return Exchange::Unreachable,
        },
        _ => return Exchange::Unreachable,
    };
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };

    let socket = match UdpSocket::bind(bind).await {
        Ok(socket) => socket,
        Err(_) => return Exchange::Unreachable,
    };
    if socket.connect(target).await.is_err() || socket.send(request).await.is_err() {
        return Exchange::Unreachable;
    }

    let mut buf = vec![0u8; MAX_REPLY];
    match timeout_at(deadline, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            trace!("datagram from {}: {}", target, hex_dump(&buf));
            Exchange::Reply(buf)
        }
        // ICMP port unreachable surfaces as a receive error on a connected socket
        Ok(Err(_)) => Exchange::Unreachable,
        Err(_) => Exchange::Unreachable,
    }
}

/// Printable ASCII from a fixed-size field, trimmed of padding
pub(crate) fn ascii_field(bytes: &[u8]) -> Option<String> {
    let text: String = bytes
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect();
    let text = text.trim();
    if text.is_empty() || !text.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        None
    } else {
        Some(text.to_string())
    }
}

/// The full set of probes with their candidate ports
#[derive(Debug, Clone)]
pub struct ProbeSet {
    probes: BTreeMap<ProtocolFamily, Arc<dyn WireProbe>>,
    ports: HashMap<ProtocolFamily, Vec<u16>>,
    timeout: Duration,
}

impl ProbeSet {
    /// Built-in probes on their well known ports
    pub fn new(timeout: Duration) -> Self {
        Self::with_ads_source(timeout, ads::DEFAULT_SOURCE_NET_ID)
    }

    fn with_ads_source(timeout: Duration, ams_source: &str) -> Self {
        let probes: [Arc<dyn WireProbe>; 6] = [
            Arc::new(S7Probe),
            Arc::new(EnipProbe),
            Arc::new(FinsProbe),
            Arc::new(ModbusProbe::default()),
            Arc::new(AdsProbe::new(ams_source)),
            Arc::new(McProbe),
        ];
        let probes: BTreeMap<_, _> = probes.into_iter().map(|p| (p.family(), p)).collect();
        let ports = probes
            .keys()
            .map(|family| (*family, family.default_ports().to_vec()))
            .collect();

        Self {
            probes,
            ports,
            timeout,
        }
    }

    /// Probe set honouring the probe timeout and port overrides of a configuration
    pub fn from_config(config: &Config) -> Self {
        let mut set = Self::with_ads_source(config.probe.timeout(), &config.connection.ams_source_net_id);
        for family in set.probes.keys().copied().collect::<Vec<_>>() {
            if let Some(port) = config.probe.port_for(family.key()) {
                set.ports.insert(family, vec![port]);
            }
        }
        set
    }

    /// Replace the probe for its family
    pub fn with_probe(mut self, probe: Arc<dyn WireProbe>) -> Self {
        self.probes.insert(probe.family(), probe);
        self
    }

    /// Replace the candidate ports of a family
    pub fn with_ports(mut self, family: ProtocolFamily, ports: Vec<u16>) -> Self {
        self.ports.insert(family, ports);
        self
    }

    /// Replace the per-probe timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The per-probe timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Candidate ports of a family
    pub fn ports(&self, family: ProtocolFamily) -> &[u16] {
        self.ports.get(&family).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The family whose probe runs on `port`
    pub fn family_for_port(&self, port: u16) -> Option<ProtocolFamily> {
        self.ports
            .iter()
            .filter(|(_, ports)| ports.contains(&port))
            .map(|(family, _)| *family)
            .min()
    }

    /// Probe a host for one family with the set's timeout
    pub async fn probe_family(&self, family: ProtocolFamily, host: &str) -> ProbeResult {
        self.probe_family_with_timeout(family, host, self.timeout).await
    }

    /// Probe a host for one family
    pub async fn probe_family_with_timeout(
        &self,
        family: ProtocolFamily,
        host: &str,
        timeout: Duration,
    ) -> ProbeResult {
        match self.probes.get(&family) {
            Some(probe) => run_probe(probe.as_ref(), host, self.ports(family), timeout).await,
            None => ProbeResult {
                family: Some(family),
                outcome: ProbeOutcome::NotMatched,
                port: None,
                identity: None,
                elapsed: Duration::ZERO,
            },
        }
    }

    /// Probe a host for one family on a single port
    pub async fn probe_port(
        &self,
        family: ProtocolFamily,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> ProbeResult {
        match self.probes.get(&family) {
            Some(probe) => run_probe(probe.as_ref(), host, &[port], timeout).await,
            None => ProbeResult {
                family: Some(family),
                outcome: ProbeOutcome::NotMatched,
                port: Some(port),
                identity: None,
                elapsed: Duration::ZERO,
            },
        }
    }

    /// Probe a host for a vendor's protocol
    ///
    /// `Unknown` has no protocol and yields `NotMatched` immediately.
    pub async fn probe(&self, vendor: Vendor, host: &str, timeout: Duration) -> ProbeResult {
        match vendor.protocol_family() {
            Some(family) => self.probe_family_with_timeout(family, host, timeout).await,
            None => ProbeResult {
                family: None,
                outcome: ProbeOutcome::NotMatched,
                port: None,
                identity: None,
                elapsed: Duration::ZERO,
            },
        }
    }
}

impl Default for ProbeSet {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Loopback fakes speaking just enough of each protocol for probes and drivers.
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};

    /// A port nothing listens on
    pub async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    /// Serve framed request/replies: `frame_len` tells how long a request is
    /// from its first `header` bytes, `respond` builds the reply (or `None`
    /// to close).
    pub async fn spawn_tcp<L, R>(header: usize, frame_len: L, respond: R) -> u16
    where
        L: Fn(&[u8]) -> usize + Send + Sync + Clone + 'static,
        R: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + Clone + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let frame_len = frame_len.clone();
                let respond = respond.clone();
                tokio::spawn(serve(stream, header, frame_len, respond));
            }
        });
        port
    }

    async fn serve<L, R>(mut stream: TcpStream, header: usize, frame_len: L, respond: R)
    where
        L: Fn(&[u8]) -> usize,
        R: Fn(&[u8]) -> Option<Vec<u8>>,
    {
        loop {
            let mut request = vec![0u8; header];
            if stream.read_exact(&mut request).await.is_err() {
                return;
            }
            let total = frame_len(&request);
            if total > header {
                request.resize(total, 0);
                if stream.read_exact(&mut request[header..]).await.is_err() {
                    return;
                }
            }
            match respond(&request) {
                Some(reply) => {
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    /// A TCP port that accepts and then never answers
    pub async fn spawn_silent_tcp() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        port
    }

    /// Serve datagrams with `respond`
    pub async fn spawn_udp<R>(respond: R) -> u16
    where
        R: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                if let Some(reply) = respond(&buf[..n]) {
                    let _ = socket.send_to(&reply, peer).await;
                }
            }
        });
        port
    }
}
