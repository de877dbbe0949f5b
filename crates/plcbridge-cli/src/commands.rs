use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

use plcbridge_core::config::SharedConfig;
use plcbridge_core::types::Value;
use plcbridge_devices::discovery::markdown_report;
use plcbridge_devices::{
    address, available_capabilities, capability_available, connect, DeviceError, DeviceFactory, NetworkScanner,
    ProbeSet, ScanOptions, ScanStatus, UnifiedPlc, Vendor,
};

pub async fn detect(config: SharedConfig, host: &str) -> Result<()> {
    let factory = DeviceFactory::new(config);
    let detection = factory
        .detect(host)
        .await
        .with_context(|| format!("detecting vendor of {}", host))?;

    println!("Host:     {}", host);
    println!("Vendor:   {}", detection.vendor);
    if let Some(port) = detection.port {
        println!("Port:     {}", port);
    }
    if let Some(identity) = &detection.identity {
        println!("Identity: {}", identity);
    }
    println!("Elapsed:  {} ms", detection.elapsed.as_millis());
    Ok(())
}

pub async fn scan(
    config: SharedConfig,
    cidr: &str,
    quick: bool,
    workers: Option<usize>,
    report: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let mut options = ScanOptions::from_config(config.get());
    if quick {
        options = options.quick();
    }
    if let Some(workers) = workers {
        options.max_workers = workers.max(1);
    }

    let progress = ProgressBar::new(0);
    progress.set_prefix(cidr.to_string());
    progress.enable_steady_tick(Duration::from_millis(100));
    progress.set_style(
        ProgressStyle::with_template("[{prefix}] {elapsed_precise} {bar:36.cyan/blue} {pos:>4}/{len:4} {msg}")?
            .progress_chars("##-"),
    );

    let bar = progress.clone();
    let scanner = NetworkScanner::new(ProbeSet::from_config(config.get()), options).with_progress(
        move |scanned, total| {
            bar.set_length(total as u64);
            bar.set_position(scanned as u64);
        },
    );

    let cancel = scanner.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing hosts in flight");
            cancel.cancel();
        }
    });
    let result = scanner.scan_subnet(cidr).await;
    interrupt.abort();
    progress.finish_and_clear();

    if result.status == ScanStatus::Error {
        bail!(
            "scan of {} failed: {}",
            cidr,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "{:?}: {}/{} hosts scanned, {} PLCs, {} findings",
            result.status, result.scanned_hosts, result.total_hosts, result.plc_count, result.finding_count
        );
        for host in &result.hosts {
            let ports: Vec<String> = host.open_ports.iter().map(|p| p.port.to_string()).collect();
            println!(
                "{:<16} {:<22} {:<24} ports {}",
                host.address,
                host.vendor.map(|v| v.display_name()).unwrap_or("-"),
                host.identity.as_deref().unwrap_or("-"),
                ports.join(",")
            );
        }
    }

    if let Some(path) = report {
        tokio::fs::write(&path, markdown_report(&result))
            .await
            .with_context(|| format!("writing report to {}", path.display()))?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}

async fn open(config: SharedConfig, host: &str, vendor: Option<Vendor>) -> Result<UnifiedPlc> {
    connect(host, vendor, config)
        .await
        .with_context(|| format!("connecting to {}", host))
}

/// Some drivers cannot answer every query; those are skipped
fn optional<T>(result: plcbridge_devices::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(DeviceError::Unsupported { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn info(config: SharedConfig, host: &str, vendor: Option<Vendor>) -> Result<()> {
    let mut plc = open(config, host, vendor).await?;

    let info = plc.get_device_info().await?;
    println!("Vendor:   {}", info.vendor);
    println!("Model:    {}", info.model);
    println!("Firmware: {}", info.firmware);
    println!("Serial:   {}", info.serial);
    if !info.name.is_empty() {
        println!("Name:     {}", info.name);
    }
    if let (Some(rack), Some(slot)) = (info.rack, info.slot) {
        println!("Rack/slot: {}/{}", rack, slot);
    }
    if let Some(mode) = optional(plc.get_mode().await)? {
        println!("Mode:     {:?}", mode);
    }
    if let Some(protection) = optional(plc.get_protection_status().await)? {
        println!("Protection: {}", serde_json::to_string(&protection)?);
    }

    plc.disconnect().await?;
    Ok(())
}

pub async fn read(config: SharedConfig, host: &str, address: &str, vendor: Option<Vendor>) -> Result<()> {
    let mut plc = open(config, host, vendor).await?;
    let value = plc
        .read(address)
        .await
        .with_context(|| format!("reading {}", address))?;
    println!("{} = {}", address, value);
    plc.disconnect().await?;
    Ok(())
}

pub async fn write(
    config: SharedConfig,
    host: &str,
    address: &str,
    value: &str,
    vendor: Option<Vendor>,
) -> Result<()> {
    let mut plc = open(config, host, vendor).await?;
    let value = parse_value(value);
    plc.write(address, value.clone())
        .await
        .with_context(|| format!("writing {}", address))?;
    println!("{} <- {}", address, value);
    plc.disconnect().await?;
    Ok(())
}

pub async fn monitor(
    config: SharedConfig,
    host: &str,
    tags: Vec<String>,
    interval_ms: u64,
    vendor: Option<Vendor>,
) -> Result<()> {
    let plc = open(config, host, vendor).await?;
    let monitor = plc.monitor(tags, Duration::from_millis(interval_ms), |name, sample| {
        println!("{} {} = {}", sample.timestamp.format("%H:%M:%S%.3f"), name, sample.value);
    });

    // poll for the monitor ending on its own so a lost connection is reported
    let mut check = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = check.tick() => {
                if monitor.is_finished() {
                    break;
                }
            }
        }
    }

    let mut plc = monitor.stop().await?;
    if !plc.is_connected() {
        bail!(
            "monitoring {} ended: {}",
            host,
            plc.last_error().unwrap_or_else(|| plc.state().to_string())
        );
    }
    plc.disconnect().await?;
    Ok(())
}

pub fn translate(input: &str, from: Vendor, to: Vendor) -> Result<()> {
    let parsed = address::parse(from, input)?;
    let translated = address::translate(&parsed, from, to)?;
    println!("{}", address::format(to, &translated)?);
    Ok(())
}

pub fn capabilities() {
    let families = available_capabilities();
    println!("Protocol families:");
    for family in &families {
        println!("  {:<12} {}", family.key(), family);
    }
    println!("Vendors:");
    for vendor in Vendor::ALL {
        let status = if capability_available(vendor) {
            "available"
        } else {
            "unavailable"
        };
        println!("  {:<22} {}", vendor.display_name(), status);
    }
}

/// Operator input to a value: booleans, integers, floats, otherwise text
fn parse_value(input: &str) -> Value {
    let trimmed = input.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" | "on" => return Value::Bool(true),
        "false" | "off" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        Value::Integer(n)
    } else if let Ok(f) = trimmed.parse::<f64>() {
        Value::Float(f)
    } else {
        Value::String(input.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("TRUE"), Value::Bool(true));
        assert_eq!(parse_value("off"), Value::Bool(false));
        assert_eq!(parse_value("-42"), Value::Integer(-42));
        assert_eq!(parse_value("1450.5"), Value::Float(1450.5));
        assert_eq!(parse_value("pump 2"), Value::String("pump 2".to_string()));
    }

    #[test]
    fn test_translate_rejects_bad_address() {
        assert!(translate("not an address", Vendor::Siemens, Vendor::Omron).is_err());
    }
}
