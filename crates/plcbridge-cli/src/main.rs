/*!
 * plcbridge command line.
 *
 * Thin operator front end over `plcbridge-devices`: vendor detection,
 * subnet scanning, device info, single tag reads and writes, and address
 * translation between vendor notations.
 */
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use plcbridge_core::config::{Config, ConfigBuilder, SharedConfig};
use plcbridge_devices::Vendor;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "plcbridge")]
#[command(version, about = "Vendor-agnostic PLC detection, scanning and access")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Probe and connect timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Identify the vendor of a PLC by probing its protocols
    Detect {
        /// Host name or IP address
        host: String,
    },
    /// Scan a subnet for PLCs
    Scan {
        /// CIDR block, e.g. 192.168.1.0/24
        cidr: String,
        /// Only check the most common industrial ports
        #[arg(long)]
        quick: bool,
        /// Hosts scanned concurrently
        #[arg(long)]
        workers: Option<usize>,
        /// Write a Markdown report to this file
        #[arg(long)]
        report: Option<PathBuf>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show device information, protection and run mode
    Info {
        /// Host, optionally with :port
        host: String,
        /// Skip detection and use this vendor
        #[arg(long)]
        vendor: Option<Vendor>,
    },
    /// Read a tag or address
    Read {
        /// Host, optionally with :port
        host: String,
        /// Tag name or vendor address
        address: String,
        /// Skip detection and use this vendor
        #[arg(long)]
        vendor: Option<Vendor>,
    },
    /// Write a tag or address
    Write {
        /// Host, optionally with :port
        host: String,
        /// Tag name or vendor address
        address: String,
        /// Value: true/false, an integer, a float or text
        value: String,
        /// Skip detection and use this vendor
        #[arg(long)]
        vendor: Option<Vendor>,
    },
    /// Print tag values as they change until Ctrl-C
    Monitor {
        /// Host, optionally with :port
        host: String,
        /// Tag names or vendor addresses
        #[arg(required = true)]
        tags: Vec<String>,
        /// Polling interval in milliseconds
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
        /// Skip detection and use this vendor
        #[arg(long)]
        vendor: Option<Vendor>,
    },
    /// Translate an address from one vendor notation to another
    Translate {
        /// Address in the source notation
        address: String,
        /// Source vendor
        #[arg(long)]
        from: Vendor,
        /// Target vendor
        #[arg(long)]
        to: Vendor,
    },
    /// List the protocol drivers compiled into this build
    Capabilities,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut builder = ConfigBuilder::new().with_environment_prefix("PLCBRIDGE");
    if let Some(path) = &cli.config {
        builder = builder.with_config_file(path);
    }
    let mut config = builder.build().context("loading configuration")?;

    if let Some(timeout) = cli.timeout_ms {
        config.probe.timeout_ms = timeout;
        config.scan.port_timeout_ms = timeout;
        config.connection.connect_timeout_ms = timeout;
    }
    match cli.verbose {
        0 => {}
        1 => config.logging.level = "debug".to_string(),
        _ => config.logging.level = "trace".to_string(),
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    plcbridge_core::init_with_config(&config)?;
    plcbridge_devices::init()?;
    let config = SharedConfig::new(config);

    match cli.command {
        Commands::Detect { host } => commands::detect(config, &host).await,
        Commands::Scan {
            cidr,
            quick,
            workers,
            report,
            json,
        } => commands::scan(config, &cidr, quick, workers, report, json).await,
        Commands::Info { host, vendor } => commands::info(config, &host, vendor).await,
        Commands::Read { host, address, vendor } => commands::read(config, &host, &address, vendor).await,
        Commands::Write {
            host,
            address,
            value,
            vendor,
        } => commands::write(config, &host, &address, &value, vendor).await,
        Commands::Monitor {
            host,
            tags,
            interval_ms,
            vendor,
        } => commands::monitor(config, &host, tags, interval_ms, vendor).await,
        Commands::Translate { address, from, to } => commands::translate(&address, from, to),
        Commands::Capabilities => {
            commands::capabilities();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_parse_scan() {
        let cli = Cli::parse_from(["plcbridge", "scan", "10.0.0.0/24", "--quick", "--workers", "8"]);
        match cli.command {
            Commands::Scan { cidr, quick, workers, .. } => {
                assert_eq!(cidr, "10.0.0.0/24");
                assert!(quick);
                assert_eq!(workers, Some(8));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_vendor_arguments() {
        let cli = Cli::parse_from(["plcbridge", "translate", "DB1.DBW0", "--from", "siemens", "--to", "ab"]);
        match cli.command {
            Commands::Translate { from, to, .. } => {
                assert_eq!(from, Vendor::Siemens);
                assert_eq!(to, Vendor::AllenBradley);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["plcbridge", "read", "h", "D0", "--vendor", "acme"]).is_err());
    }

    #[test]
    fn test_parse_monitor() {
        let cli = Cli::parse_from(["plcbridge", "monitor", "10.0.0.9", "D100", "M0", "--interval-ms", "250"]);
        match cli.command {
            Commands::Monitor { host, tags, interval_ms, vendor } => {
                assert_eq!(host, "10.0.0.9");
                assert_eq!(tags, vec!["D100".to_string(), "M0".to_string()]);
                assert_eq!(interval_ms, 250);
                assert_eq!(vendor, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["plcbridge", "monitor", "10.0.0.9"]).is_err());
    }

    #[test]
    fn test_global_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[scan]\nmax_workers = 7").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let cli = Cli::parse_from(["plcbridge", "-vv", "--config", &path, "--timeout-ms", "750", "capabilities"]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.scan.max_workers, 7);
        assert_eq!(config.probe.timeout_ms, 750);
        assert_eq!(config.connection.connect_timeout_ms, 750);
        assert_eq!(config.logging.level, "trace");
    }
}
