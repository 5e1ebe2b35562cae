//! ttyhub server binary.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use ttyhub::config::Config;
use ttyhub::listener::Listener;

#[derive(Parser, Debug)]
#[command(name = "ttyhub", version)]
#[command(about = "Share one half-duplex serial device among many TCP clients")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "ttyhub.json")]
    config: PathBuf,

    /// Validate the config file and exit
    #[arg(long)]
    check: bool,

    /// List available serial ports and exit
    #[arg(short, long)]
    list_ports: bool,

    /// Log level override (off, error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<LevelFilter>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.list_ports {
        return list_serial_ports();
    }

    // Let the facade's max level do the filtering so the config file can
    // still adjust it after the logger is installed.
    env_logger::Builder::new()
        .filter_level(LevelFilter::Trace)
        .format_timestamp_millis()
        .init();
    log::set_max_level(args.log_level.unwrap_or(LevelFilter::Info));

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    config.validate().context("invalid configuration")?;

    if args.check {
        println!("config ok: {} listener(s)", config.listeners.len());
        return Ok(());
    }

    if args.log_level.is_none() {
        log::set_max_level(config.log_level.as_level_filter());
    }

    if config.listeners.is_empty() {
        bail!(
            "no listeners configured in {} (use --list-ports to find devices)",
            args.config.display()
        );
    }

    let mut listeners = Vec::new();
    for listener_config in config.listeners {
        let name = listener_config.name.clone();
        let listener = Listener::start(listener_config)
            .with_context(|| format!("failed to start listener '{name}'"))?;
        listeners.push(listener);
    }

    info!("all {} listener(s) running", listeners.len());

    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

fn list_serial_ports() -> Result<()> {
    let ports = serialport::available_ports().context("failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("no serial ports found");
        return Ok(());
    }
    for port in ports {
        let kind = match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                let product = usb.product.as_deref().unwrap_or("USB serial");
                format!("{product} ({:04x}:{:04x})", usb.vid, usb.pid)
            }
            serialport::SerialPortType::BluetoothPort => "bluetooth".to_string(),
            serialport::SerialPortType::PciPort => "PCI".to_string(),
            serialport::SerialPortType::Unknown => "unknown".to_string(),
        };
        println!("{}\t{kind}", port.port_name);
    }
    Ok(())
}
