//! Link drivers: real serial ports and TCP-attached devices.
//!
//! Both drivers hand back independent read and write halves. The read half
//! carries the frame-quiet timeout, which is what turns inter-byte silence
//! into frame boundaries upstream.

use anyhow::{bail, Context, Result};
use log::info;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config::ListenerConfig;
use ttyhub_dispatch_lib::{LinkReader, LinkWriter, FRAME_QUIET};

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the device named by the listener config and return the link halves
/// consumed by the dispatch engine.
pub fn open_link(config: &ListenerConfig) -> Result<(Box<dyn LinkReader>, Box<dyn LinkWriter>)> {
    if config.is_network_device() {
        open_tcp_link(&config.device)
    } else {
        open_serial_link(config)
    }
}

fn open_serial_link(
    config: &ListenerConfig,
) -> Result<(Box<dyn LinkReader>, Box<dyn LinkWriter>)> {
    let data_bits = match config.data_bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        8 => DataBits::Eight,
        other => bail!("unsupported data bits: {other} (supported: 5-8)"),
    };
    let stop_bits = match config.stop_bits {
        1 => StopBits::One,
        2 => StopBits::Two,
        other => bail!("unsupported stop bits: {other} (supported: 1 or 2)"),
    };
    let parity = match config.parity.as_str() {
        "N" | "n" => Parity::None,
        "O" | "o" => Parity::Odd,
        "E" | "e" => Parity::Even,
        other => bail!("unsupported parity: {other} (supported: N/O/E)"),
    };

    let port = serialport::new(config.device.as_str(), config.baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .flow_control(FlowControl::None)
        .timeout(FRAME_QUIET)
        .open()
        .with_context(|| format!("failed to open serial port {}", config.device))?;

    let reader = port
        .try_clone()
        .with_context(|| format!("failed to clone serial port {}", config.device))?;

    info!(
        "opened {} baud={} bits={} parity={} stop={}",
        config.device, config.baud_rate, config.data_bits, config.parity, config.stop_bits
    );

    Ok((
        Box::new(SerialHalf { port: reader }),
        Box::new(SerialHalf { port }),
    ))
}

fn open_tcp_link(device: &str) -> Result<(Box<dyn LinkReader>, Box<dyn LinkWriter>)> {
    let addr = device
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve device address {device}"))?
        .next()
        .with_context(|| format!("device address {device} resolved to nothing"))?;

    let stream = TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT)
        .with_context(|| format!("failed to connect to device {device}"))?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(FRAME_QUIET))?;

    let reader = stream
        .try_clone()
        .with_context(|| format!("failed to clone device stream {device}"))?;

    info!("connected to network device {device}");

    Ok((
        Box::new(TcpHalf { stream: reader }),
        Box::new(TcpHalf { stream }),
    ))
}

struct SerialHalf {
    port: Box<dyn SerialPort>,
}

impl LinkReader for SerialHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl LinkWriter for SerialHalf {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()
    }
}

struct TcpHalf {
    stream: TcpStream,
}

impl LinkReader for TcpHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl LinkWriter for TcpHalf {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf)
    }
}
