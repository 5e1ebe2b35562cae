//! Mock half-duplex device served over TCP, for testing ttyhub without
//! hardware.
//!
//! Request bytes accumulate until a 20 ms lull, then after `--latency-ms`
//! the device answers `0x55 0xAA <len> <payload bytes, each XOR 0xFF>`.
//! With `--chunk-size` the reply is dribbled out in pieces to exercise the
//! server's frame assembly.
//!
//! Usage: cargo run -p ttyhub-mock-device-server -- [OPTIONS]
//! Then point a ttyhub listener's device at 127.0.0.1:7900.

use clap::Parser;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

const REQUEST_LULL: Duration = Duration::from_millis(20);

#[derive(Parser, Debug, Clone)]
#[command(name = "ttyhub-mock-device")]
#[command(about = "Mock half-duplex device over TCP")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "7900")]
    port: u16,

    /// Delay between receiving a request and starting the reply
    #[arg(short, long, default_value = "20")]
    latency_ms: u64,

    /// Split replies into chunks of this many bytes (0 = single write)
    #[arg(long, default_value = "0")]
    chunk_size: usize,

    /// Delay between reply chunks
    #[arg(long, default_value = "5")]
    chunk_delay_ms: u64,

    /// Suppress per-request output
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let args = Args::parse();

    println!("Mock device starting on 0.0.0.0:{}...", args.port);
    let listener = TcpListener::bind(("0.0.0.0", args.port)).expect("failed to bind");
    println!("Mock device ready - waiting for connections...");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                println!("Server connected: {:?}", stream.peer_addr());
                let args = args.clone();
                thread::spawn(move || handle_connection(stream, &args));
            }
            Err(e) => eprintln!("Connection error: {e}"),
        }
    }
}

fn handle_connection(mut stream: TcpStream, args: &Args) {
    if stream.set_read_timeout(Some(REQUEST_LULL)).is_err() {
        return;
    }

    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                println!("Server disconnected");
                return;
            }
            Ok(n) => pending.extend_from_slice(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if pending.is_empty() {
                    continue;
                }
                if !args.quiet {
                    println!("RX: {}", hex(&pending));
                }
                let reply = build_reply(&pending);
                pending.clear();
                if !args.quiet {
                    println!("TX: {}", hex(&reply));
                }
                if send_reply(&mut stream, &reply, args).is_err() {
                    eprintln!("Write error, closing connection");
                    return;
                }
            }
            Err(e) => {
                eprintln!("Read error: {e}");
                return;
            }
        }
    }
}

/// Deterministic reply so test clients can validate round trips:
/// `0x55 0xAA <len> <payload ^ 0xFF>`.
fn build_reply(request: &[u8]) -> Vec<u8> {
    let mut reply = Vec::with_capacity(request.len() + 3);
    reply.push(0x55);
    reply.push(0xAA);
    reply.push(request.len().min(usize::from(u8::MAX)) as u8);
    reply.extend(request.iter().map(|b| b ^ 0xFF));
    reply
}

fn send_reply(stream: &mut TcpStream, reply: &[u8], args: &Args) -> std::io::Result<()> {
    thread::sleep(Duration::from_millis(args.latency_ms));

    if args.chunk_size == 0 {
        return stream.write_all(reply);
    }
    for chunk in reply.chunks(args.chunk_size) {
        stream.write_all(chunk)?;
        thread::sleep(Duration::from_millis(args.chunk_delay_ms));
    }
    Ok(())
}

fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
