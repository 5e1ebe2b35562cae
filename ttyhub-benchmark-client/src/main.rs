//! ttyhub benchmark client
//!
//! Connects to a ttyhub listener and fires one request payload as fast as
//! the device answers. Because the server dedups and caches by payload, a
//! single repeated payload measures the full dispatch path under its most
//! cache-friendly load; the summary therefore reports percentile latency
//! (cache hits and device round trips land in visibly different buckets)
//! rather than a single average.
//!
//! Usage: cargo run -p ttyhub-benchmark-client -- [OPTIONS]

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

/// Matches the server's frame-quiet gap: once bytes stop for this long the
/// response is complete.
const RESPONSE_QUIET: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(name = "ttyhub-benchmark")]
#[command(about = "Benchmark request rate through a ttyhub listener")]
struct Args {
    /// Listener address to connect to
    #[arg(short, long, default_value = "127.0.0.1:8000")]
    address: String,

    /// Request payload as a hex string
    #[arg(short, long, default_value = "680303")]
    payload: String,

    /// Duration to run the benchmark in seconds (0 = run forever)
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Give up on a response after this many milliseconds
    #[arg(long, default_value = "4000")]
    response_timeout_ms: u64,

    /// Interval between progress printouts in seconds
    #[arg(short, long, default_value = "1")]
    interval: f64,

    /// Print individual responses
    #[arg(short, long)]
    verbose: bool,
}

/// Running counters plus every observed latency, kept as whole
/// microseconds. A `u32` holds over an hour, far beyond any response
/// timeout, so the samples stay compact even on long runs.
struct Stats {
    responses: u64,
    timeouts: u64,
    response_bytes: u64,
    latencies_us: Vec<u32>,
    window_responses: u64,
    window_started: Instant,
}

impl Stats {
    fn new() -> Self {
        Self {
            responses: 0,
            timeouts: 0,
            response_bytes: 0,
            latencies_us: Vec::new(),
            window_responses: 0,
            window_started: Instant::now(),
        }
    }

    fn record_response(&mut self, latency: Duration, bytes: usize) {
        self.responses += 1;
        self.window_responses += 1;
        self.response_bytes += bytes as u64;
        self.latencies_us
            .push(u32::try_from(latency.as_micros()).unwrap_or(u32::MAX));
    }

    fn record_timeout(&mut self) {
        self.timeouts += 1;
    }

    fn print_window(&mut self) {
        let elapsed = self.window_started.elapsed().as_secs_f64();
        #[allow(clippy::cast_precision_loss)] // per-window counts stay tiny
        let rate = self.window_responses as f64 / elapsed;
        print!(
            "\r  {rate:.1} req/s | {} responses | {} timed out",
            self.responses, self.timeouts
        );
        std::io::stdout().flush().ok();

        self.window_responses = 0;
        self.window_started = Instant::now();
    }

    fn print_summary(mut self, total_elapsed: Duration) {
        let secs = total_elapsed.as_secs_f64();
        #[allow(clippy::cast_precision_loss)] // counts stay far below 2^52
        let rate = self.responses as f64 / secs;

        println!("\n");
        println!(
            "{} responses, {} timeouts in {secs:.2}s ({rate:.1} req/s)",
            self.responses, self.timeouts
        );

        if self.latencies_us.is_empty() {
            return;
        }
        self.latencies_us.sort_unstable();
        println!(
            "latency:   p50 {:.1}ms  p95 {:.1}ms  max {:.1}ms",
            percentile_ms(&self.latencies_us, 50),
            percentile_ms(&self.latencies_us, 95),
            percentile_ms(&self.latencies_us, 100),
        );
        println!(
            "responses: {} bytes total, {} bytes avg",
            self.response_bytes,
            self.response_bytes / self.responses
        );
    }
}

/// Nearest-rank percentile over an ascending sample set, in milliseconds.
fn percentile_ms(sorted_us: &[u32], pct: usize) -> f64 {
    let idx = (sorted_us.len() - 1) * pct / 100;
    f64::from(sorted_us[idx]) / 1000.0
}

fn parse_hex_payload(s: &str) -> Result<Vec<u8>> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() || cleaned.len() % 2 != 0 {
        bail!("payload must be a non-empty even-length hex string");
    }
    cleaned
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).expect("chunked from str");
            u8::from_str_radix(pair, 16).with_context(|| format!("bad hex byte {pair:?}"))
        })
        .collect()
}

/// Read one response: first byte bounded by `timeout`, completion by the
/// quiet gap.
fn read_response(stream: &mut TcpStream, timeout: Duration) -> std::io::Result<Vec<u8>> {
    stream.set_read_timeout(Some(RESPONSE_QUIET))?;
    let deadline = Instant::now() + timeout;
    let mut response = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "server closed connection",
                ))
            }
            Ok(n) => response.extend_from_slice(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if !response.is_empty() {
                    return Ok(response);
                }
                if Instant::now() >= deadline {
                    return Err(std::io::Error::new(ErrorKind::TimedOut, "no response"));
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn run_benchmark(args: &Args) -> Result<()> {
    let payload = parse_hex_payload(&args.payload)?;

    println!("Connecting to {}...", args.address);
    let mut stream = TcpStream::connect(&args.address)
        .with_context(|| format!("failed to connect to {}", args.address))?;
    stream.set_nodelay(true)?;

    println!(
        "Starting benchmark{}...\n",
        if args.duration > 0 {
            format!(" for {}s", args.duration)
        } else {
            " (press Ctrl+C to stop)".to_string()
        }
    );

    let mut stats = Stats::new();
    let start = Instant::now();
    let duration = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let interval = Duration::from_secs_f64(args.interval);
    let response_timeout = Duration::from_millis(args.response_timeout_ms);

    loop {
        if let Some(d) = duration {
            if start.elapsed() >= d {
                break;
            }
        }

        let request_start = Instant::now();
        stream.write_all(&payload)?;
        match read_response(&mut stream, response_timeout) {
            Ok(response) => {
                let latency = request_start.elapsed();
                stats.record_response(latency, response.len());
                if args.verbose {
                    println!(
                        "{} bytes in {:.2}ms",
                        response.len(),
                        latency.as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                stats.record_timeout();
                if args.verbose {
                    println!("Error: no response within {response_timeout:?}");
                }
            }
            Err(e) => {
                eprintln!("\nConnection error: {e}");
                break;
            }
        }

        if stats.window_started.elapsed() >= interval {
            stats.print_window();
        }
    }

    stats.print_summary(start.elapsed());
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run_benchmark(&args) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_payload() {
        assert_eq!(parse_hex_payload("680303").unwrap(), vec![0x68, 0x03, 0x03]);
        assert_eq!(parse_hex_payload("68 03 03").unwrap(), vec![0x68, 0x03, 0x03]);
        assert_eq!(parse_hex_payload("FF").unwrap(), vec![0xFF]);
        assert!(parse_hex_payload("").is_err());
        assert!(parse_hex_payload("1").is_err());
        assert!(parse_hex_payload("zz").is_err());
    }

    #[test]
    fn test_percentile_ms() {
        let samples: Vec<u32> = (1..=100).map(|n| n * 1000).collect();
        assert!((percentile_ms(&samples, 50) - 50.0).abs() < 1.5);
        assert!((percentile_ms(&samples, 95) - 95.0).abs() < 1.5);
        assert!((percentile_ms(&samples, 100) - 100.0).abs() < f64::EPSILON);

        let single = vec![2500u32];
        assert!((percentile_ms(&single, 50) - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stats_accumulation() {
        let mut stats = Stats::new();
        stats.record_response(Duration::from_millis(10), 5);
        stats.record_response(Duration::from_millis(20), 7);
        stats.record_timeout();

        assert_eq!(stats.responses, 2);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.response_bytes, 12);
        assert_eq!(stats.latencies_us, vec![10_000, 20_000]);
    }
}
