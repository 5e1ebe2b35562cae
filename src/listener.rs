//! TCP listener: accepts clients and feeds their bytes to the dispatch
//! engine for one device.
//!
//! Every connected client gets a reader loop; each inbound chunk becomes
//! one engine submission, and a responder thread writes the outcome back to
//! that client only. A client that submits a command another client already
//! has in flight simply shares the response; none of that is visible here.

use anyhow::{Context, Result};
use log::{debug, error, info};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener as TcpAcceptor, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ListenerConfig;
use crate::link::open_link;
use ttyhub_dispatch_lib::{run_frame_assembler, Engine, REAP_TICK, REQUEST_TIMEOUT};

const ACCEPT_IDLE: Duration = Duration::from_millis(100);
const CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(100);
// Bounds responder writes so a stalled client cannot hold up stop().
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const CLIENT_BUF_LEN: usize = 65536;

/// Per-listener traffic counters. `tx` is client → device.
#[derive(Default)]
pub struct Stats {
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    rx_packets: AtomicU64,
    clients: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub clients: usize,
}

impl Stats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            clients: self.clients.load(Ordering::Relaxed),
        }
    }
}

pub struct Listener {
    name: String,
    engine: Arc<Engine>,
    local_port: u16,
    stats: Arc<Stats>,
    stop: AtomicBool,
    client_counter: AtomicU64,
    /// Accept loop, frame assembler, client handlers and responders.
    /// The accept loop owns the TCP socket, so joining it releases the port.
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Listener {
    /// Open the device, start its engine and begin accepting clients.
    pub fn start(config: ListenerConfig) -> Result<Arc<Listener>> {
        let (reader, writer) =
            open_link(&config).with_context(|| format!("listener '{}'", config.name))?;
        let engine = Engine::start(writer);

        let acceptor = TcpAcceptor::bind(("0.0.0.0", config.listen_port))
            .with_context(|| format!("failed to listen on port {}", config.listen_port))?;
        acceptor.set_nonblocking(true)?;
        let local_port = acceptor.local_addr()?.port();

        info!(
            "[{}] listening on :{} -> {} baud={}",
            config.name, local_port, config.device, config.baud_rate
        );

        let listener = Arc::new(Listener {
            name: config.name,
            engine: engine.clone(),
            local_port,
            stats: Arc::new(Stats::default()),
            stop: AtomicBool::new(false),
            client_counter: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
        });

        let assembler_engine = engine;
        let assembler = thread::Builder::new()
            .name("ttyhub-frames".into())
            .spawn(move || run_frame_assembler(reader, &assembler_engine))
            .expect("failed to spawn frame assembler");
        listener.track_worker(assembler);

        let accept_listener = listener.clone();
        let accept = thread::Builder::new()
            .name("ttyhub-accept".into())
            .spawn(move || accept_listener.accept_loop(&acceptor))
            .expect("failed to spawn accept loop");
        listener.track_worker(accept);

        Ok(listener)
    }

    /// Stop the listener: fail everything pending, release the device, and
    /// join the worker threads, which releases the TCP port. Idempotent; on
    /// return no accept, assembler, handler or responder thread is running.
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.engine.shutdown();

        // Workers spawned while the first batch was being joined (a client
        // accepted just before the flag landed) show up in a later take.
        let current = thread::current().id();
        loop {
            let workers = std::mem::take(&mut *self.workers.lock().unwrap());
            if workers.is_empty() {
                break;
            }
            for handle in workers {
                // A stop reached from a worker's own teardown must not
                // wait on itself.
                if handle.thread().id() == current {
                    continue;
                }
                let _ = handle.join();
            }
        }
        info!("[{}] stopped", self.name);
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Actual bound port; differs from the configured one when that was 0.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn track_worker(&self, handle: JoinHandle<()>) {
        let mut workers = self.workers.lock().unwrap();
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
    }

    fn accept_loop(self: &Arc<Self>, acceptor: &TcpAcceptor) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            match acceptor.accept() {
                Ok((stream, addr)) => {
                    let listener = self.clone();
                    let client_addr = addr.to_string();
                    let handle = thread::Builder::new()
                        .name("ttyhub-client".into())
                        .spawn(move || listener.handle_client(stream, &client_addr))
                        .expect("failed to spawn client handler");
                    self.track_worker(handle);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_IDLE),
                Err(e) => {
                    error!("[{}] accept error: {e}", self.name);
                    return;
                }
            }
        }
    }

    fn handle_client(&self, stream: TcpStream, addr: &str) {
        let client_no = self.client_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.stats.clients.fetch_add(1, Ordering::Relaxed) + 1;
        info!("[{}] client connected {addr} -> #{client_no} (total: {total})", self.name);

        if let Err(e) = self.client_loop(&stream, addr, client_no) {
            debug!("[{}] client #{client_no} error: {e}", self.name);
        }

        let remaining = self.stats.clients.fetch_sub(1, Ordering::Relaxed) - 1;
        info!("[{}] client disconnected #{client_no} (remaining: {remaining})", self.name);
    }

    fn client_loop(&self, stream: &TcpStream, addr: &str, client_no: u64) -> std::io::Result<()> {
        stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT))?;
        stream.set_write_timeout(Some(CLIENT_WRITE_TIMEOUT))?;
        let mut stream = stream;
        let mut buf = vec![0u8; CLIENT_BUF_LEN];

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            match stream.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    self.stats.tx_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    self.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "[{}] #{client_no} tx {}",
                        self.name,
                        hex_compact(&buf[..n])
                    );

                    let handle = self.engine.submit(addr, &buf[..n]);

                    // Write the outcome back on its own thread so a slow
                    // device never stalls this client's read loop. Engine
                    // shutdown resolves the handle, so these drain promptly
                    // when the listener stops.
                    let response_stream = stream.try_clone()?;
                    let stats = self.stats.clone();
                    let name = self.name.clone();
                    let responder = thread::spawn(move || {
                        let Some(data) = handle.wait_timeout(REQUEST_TIMEOUT + REAP_TICK) else {
                            // No reply within policy; the client hears nothing.
                            return;
                        };
                        stats.rx_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                        stats.rx_packets.fetch_add(1, Ordering::Relaxed);
                        debug!("[{name}] #{client_no} rx {}", hex_compact(&data));
                        let mut response_stream = &response_stream;
                        if let Err(e) = response_stream.write_all(&data) {
                            debug!("[{name}] #{client_no} response write failed: {e}");
                        }
                    });
                    self.track_worker(responder);
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Compact hex rendering for traffic logs: `68 03 03`.
fn hex_compact(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}
