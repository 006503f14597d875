use std::net::SocketAddrV4;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info, trace, warn};

use crate::payload::{self, Control};
use crate::registry::Registry;
use crate::socket::UdpEndpoint;
use crate::{SessionConfig, MAX_PKT_SIZE, SPINNER};

/// Backoff between registration polls.
const REGISTER_POLL: Duration = Duration::from_millis(10);
/// Spinner refresh interval during registration.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
/// Settle time between closing registration and broadcasting READY.
const START_SETTLE: Duration = Duration::from_millis(500);
/// Grace window for every client to acknowledge READY with SETGO.
const SETGO_GRACE: Duration = Duration::from_secs(5);
const SETGO_POLL: Duration = Duration::from_millis(5);
/// Backoff when the receive queue runs dry during the timed run.
const RUNNING_IDLE_POLL: Duration = Duration::from_micros(50);
/// The drain phase ends after this long without a straggler.
const DRAIN_IDLE: Duration = Duration::from_millis(250);
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Server-side phases of one test iteration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Registering,
    Starting,
    Running,
    Draining,
}

/// Per-client outcome of one iteration, in slot order.
#[derive(Clone, Debug)]
pub struct SlotReport {
    pub slot: usize,
    pub endpoint: SocketAddrV4,
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Clone, Debug)]
pub struct IterationSummary {
    pub multiplier: u64,
    pub clients: Vec<SlotReport>,
    pub late_packets: u64,
}

/// The coordinator role: registers clients, synchronizes the start, then
/// counts everything that arrives for the test duration.
pub struct Server {
    socket: UdpEndpoint,
    registry: Registry,
    recv_buf: Vec<u8>,
    cfg: SessionConfig,
}

impl Server {
    pub fn bind(cfg: &SessionConfig) -> Result<Self> {
        let socket = UdpEndpoint::bind(cfg.addr)
            .with_context(|| format!("failed to create or bind socket on {}", cfg.addr))?;
        Ok(Server {
            socket,
            registry: Registry::new(),
            recv_buf: vec![0; MAX_PKT_SIZE],
            cfg: cfg.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        Ok(self.socket.local_addr()?)
    }

    /// Run iterations until the loop flag says stop. An aborted iteration
    /// (missing SETGO) restarts registration in loop mode and returns
    /// cleanly otherwise; only socket and MPH failures propagate.
    pub fn run(&mut self) -> Result<()> {
        loop {
            match self.run_iteration()? {
                Some(summary) => print_summary(&summary),
                None if !self.cfg.loop_forever => return Ok(()),
                None => {}
            }
            if !self.cfg.loop_forever {
                return Ok(());
            }
            self.registry.clear();
        }
    }

    /// One pass through the phase machine. `Ok(None)` means the iteration
    /// was aborted because the client set never became consistent.
    pub fn run_iteration(&mut self) -> Result<Option<IterationSummary>> {
        let mut phase = Phase::Registering;
        loop {
            phase = match phase {
                Phase::Registering => {
                    self.register_clients()?;
                    Phase::Starting
                }
                Phase::Starting => {
                    if self.start_clients()? {
                        Phase::Running
                    } else {
                        return Ok(None);
                    }
                }
                Phase::Running => {
                    self.collect_packets()?;
                    Phase::Draining
                }
                Phase::Draining => {
                    let late_packets = self.drain()?;
                    return Ok(Some(self.summarize(late_packets)));
                }
            };
        }
    }

    /// Poll for HELLO probes until the configured client count is reached.
    /// No timeout here: the phase runs as long as it takes, with a periodic
    /// progress signal.
    fn register_clients(&mut self) -> Result<()> {
        let want = self.cfg.clients as usize;
        info!("registering, waiting for {} client(s)", want);

        let mut spin = 0usize;
        let mut last_progress = Instant::now();
        while self.registry.len() < want {
            match self.socket.try_recv_from(&mut self.recv_buf)? {
                Some((len, from)) => match Control::parse(&self.recv_buf[..len]) {
                    Some(Control::Hello) => {
                        self.socket.send_to(Control::Hello.as_bytes(), from)?;
                        if self.registry.register(from) {
                            eprintln!("\r> HELLO from {}", from);
                        } else {
                            debug!("duplicate HELLO from {}", from);
                        }
                    }
                    _ => debug!("ignoring stray datagram ({} bytes) from {}", len, from),
                },
                None => thread::sleep(REGISTER_POLL),
            }
            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                last_progress = Instant::now();
                eprint!(
                    "\r> registering {} [{}/{}]",
                    SPINNER[spin % SPINNER.len()],
                    self.registry.len(),
                    want
                );
                spin += 1;
            }
        }
        eprintln!("\r> registering OK [{}/{}]", self.registry.len(), want);
        Ok(())
    }

    /// Close registration: assign slots through the MPH, broadcast READY,
    /// then collect one SETGO per client inside the grace window. Returns
    /// false when the client set never became consistent.
    fn start_clients(&mut self) -> Result<bool> {
        let multiplier = self.registry.assign_slots()?;
        info!(
            "multiplier {} maps {} client(s) onto slots",
            multiplier,
            self.registry.len()
        );
        for c in self.registry.clients() {
            debug!("slot {} -> {}", c.slot, c.endpoint);
        }

        thread::sleep(START_SETTLE);
        for c in self.registry.clients() {
            self.socket.send_to(Control::Ready.as_bytes(), c.endpoint)?;
        }

        let mut pending = self.registry.len();
        let started = Instant::now();
        while pending > 0 && started.elapsed() < SETGO_GRACE {
            match self.socket.try_recv_from(&mut self.recv_buf)? {
                Some((len, from)) => {
                    if Control::parse(&self.recv_buf[..len]) == Some(Control::SetGo) {
                        pending -= 1;
                        debug!("SETGO from {}", from);
                    }
                }
                None => thread::sleep(SETGO_POLL),
            }
        }

        if pending > 0 {
            warn!(
                "{} client(s) did not acknowledge within {:?}, aborting iteration",
                pending, SETGO_GRACE
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// The timed run: count every inbound datagram against the slot its
    /// sender hashes to.
    fn collect_packets(&mut self) -> Result<()> {
        eprintln!("> running network test");
        let started = Instant::now();
        while started.elapsed() < self.cfg.duration {
            match self.socket.try_recv_from(&mut self.recv_buf)? {
                Some((len, from)) => {
                    if log::log_enabled!(log::Level::Trace) {
                        if let Ok(seq) = payload::decode_seq(&self.recv_buf[..len]) {
                            trace!(
                                "pkt {} ({} bytes) from {} slot {:?}",
                                seq,
                                len,
                                from,
                                self.registry.slot_of(&from)
                            );
                        }
                    }
                    self.registry.record_packet(from, len);
                }
                None => thread::sleep(RUNNING_IDLE_POLL),
            }
        }
        eprintln!("> network test completed");
        Ok(())
    }

    /// Consume stragglers so they cannot leak into the next iteration,
    /// bounded by a short idle timeout.
    fn drain(&mut self) -> Result<u64> {
        let mut consumed = 0u64;
        let mut idle_since = Instant::now();
        loop {
            match self.socket.try_recv_from(&mut self.recv_buf)? {
                Some(_) => {
                    consumed += 1;
                    idle_since = Instant::now();
                }
                None => {
                    if idle_since.elapsed() >= DRAIN_IDLE {
                        break;
                    }
                    thread::sleep(DRAIN_POLL);
                }
            }
        }
        eprintln!("> consumed {} late packets", consumed);
        Ok(consumed)
    }

    fn summarize(&self, late_packets: u64) -> IterationSummary {
        IterationSummary {
            multiplier: self.registry.multiplier().unwrap_or(0),
            clients: self
                .registry
                .sorted_by_slot()
                .into_iter()
                .map(|c| SlotReport {
                    slot: c.slot,
                    endpoint: c.endpoint,
                    packets: c.packets_received,
                    bytes: c.bytes_received,
                })
                .collect(),
            late_packets,
        }
    }
}

fn print_summary(summary: &IterationSummary) {
    let total = summary.clients.len();
    for (i, c) in summary.clients.iter().enumerate() {
        println!(
            "> [{}/{} ({})] {} {} pkts ({} B)",
            i + 1,
            total,
            c.slot,
            c.endpoint,
            c.packets,
            c.bytes
        );
    }
    println!(
        "> multiplier {}, {} late packets",
        summary.multiplier, summary.late_packets
    );
}
