use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{debug, info};
use rand::Rng;
use rand_mt::Mt64;

use crate::payload::{self, Control, CONTROL_BUF, SEQ_LEN};
use crate::socket::UdpEndpoint;
use crate::timing::{self, PacketLog, PacketLogEntry, SendStats};
use crate::{Role, SessionConfig, MAX_PKT_SIZE, SPINNER};

/// Backoff between control-message polls.
const POLL_INTERVAL: Duration = Duration::from_millis(120);
/// Re-send HELLO every this many polls (~6 s).
const HELLO_EVERY: u32 = 50;
/// Give up on READY after this many polls (~36 s) and re-register.
const READY_TIMEOUT_POLLS: usize = 300;
/// Settle time around the SETGO acknowledgment.
const START_SETTLE: Duration = Duration::from_millis(500);
/// Largest padding a presampled size may request.
const MAX_PAD: u32 = (MAX_PKT_SIZE - SEQ_LEN) as u32;

/// Client-side phases of one test iteration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Registering,
    AwaitingReady,
    Acknowledge,
    Running,
    LogWrite,
}

/// Outcome of one completed iteration.
#[derive(Clone, Debug)]
pub struct ClientReport {
    pub packets_sent: u64,
    pub stats: SendStats,
    pub duration: Duration,
}

/// The load-generator role: rendezvous with the server, then pump
/// variate-shaped traffic for the test duration and log every send.
pub struct Client {
    socket: UdpEndpoint,
    cfg: SessionConfig,
    delays: Option<Vec<u32>>,
    sizes: Option<Vec<u32>>,
    log: PacketLog,
}

impl Client {
    /// Bind the socket and presample the variate tables. Sampling happens
    /// here, once, so the timed send path never pays for it; in loop mode
    /// the same tables are replayed each iteration.
    pub fn bind(cfg: &SessionConfig) -> Result<Self> {
        let socket = UdpEndpoint::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .context("failed to create or bind client socket")?;

        let mut rng = Mt64::new(rand::thread_rng().gen());
        let delays = cfg.delay_dist.map(|dist| {
            eprint!("> generating {} delay distribution...", dist.name());
            let table = dist.generate_table(cfg.max_packets, &mut rng);
            eprintln!("OK");
            table
        });
        let sizes = cfg.size_dist.map(|dist| {
            eprint!("> generating {} data distribution...", dist.name());
            let table: Vec<u32> = dist
                .generate_table(cfg.max_packets, &mut rng)
                .into_iter()
                .map(|v| v.min(MAX_PAD))
                .collect();
            eprintln!("OK");
            table
        });

        Ok(Client {
            socket,
            cfg: cfg.clone(),
            delays,
            sizes,
            log: PacketLog::with_capacity(cfg.max_packets.min(1 << 20)),
        })
    }

    pub fn log(&self) -> &PacketLog {
        &self.log
    }

    /// Run iterations until the loop flag says stop. The dummy role exits
    /// after its first go signal.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let Some(report) = self.run_iteration()? else {
                return Ok(());
            };
            print_report(&report);
            if !self.cfg.loop_forever {
                return Ok(());
            }
        }
    }

    /// One pass through the phase machine. `Ok(None)` means the dummy role
    /// bowed out after the go signal.
    pub fn run_iteration(&mut self) -> Result<Option<ClientReport>> {
        let mut phase = Phase::Registering;
        let mut report = None;
        loop {
            phase = match phase {
                Phase::Registering => {
                    self.register()?;
                    Phase::AwaitingReady
                }
                Phase::AwaitingReady => {
                    // A READY timeout is recoverable: start over rather than
                    // hang forever on a dead server.
                    if self.await_ready()? {
                        Phase::Acknowledge
                    } else {
                        Phase::Registering
                    }
                }
                Phase::Acknowledge => {
                    thread::sleep(START_SETTLE);
                    if self.cfg.role == Role::Dummy {
                        eprintln!("> in dummy mode, exiting");
                        return Ok(None);
                    }
                    self.socket
                        .send_to(Control::SetGo.as_bytes(), self.cfg.addr)?;
                    thread::sleep(START_SETTLE);
                    Phase::Running
                }
                Phase::Running => {
                    report = Some(self.pump()?);
                    Phase::LogWrite
                }
                Phase::LogWrite => {
                    self.write_log()?;
                    return Ok(report);
                }
            };
        }
    }

    /// Probe with HELLO until the server echoes it back.
    fn register(&mut self) -> Result<()> {
        let mut buf = [0u8; CONTROL_BUF];
        let mut i = 0u32;
        loop {
            eprint!("\r> registering {}", SPINNER[i as usize % SPINNER.len()]);
            if i % HELLO_EVERY == 0 {
                self.socket
                    .send_to(Control::Hello.as_bytes(), self.cfg.addr)?;
            }
            i += 1;
            thread::sleep(POLL_INTERVAL);
            if self.expect(Control::Hello, &mut buf)? {
                break;
            }
        }
        eprintln!("\r> registering OK");
        Ok(())
    }

    /// Poll for READY; false on timeout.
    fn await_ready(&mut self) -> Result<bool> {
        let mut buf = [0u8; CONTROL_BUF];
        for i in 0..READY_TIMEOUT_POLLS {
            eprint!("\r> waiting to start {}", SPINNER[i % SPINNER.len()]);
            if self.expect(Control::Ready, &mut buf)? {
                eprintln!("\r> got the ready signal");
                return Ok(true);
            }
            thread::sleep(POLL_INTERVAL);
        }
        eprintln!("\r> timeout waiting for the ready signal, re-registering");
        info!("READY timeout after {} polls", READY_TIMEOUT_POLLS);
        Ok(false)
    }

    /// Poll once for a control message, consuming at most one datagram.
    fn expect(&self, want: Control, buf: &mut [u8]) -> Result<bool> {
        Ok(match self.socket.try_recv_from(buf)? {
            Some((len, _from)) => Control::parse(&buf[..len]) == Some(want),
            None => false,
        })
    }

    /// The timed send loop. For each sequence number: sleep the presampled
    /// delay, build the padded payload, time the send call, and log the
    /// attempt whether or not the send succeeded.
    fn pump(&mut self) -> Result<ClientReport> {
        let max_pad = match &self.sizes {
            Some(table) => table.iter().copied().max().unwrap_or(0) as usize,
            None => 0,
        };
        let mut buf = vec![0u8; SEQ_LEN + max_pad];
        let mut stats = SendStats::new();
        self.log.clear();

        eprint!("> running test ...");
        let mut seq: u32 = 0;
        let started = Instant::now();
        loop {
            let i = seq as usize;
            if i >= self.cfg.max_packets {
                // Contract violation: the tables must cover the worst-case
                // packet count for this duration.
                bail!(
                    "presampled tables exhausted after {} packets; raise the presample cap",
                    seq
                );
            }

            if let Some(delays) = &self.delays {
                let us = delays[i];
                if us > 0 {
                    thread::sleep(Duration::from_micros(us as u64));
                }
            }

            let len = SEQ_LEN + self.sizes.as_ref().map_or(0, |t| t[i] as usize);
            payload::encode_seq(seq, &mut buf)?;

            let send_time_us = timing::wall_clock_us();
            let send_call = Instant::now();
            let transmitted = self.socket.send_to(&buf[..len], self.cfg.addr).is_ok();
            let sendto_us = timing::duration_us(send_call.elapsed());

            self.log.push(PacketLogEntry {
                sequence: seq,
                send_time_us,
                sendto_us,
                transmitted,
            });
            stats.record(sendto_us, transmitted, len);
            if !transmitted {
                debug!("send of pkt {} failed", seq);
            }

            seq += 1;
            if started.elapsed() >= self.cfg.duration {
                break;
            }
        }
        let duration = started.elapsed();
        eprintln!("\r> network test is done ({} packets sent)", stats.attempts());

        Ok(ClientReport {
            packets_sent: seq as u64,
            stats,
            duration,
        })
    }

    fn write_log(&self) -> Result<()> {
        eprint!("> {} ({} rows) ...", self.cfg.logfile.display(), self.log.len());
        self.log
            .write_csv(&self.cfg.logfile)
            .with_context(|| format!("failed to write {}", self.cfg.logfile.display()))?;
        eprintln!(
            "\r> {} ({} rows) ... DONE",
            self.cfg.logfile.display(),
            self.log.len()
        );
        Ok(())
    }
}

fn print_report(report: &ClientReport) {
    println!(
        "CAD: min={}us, max={}us",
        report.stats.min_us(),
        report.stats.max_us()
    );
    println!(
        "PTS: good={}, fail={}",
        report.stats.good, report.stats.fail
    );
    println!("BW: {:.1} B/s", report.stats.bandwidth_bps(report.duration));
}
