use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};

mod client;
mod distribution;
mod mph;
mod payload;
mod registry;
mod server;
mod socket;
mod timing;

use client::Client;
use distribution::Distribution;
use server::Server;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_TEST_SECONDS: u64 = 10;
const DEFAULT_LOGFILE: &str = "logdata.csv";
/// Cap on the presampled variate tables, and thus on packets per iteration.
const MAX_PACKETS: usize = 5_000_000;
/// Largest datagram either role will build or receive.
pub const MAX_PKT_SIZE: usize = 64_100;

pub const SPINNER: [&str; 4] = ["/", "-", "\\", "|"];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
    Dummy,
}

/// Immutable per-run configuration, assembled once before any protocol
/// activity.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub role: Role,
    /// Bind address for the server role, the remote peer for client roles.
    pub addr: SocketAddrV4,
    /// Expected client count (server role only).
    pub clients: u32,
    pub duration: Duration,
    pub delay_dist: Option<Distribution>,
    pub size_dist: Option<Distribution>,
    pub logfile: PathBuf,
    pub loop_forever: bool,
    pub max_packets: usize,
}

impl SessionConfig {
    fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let port = matches
            .get_one::<u16>("port")
            .copied()
            .unwrap_or(DEFAULT_PORT);

        let (role, addr, clients) = if let Some(&n) = matches.get_one::<u32>("server") {
            (
                Role::Server,
                SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port),
                n,
            )
        } else if let Some(&host) = matches.get_one::<Ipv4Addr>("client") {
            (Role::Client, SocketAddrV4::new(host, port), 0)
        } else if let Some(&host) = matches.get_one::<Ipv4Addr>("dummy") {
            (Role::Dummy, SocketAddrV4::new(host, port), 0)
        } else {
            bail!("must run as either a client (-c), server (-s) or dummy (-x)");
        };

        Ok(SessionConfig {
            role,
            addr,
            clients,
            duration: Duration::from_secs(
                matches
                    .get_one::<u64>("time")
                    .copied()
                    .unwrap_or(DEFAULT_TEST_SECONDS),
            ),
            delay_dist: parse_dist(matches, "rate")?,
            size_dist: parse_dist(matches, "data")?,
            logfile: PathBuf::from(
                matches
                    .get_one::<String>("file")
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_LOGFILE),
            ),
            // The server keeps serving iterations by default; clients are
            // one-shot unless asked to loop.
            loop_forever: matches.get_flag("loop") || role == Role::Server,
            max_packets: MAX_PACKETS,
        })
    }
}

fn parse_dist(matches: &ArgMatches, name: &str) -> Result<Option<Distribution>> {
    let Some(values) = matches.get_many::<String>(name) else {
        return Ok(None);
    };
    let values: Vec<&String> = values.collect();
    let &[dist, params] = values.as_slice() else {
        bail!("expected a distribution name and parameters for --{}", name);
    };
    match Distribution::create(dist, params) {
        Ok(d) => Ok(Some(d)),
        Err(e) => bail!("invalid --{} spec: {}", name, e),
    }
}

fn cli() -> Command {
    Command::new("jana")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Distributed UDP load-testing harness")
        .after_help(
            "Distribution options take `NAME k1=v1,k2=v2` notation:\n  \
             uniform n=<scale>,k=<offset>\n  \
             exp y=<mean>\n  \
             weibull a=<shape>,b=<inverse scale>\n\n\
             Examples:\n  \
             jana -s 1 -p 3333\n  \
             jana -c 192.168.1.5 -p 3333 -r weibull a=33,b=55 -d uniform n=0,k=100",
        )
        .arg(
            Arg::new("server")
                .short('s')
                .long("server")
                .value_name("CLIENTS")
                .value_parser(clap::value_parser!(u32))
                .help("Run in server mode, waiting for CLIENTS load generators"),
        )
        .arg(
            Arg::new("client")
                .short('c')
                .long("client")
                .value_name("HOST")
                .value_parser(clap::value_parser!(Ipv4Addr))
                .conflicts_with("server")
                .help("Run as client, connect to HOST (ipv4 addr)"),
        )
        .arg(
            Arg::new("dummy")
                .short('x')
                .long("dummy")
                .value_name("HOST")
                .value_parser(clap::value_parser!(Ipv4Addr))
                .conflicts_with_all(["server", "client"])
                .help("Run as dummy client, connecting to HOST and exiting on test start"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_parser(clap::value_parser!(u16))
                .help("Port to listen on/connect to"),
        )
        .arg(
            Arg::new("file")
                .short('f')
                .long("file")
                .value_name("PATH")
                .help("Name of the per-packet logfile"),
        )
        .arg(
            Arg::new("time")
                .short('t')
                .long("time")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64))
                .help("Test duration in seconds"),
        )
        .arg(
            Arg::new("rate")
                .short('r')
                .long("rate")
                .num_args(2)
                .value_names(["DIST", "PARAMS"])
                .help("Inter-packet delay distribution [us]"),
        )
        .arg(
            Arg::new("data")
                .short('d')
                .long("data")
                .num_args(2)
                .value_names(["DIST", "PARAMS"])
                .help("Extra payload size distribution [bytes]"),
        )
        .arg(
            Arg::new("loop")
                .short('l')
                .long("loop")
                .action(ArgAction::SetTrue)
                .help("Loop the test until quit by Ctrl-C"),
        )
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_micros()
        .init();

    let matches = cli().get_matches();
    let cfg = SessionConfig::from_matches(&matches)?;

    match cfg.role {
        Role::Server => {
            let mut server = Server::bind(&cfg)?;
            eprintln!("> using {}", server.local_addr()?);
            server.run()
        }
        Role::Client | Role::Dummy => {
            eprintln!("> using {}", cfg.addr);
            Client::bind(&cfg)?.run()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn session(role: Role, addr: SocketAddrV4, logfile: &str) -> SessionConfig {
        SessionConfig {
            role,
            addr,
            clients: 1,
            duration: Duration::from_secs(1),
            delay_dist: None,
            size_dist: None,
            logfile: std::env::temp_dir().join(logfile),
            loop_forever: false,
            max_packets: MAX_PACKETS,
        }
    }

    #[test]
    fn cli_builds_a_client_config() {
        let matches = cli()
            .try_get_matches_from([
                "jana", "-c", "10.0.0.7", "-p", "3333", "-t", "5", "-r", "exp", "y=120", "-d",
                "uniform", "n=0,k=64", "-f", "out.csv",
            ])
            .unwrap();
        let cfg = SessionConfig::from_matches(&matches).unwrap();
        assert_eq!(cfg.role, Role::Client);
        assert_eq!(cfg.addr, "10.0.0.7:3333".parse().unwrap());
        assert_eq!(cfg.duration, Duration::from_secs(5));
        assert_eq!(cfg.delay_dist, Some(Distribution::Exponential { mean: 120.0 }));
        assert_eq!(
            cfg.size_dist,
            Some(Distribution::Uniform {
                scale: 0.0,
                offset: 64.0
            })
        );
        assert_eq!(cfg.logfile, PathBuf::from("out.csv"));
        assert!(!cfg.loop_forever);
    }

    #[test]
    fn cli_requires_a_role() {
        let matches = cli().try_get_matches_from(["jana", "-p", "3000"]).unwrap();
        assert!(SessionConfig::from_matches(&matches).is_err());
    }

    #[test]
    fn server_defaults_to_loop_mode() {
        let matches = cli().try_get_matches_from(["jana", "-s", "2"]).unwrap();
        let cfg = SessionConfig::from_matches(&matches).unwrap();
        assert_eq!(cfg.role, Role::Server);
        assert_eq!(cfg.clients, 2);
        assert_eq!(cfg.addr.port(), DEFAULT_PORT);
        assert!(cfg.loop_forever);
    }

    /// Full rendezvous and timed run over the loopback interface.
    #[test]
    fn loopback_session_counts_and_logs_packets() {
        let bind = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        let mut srv = Server::bind(&session(Role::Server, bind, "jana-loopback-srv.csv")).unwrap();
        let server_addr = srv.local_addr().unwrap();
        let server_thread =
            thread::spawn(move || srv.run_iteration().unwrap().expect("iteration aborted"));

        let mut client = Client::bind(&session(
            Role::Client,
            server_addr,
            "jana-loopback-client.csv",
        ))
        .unwrap();
        let report = client
            .run_iteration()
            .unwrap()
            .expect("client produced no report");
        let summary = server_thread.join().unwrap();

        assert!(report.packets_sent > 0);
        assert_eq!(summary.clients.len(), 1);
        assert_eq!(summary.clients[0].slot, 0);
        assert!(summary.clients[0].packets > 0);
        assert!(summary.clients[0].bytes >= summary.clients[0].packets * 4);

        // The log is strictly increasing and gap-free from 0, one row per
        // attempted send.
        let entries = client.log().entries();
        assert_eq!(entries.len() as u64, report.packets_sent);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.sequence as usize, i);
        }
    }

    /// A dummy client registers and vanishes at the go signal; the server
    /// must abort the iteration instead of running with a missing client.
    #[test]
    fn dummy_client_aborts_the_iteration() {
        let bind = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        let mut srv = Server::bind(&session(Role::Server, bind, "jana-dummy-srv.csv")).unwrap();
        let server_addr = srv.local_addr().unwrap();
        let server_thread = thread::spawn(move || srv.run_iteration().unwrap());

        let mut dummy =
            Client::bind(&session(Role::Dummy, server_addr, "jana-dummy-client.csv")).unwrap();
        assert!(dummy.run_iteration().unwrap().is_none());
        assert!(server_thread.join().unwrap().is_none());
    }
}
