mod config;
mod stats;

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::Parser;
use mantle::acl::{Acl, AclMode};
use mantle::crypto::CipherSuite;
use mantle::logging;
use mantle::relay::{Relay, RelayConfig};
use mantle::resolver::Resolver;
use mantle::SetupError;

use crate::config::FileConfig;
use crate::stats::StatReporter;

const DEFAULT_METHOD: &str = "table";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DNS_PORT: u16 = 53;

#[derive(Debug, Parser)]
#[command(name = "mantled", version, about = "Encrypted TCP relay server")]
struct Args {
    /// Listen address, repeatable.
    #[arg(short = 's', value_name = "HOST")]
    server: Vec<String>,

    /// Listen port.
    #[arg(short = 'p', value_name = "PORT")]
    port: Option<u16>,

    /// Shared password.
    #[arg(short = 'k', value_name = "PASSWORD")]
    password: Option<String>,

    /// Cipher method.
    #[arg(short = 'm', value_name = "METHOD")]
    method: Option<String>,

    /// Idle timeout in seconds.
    #[arg(short = 't', value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Configuration file.
    #[arg(short = 'c', value_name = "PATH")]
    config: Option<PathBuf>,

    /// Outbound interface for target connections.
    #[arg(short = 'i', value_name = "IFACE")]
    interface: Option<String>,

    /// Nameserver for target resolution, repeatable.
    #[arg(short = 'd', value_name = "ADDR")]
    nameserver: Vec<String>,

    /// Also relay UDP (not built; ignored with a warning).
    #[arg(short = 'u')]
    with_udp: bool,

    /// UDP-only mode (not built; refuses to start).
    #[arg(short = 'U')]
    udp_only: bool,

    /// Require one-time authentication on every connection.
    #[arg(short = 'A')]
    auth: bool,

    /// Verbose logging.
    #[arg(short = 'v')]
    verbose: bool,

    /// Run as this user after binding.
    #[arg(short = 'a', value_name = "USER")]
    user: Option<String>,

    /// Daemonize and write the PID here.
    #[arg(short = 'f', value_name = "PIDFILE")]
    pid_file: Option<PathBuf>,

    /// Treat the ACL as a white list.
    #[arg(short = 'w')]
    white_list: bool,

    /// Enable TCP Fast Open on listeners and target connects.
    #[arg(long)]
    fast_open: bool,

    /// Access-control list file.
    #[arg(long, value_name = "PATH")]
    acl: Option<PathBuf>,

    /// Manager address (ip:port or socket path) for periodic traffic stats.
    #[arg(long, value_name = "ADDR")]
    manager_address: Option<String>,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), SetupError> {
    if args.udp_only {
        return Err(SetupError::UdpOnly);
    }

    let file = match &args.config {
        Some(path) => config::load(path)?,
        None => FileConfig::default(),
    };

    let password = args
        .password
        .clone()
        .or_else(|| file.password.clone())
        .ok_or(SetupError::MissingPassword)?;
    let port = args.port.or(file.server_port).ok_or(SetupError::MissingPort)?;
    let method = args
        .method
        .clone()
        .or_else(|| file.method.clone())
        .unwrap_or_else(|| DEFAULT_METHOD.to_owned());
    let timeout = args.timeout.or(file.timeout).unwrap_or(DEFAULT_TIMEOUT_SECS);
    let force_auth = args.auth || file.auth.unwrap_or(false);
    let fast_open = args.fast_open || file.fast_open.unwrap_or(false);

    let mut hosts: Vec<String> = if !args.server.is_empty() {
        args.server.clone()
    } else {
        file.server.map(|hosts| hosts.into_vec()).unwrap_or_default()
    };
    if hosts.is_empty() {
        // wildcard dual-stack, the way an unspecified bind behaves
        hosts.push("::".to_owned());
    }
    let listen = listen_addrs(&hosts, port)?;
    let nameservers = nameserver_addrs(&args.nameserver, file.nameserver.as_deref())?;

    // fork before any descriptor or thread exists
    if let Some(pid_path) = &args.pid_file {
        daemonize(pid_path)?;
    }

    let log = logging::init(args.verbose);

    if args.with_udp {
        logging::warn!(log, "UDP relay is not built in, continuing with TCP only");
    }
    if force_auth {
        logging::info!(log, "one-time authentication enabled");
    }
    if fast_open {
        logging::info!(log, "using tcp fast open");
    }

    logging::info!(log, "initializing cipher"; "method" => %method);
    let suite = CipherSuite::new(&method, &password)?;

    let acl = match &args.acl {
        Some(path) => {
            let mode = if args.white_list {
                AclMode::WhiteList
            } else {
                AclMode::BlackList
            };
            Some(Acl::load(path, mode)?)
        }
        None => None,
    };

    let cfg = RelayConfig {
        listen,
        timeout: Duration::from_secs(timeout),
        fast_open,
        force_auth,
        iface: args.interface.clone(),
        nameservers,
    };
    let mut relay = Relay::bind(cfg, suite, acl, log.clone())?;

    if let Some(user) = &args.user {
        drop_privileges(user, &log);
    }

    let handle = relay.shutdown_handle();
    ctrlc::set_handler(move || handle.trigger())
        .map_err(|e| SetupError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

    let mut reporter = args
        .manager_address
        .clone()
        .map(|addr| StatReporter::new(addr, port));

    while relay.poll_once(Duration::from_secs(1))? {
        if let Some(reporter) = &mut reporter {
            let (tx, rx) = relay.traffic();
            if let Err(e) = reporter.tick(tx + rx) {
                logging::warn!(log, "stat report failed"; "error" => %e);
            }
        }
    }

    relay.finish();
    Ok(())
}

fn listen_addrs(hosts: &[String], port: u16) -> Result<Vec<SocketAddr>, SetupError> {
    let mut out = Vec::with_capacity(hosts.len());
    for host in hosts {
        match host.parse::<IpAddr>() {
            Ok(ip) => out.push(SocketAddr::new(ip, port)),
            Err(_) => {
                let addr = (host.as_str(), port)
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.next())
                    .ok_or_else(|| SetupError::BadAddress(host.clone()))?;
                out.push(addr);
            }
        }
    }
    Ok(out)
}

fn nameserver_addrs(
    flags: &[String],
    from_file: Option<&str>,
) -> Result<Vec<SocketAddr>, SetupError> {
    let requested: Vec<&str> = if !flags.is_empty() {
        flags.iter().map(String::as_str).collect()
    } else {
        from_file.into_iter().collect()
    };

    let mut out = Vec::with_capacity(requested.len());
    for entry in requested {
        let addr = entry
            .parse::<SocketAddr>()
            .or_else(|_| entry.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, DNS_PORT)))
            .map_err(|_| SetupError::BadAddress(entry.to_owned()))?;
        out.push(addr);
    }

    if out.is_empty() {
        out = Resolver::system_nameservers();
    }
    Ok(out)
}

fn daemonize(pid_path: &Path) -> Result<(), SetupError> {
    match fork::daemon(false, false) {
        Ok(fork::Fork::Child) => {
            std::fs::write(pid_path, format!("{}\n", process::id()))?;
            Ok(())
        }
        Ok(fork::Fork::Parent(_)) => process::exit(0),
        Err(_) => Err(SetupError::Io(io::Error::new(
            io::ErrorKind::Other,
            "daemonization failed",
        ))),
    }
}

fn drop_privileges(user: &str, log: &logging::Logger) {
    use std::ffi::CString;

    let name = match CString::new(user) {
        Ok(name) => name,
        Err(_) => {
            logging::error!(log, "invalid user name"; "user" => user);
            return;
        }
    };

    unsafe {
        let pw = libc::getpwnam(name.as_ptr());
        if pw.is_null() {
            logging::error!(log, "unknown user"; "user" => user);
            return;
        }
        if libc::setgid((*pw).pw_gid) != 0 || libc::setuid((*pw).pw_uid) != 0 {
            logging::error!(log, "failed to drop privileges"; "user" => user);
        } else {
            logging::info!(log, "running as user"; "user" => user);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_addrs_parses_ips_and_fills_port() {
        let hosts = vec!["127.0.0.1".to_owned(), "::".to_owned()];
        let addrs = listen_addrs(&hosts, 8388).unwrap();
        assert_eq!(addrs[0], "127.0.0.1:8388".parse().unwrap());
        assert_eq!(addrs[1], "[::]:8388".parse().unwrap());
    }

    #[test]
    fn test_nameserver_addrs_accepts_ip_and_ip_port() {
        let flags = vec!["8.8.8.8".to_owned(), "1.1.1.1:5353".to_owned()];
        let addrs = nameserver_addrs(&flags, None).unwrap();
        assert_eq!(addrs[0], "8.8.8.8:53".parse().unwrap());
        assert_eq!(addrs[1], "1.1.1.1:5353".parse().unwrap());
    }

    #[test]
    fn test_nameserver_addrs_rejects_garbage() {
        let flags = vec!["not-an-address".to_owned()];
        assert!(matches!(
            nameserver_addrs(&flags, None),
            Err(SetupError::BadAddress(_))
        ));
    }

    #[test]
    fn test_cli_short_flags() {
        let args = Args::parse_from([
            "mantled", "-s", "0.0.0.0", "-p", "8388", "-k", "secret", "-m", "aes-256-cfb",
            "-t", "120", "-A", "-v",
        ]);
        assert_eq!(args.server, vec!["0.0.0.0"]);
        assert_eq!(args.port, Some(8388));
        assert_eq!(args.password.as_deref(), Some("secret"));
        assert_eq!(args.method.as_deref(), Some("aes-256-cfb"));
        assert_eq!(args.timeout, Some(120));
        assert!(args.auth);
        assert!(args.verbose);
        assert!(!args.fast_open);
    }
}
