use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::unix::net::UnixDatagram;
use std::time::{Duration, Instant};

pub const UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically pushes the relay's traffic total to the manager socket as a
/// `stat: {"<port>":<tx+rx>}` datagram. The manager address is either a UDP
/// `ip:port` or a UNIX socket path.
pub struct StatReporter {
    manager: String,
    port: u16,
    last: Instant,
}

impl StatReporter {
    pub fn new(manager: String, port: u16) -> StatReporter {
        StatReporter {
            manager,
            port,
            last: Instant::now(),
        }
    }

    /// Sends a report once the interval has elapsed; returns whether one was
    /// sent.
    pub fn tick(&mut self, traffic: u64) -> io::Result<bool> {
        if self.last.elapsed() < UPDATE_INTERVAL {
            return Ok(false);
        }
        self.last = Instant::now();

        let payload = format_report(self.port, traffic);
        match self.manager.parse::<SocketAddr>() {
            Ok(addr) => {
                let bind = if addr.is_ipv4() {
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
                } else {
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
                };
                let socket = UdpSocket::bind(bind)?;
                socket.send_to(payload.as_bytes(), addr)?;
            }
            Err(_) => {
                let socket = UnixDatagram::unbound()?;
                socket.send_to(payload.as_bytes(), &self.manager)?;
            }
        }

        Ok(true)
    }
}

fn format_report(port: u16, traffic: u64) -> String {
    format!("stat: {{\"{}\":{}}}", port, traffic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_format() {
        assert_eq!(format_report(8388, 12345), "stat: {\"8388\":12345}");
        assert_eq!(format_report(80, 0), "stat: {\"80\":0}");
    }

    #[test]
    fn test_first_tick_waits_for_interval() {
        let mut reporter = StatReporter::new("/tmp/never-used.sock".to_owned(), 8388);
        assert!(!reporter.tick(1).unwrap());
    }
}
