use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    sync::Arc,
    time::Duration,
};

use crossbeam::atomic::AtomicCell;
use log::{debug, info};

use crate::proto::{Server, SLIM_PORT};

const DISCOVERY_PORT: u16 = 3483;
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Request the server version, control port and CLI port. Each requested
/// tag is NUL-terminated; replies come back as tag + 1-byte length + value.
const DISCOVERY_REQUEST: &[u8] = b"eVERS\0JSON\0CLIP";

/// Broadcast for a server until one answers or `running` is cleared.
/// A configured address narrows the probe to that host.
pub fn discover(
    addr: Option<Ipv4Addr>,
    running: &Arc<AtomicCell<bool>>,
) -> std::io::Result<Option<Server>> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    sock.set_broadcast(true)?;
    sock.set_read_timeout(Some(DISCOVERY_TIMEOUT))?;

    let target = SocketAddrV4::new(addr.unwrap_or(Ipv4Addr::BROADCAST), DISCOVERY_PORT);

    while running.load() {
        debug!("Sending discovery request to {}", target);
        sock.send_to(DISCOVERY_REQUEST, target)?;

        let mut reply = [0u8; 512];
        match sock.recv_from(&mut reply) {
            Ok((len, SocketAddr::V4(source))) => {
                let server = parse_reply(&reply[..len], *source.ip());
                info!(
                    "Found server {} (version {}) at {}:{}",
                    source.ip(),
                    server.version.as_deref().unwrap_or("unknown"),
                    server.ip,
                    server.port
                );
                return Ok(Some(server));
            }
            Ok(_) => continue,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(None)
}

/// Walk the tag/length/value sections of a discovery reply.
fn parse_reply(reply: &[u8], source: Ipv4Addr) -> Server {
    let mut server = Server::new(source, SLIM_PORT);

    // Some firmware-era replies lead with a bare 'E'
    let mut at = if reply.first() == Some(&b'E') { 1 } else { 0 };

    while at + 5 <= reply.len() {
        let tag = &reply[at..at + 4];
        let len = reply[at + 4] as usize;
        let start = at + 5;
        if start + len > reply.len() {
            break;
        }
        let value = String::from_utf8_lossy(&reply[start..start + len]);
        match tag {
            b"VERS" => server.version = Some(value.into_owned()),
            b"JSON" => {
                if let Ok(port) = value.parse() {
                    server.port = port;
                }
            }
            b"CLIP" => {
                if let Ok(port) = value.parse() {
                    server.cli_port = port;
                }
            }
            _ => {}
        }
        at = start + len;
    }

    server
}
