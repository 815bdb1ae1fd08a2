//! Captive-portal DNS hijack server.
//!
//! A single-purpose UDP responder bound to port 53 on the soft-AP address.
//! Every query is answered authoritatively with that same address, which is
//! what makes phones and laptops open the configuration page. It is not a
//! DNS server: multi-question packets, non-A record types and recursion are
//! all unsupported, and anything oversized is silently dropped.
//!
//! The server runs on its own thread, started and stopped only by the
//! connection manager as a side effect of entering or leaving
//! access-point mode.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

/// Standard DNS port.
pub const DNS_PORT: u16 = 53;

/// Size of the fixed DNS header.
pub const DNS_HEADER_SIZE: usize = 12;

/// Largest query this responder accepts.
pub const DNS_QUERY_MAX_SIZE: usize = 80;

/// Size of the synthesized answer record: compression pointer (2) + type
/// (2) + class (2) + TTL (4) + RDLENGTH (2) + RDATA (4).
pub const DNS_ANSWER_RECORD_SIZE: usize = 16;

/// Largest response the responder will produce.
pub const DNS_ANSWER_MAX_SIZE: usize = DNS_QUERY_MAX_SIZE + DNS_ANSWER_RECORD_SIZE;

/// How often the receive loop wakes to check for shutdown.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Synthesize the hijacked response for one DNS query.
///
/// Returns `None` for anything that cannot be answered within the fixed
/// response bound: a truncated header, or a query so large that appending
/// the answer record would exceed [`DNS_ANSWER_MAX_SIZE`] (which covers
/// multi-question packets this responder does not support).
pub fn build_response(query: &[u8], answer_ip: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < DNS_HEADER_SIZE {
        return None;
    }
    if query.len() + DNS_ANSWER_RECORD_SIZE > DNS_ANSWER_MAX_SIZE {
        return None;
    }

    let mut response = Vec::with_capacity(query.len() + DNS_ANSWER_RECORD_SIZE);
    response.extend_from_slice(query);

    // Header flags, first byte: QR(1) opcode(4, echoed as "query") AA(1)
    // TC(1) RD(1). Response + authoritative, everything else cleared.
    response[2] = 0x80 | 0x04;
    // Second flags byte: RA(1) Z(3) RCODE(4). No recursion, no error.
    response[3] = 0x00;
    // ANCount = QDCount; NSCount and ARCount zeroed.
    response[6] = response[4];
    response[7] = response[5];
    response[8] = 0;
    response[9] = 0;
    response[10] = 0;
    response[11] = 0;

    // Answer record appended after the question, all fields big-endian.
    // NAME: compression pointer to the question at offset 12 (0xC0 marks
    // the two high bits that tag a pointer).
    response.extend_from_slice(&0xC00Cu16.to_be_bytes());
    // TYPE: A.
    response.extend_from_slice(&1u16.to_be_bytes());
    // CLASS: IN.
    response.extend_from_slice(&1u16.to_be_bytes());
    // TTL 0: never cache. The mapping is a lie outside the portal's
    // lifetime, so a cached answer would poison the client.
    response.extend_from_slice(&0u32.to_be_bytes());
    // RDLENGTH: one IPv4 address.
    response.extend_from_slice(&4u16.to_be_bytes());
    response.extend_from_slice(&answer_ip.octets());

    Some(response)
}

/// Render the query's first name for logging: length/label bytes outside
/// the printable range become dots.
fn printable_name(query: &[u8]) -> String {
    if query.len() <= DNS_HEADER_SIZE + 1 {
        return String::new();
    }
    query[DNS_HEADER_SIZE + 1..]
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| if (b' '..=b'z').contains(&b) { b as char } else { '.' })
        .collect()
}

/// Handle to the running hijack server. Dropping it stops the thread.
pub struct DnsServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DnsServer {
    /// Bind the standard port on the soft-AP address and start serving.
    ///
    /// A bind failure is fatal to the hijack only: the caller logs it and
    /// the portal degrades to "no redirect" rather than crashing.
    pub fn start(ap_ip: Ipv4Addr) -> io::Result<Self> {
        Self::bind(SocketAddrV4::new(ap_ip, DNS_PORT), ap_ip)
    }

    /// Bind an explicit address. Exists so tests can use an ephemeral port.
    pub fn bind(bind_addr: SocketAddrV4, answer_ip: Ipv4Addr) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;

        info!("DNS hijack server listening on {}/udp", local_addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();
        let handle = thread::Builder::new()
            .name("dns_server".to_string())
            .spawn(move || serve(socket, answer_ip, shutdown_flag))?;

        Ok(Self {
            local_addr,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Address the server actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the server and join its thread.
    ///
    /// May take up to one poll interval to take effect.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            info!("DNS hijack server stopped");
        }
    }
}

impl Drop for DnsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(socket: UdpSocket, answer_ip: Ipv4Addr, shutdown: Arc<AtomicBool>) {
    // Oversized datagrams must be detected, not truncated, so the receive
    // buffer is one byte larger than the largest acceptable query.
    let mut buf = [0u8; DNS_QUERY_MAX_SIZE + 1];

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let (len, client) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                error!("DNS socket receive failed: {}", e);
                break;
            }
        };

        let response = match build_response(&buf[..len], answer_ip) {
            Some(response) => response,
            None => {
                debug!("dropping unanswerable {}-byte DNS datagram from {}", len, client);
                continue;
            }
        };

        debug!(
            "replying to DNS request for {} from {}",
            printable_name(&buf[..len]),
            client
        );

        // Best-effort responder: a failed send is logged, never retried.
        if let Err(e) = socket.send_to(&response, client) {
            warn!("DNS sendto {} failed: {}", client, e);
        }
    }
}
