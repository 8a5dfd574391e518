use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::{Error, Prober, Resolver};

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Echo requests over unprivileged datagram ICMP sockets.
///
/// Every ping opens its own socket.  The kernel assigns the echo
/// identifier per socket and only delivers matching replies to it, so
/// concurrent tasks never see each other's packets.  On Linux the caller's
/// group must be within `net.ipv4.ping_group_range`.
pub struct IcmpProber {
    resolver: Resolver,
    ttl: u32,
}

impl IcmpProber {
    pub fn new(resolver: Resolver, ttl: u32) -> Self {
        Self { resolver, ttl }
    }

    fn socket(&self, target: IpAddr) -> Result<UdpSocket, Error> {
        let socket = match target {
            IpAddr::V4(_) => {
                let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))?;
                socket.set_ttl(self.ttl)?;
                socket
            }
            IpAddr::V6(_) => {
                let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::ICMPV6))?;
                socket.set_unicast_hops_v6(self.ttl)?;
                socket
            }
        };
        socket.set_nonblocking(true)?;

        Ok(UdpSocket::from_std(socket.into())?)
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn resolve(&self, address: &str) -> Result<IpAddr, Error> {
        self.resolver.lookup(address).await
    }

    async fn ping(
        &self,
        target: IpAddr,
        seq: u16,
        timeout: Duration,
    ) -> Result<Option<Duration>, Error> {
        let socket = self.socket(target)?;
        let req = echo_request(target, seq);

        let start = Instant::now();
        socket.send_to(&req, SocketAddr::new(target, 0)).await?;

        let wait_reply = async {
            let mut buf = [0u8; 1024];
            loop {
                let (size, peer) = socket.recv_from(&mut buf).await?;
                if is_reply(target, seq, &buf[..size]) {
                    return Ok::<_, Error>(start.elapsed());
                }

                debug!("Ignore unexpected ICMP packet from {}", peer);
            }
        };

        match tokio::time::timeout(timeout, wait_reply).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}

fn echo_request(target: IpAddr, seq: u16) -> [u8; 16] {
    #[rustfmt::skip]
    let mut req = [
        // icmp type
        ICMP_ECHO_REQUEST,
        // icmp code
        0x00,
        // checksum
        0x00, 0x00,

        // identifier, rewritten by the kernel
        0x00, 0x00,
        // sequence
        0x00, 0x00,

        // payload
        b'g', b'o', b's', b's', b'i', b'p', b'i', b'n',
    ];
    req[6..8].copy_from_slice(&seq.to_be_bytes());

    match target {
        IpAddr::V4(_) => {
            let checksum = checksum(&req);
            req[2..4].copy_from_slice(&checksum.to_be_bytes());
        }
        // the kernel computes ICMPv6 checksums, they cover the IPv6 pseudo header
        IpAddr::V6(_) => req[0] = ICMPV6_ECHO_REQUEST,
    }

    req
}

fn is_reply(target: IpAddr, seq: u16, packet: &[u8]) -> bool {
    if packet.len() < 8 {
        return false;
    }

    let expected = match target {
        IpAddr::V4(_) => ICMP_ECHO_REPLY,
        IpAddr::V6(_) => ICMPV6_ECHO_REPLY,
    };

    packet[0] == expected && packet[6..8] == seq.to_be_bytes()
}

/// RFC 1071 internet checksum.
fn checksum(buf: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in buf.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += u32::from(word);
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_verifies() {
        let req = echo_request("10.0.0.1".parse().unwrap(), 42);
        // summing a packet including its checksum yields zero
        assert_eq!(checksum(&req), 0);
    }

    #[test]
    fn rfc1071_example() {
        let input = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&input), !0xddf2);
    }

    #[test]
    fn v6_request_type() {
        let req = echo_request("::1".parse().unwrap(), 7);
        assert_eq!(req[0], ICMPV6_ECHO_REQUEST);
        assert_eq!(&req[2..4], &[0, 0]);
        assert_eq!(&req[6..8], &7u16.to_be_bytes());
    }

    #[test]
    fn reply_matching() {
        let target = "10.0.0.1".parse().unwrap();
        let mut reply = echo_request(target, 9);
        reply[0] = ICMP_ECHO_REPLY;

        assert!(is_reply(target, 9, &reply));
        assert!(!is_reply(target, 10, &reply));
        assert!(!is_reply(target, 9, &reply[..4]));
        assert!(!is_reply("::1".parse().unwrap(), 9, &reply));
    }
}
