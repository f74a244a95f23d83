//! Peer network addresses (spec.md §3/§4.6's `version`/`addr` payloads).

use bitmessage_core::codec::{WireReader, write_varint};
use bitmessage_core::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Placeholder IP for a node that has not yet resolved a reachable address
/// (e.g. our own `version` sender field before a peer tells us how they see
/// us). An `addr` entry carrying this is not a real peer and must not be
/// registered.
pub const UNROUTABLE: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// A peer address as carried inside `version` and `addr` messages: the
/// stream it serves, the services it advertises, and where to reach it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    pub stream: u32,
    pub services: u64,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(stream: u32, services: u64, ip: IpAddr, port: u16) -> Self {
        Self { stream, services, ip, port }
    }

    /// `stream(varint) || services(8) || ip(16, v4-mapped-v6) || port(2 BE)`.
    pub fn write(&self, out: &mut Vec<u8>) {
        write_varint(out, self.stream as u64);
        out.extend_from_slice(&self.services.to_be_bytes());
        out.extend_from_slice(&ip_to_v6_bytes(self.ip));
        out.extend_from_slice(&self.port.to_be_bytes());
    }

    pub fn read(r: &mut WireReader<'_>) -> Result<Self> {
        let stream = r.read_varint()? as u32;
        let services = r.read_u64()?;
        let ip_bytes: [u8; 16] = r
            .read_bytes(16)?
            .try_into()
            .map_err(|_| Error::MalformedWire("bad network address ip".into()))?;
        let port = r.read_u16()?;
        Ok(Self {
            stream,
            services,
            ip: v6_bytes_to_ip(ip_bytes),
            port,
        })
    }
}

fn ip_to_v6_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V6(v6) => v6.octets(),
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
    }
}

fn v6_bytes_to_ip(bytes: [u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(bytes);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

/// A peer address known to the node registry, with the last time it was
/// seen advertised or connected to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KnownNode {
    pub address: NetworkAddress,
    pub last_seen: i64,
}

impl KnownNode {
    pub fn new(address: NetworkAddress, last_seen: i64) -> Self {
        Self { address, last_seen }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_address_roundtrip_v4() {
        let addr = NetworkAddress::new(1, 1, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 8444);
        let mut buf = Vec::new();
        addr.write(&mut buf);
        let mut r = WireReader::new(&buf);
        assert_eq!(NetworkAddress::read(&mut r).unwrap(), addr);
    }

    #[test]
    fn network_address_roundtrip_v6() {
        let addr = NetworkAddress::new(1, 1, IpAddr::V6(Ipv6Addr::LOCALHOST), 8444);
        let mut buf = Vec::new();
        addr.write(&mut buf);
        let mut r = WireReader::new(&buf);
        assert_eq!(NetworkAddress::read(&mut r).unwrap(), addr);
    }
}
