//! Non-object wire messages carried over [`crate::framing::Frame`]:
//! `version`, `verack`, `addr`, `inv`, `getdata` (spec.md §4.6).

use crate::peer::NetworkAddress;
use bitmessage_core::codec::{write_var_int_list, write_varint, write_varstring, WireReader};
use bitmessage_core::error::{Error, Result};
use bitmessage_core::object::InventoryVector;

/// Bitmessage protocol version this node speaks. Peers below this are
/// rejected during handshake.
pub const PROTOCOL_VERSION: u32 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionMessage {
    pub protocol: u32,
    pub services: u64,
    pub timestamp: i64,
    pub recipient: NetworkAddress,
    pub sender: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub streams: Vec<u64>,
}

impl VersionMessage {
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.protocol.to_be_bytes());
        out.extend_from_slice(&self.services.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        self.recipient.write(&mut out);
        self.sender.write(&mut out);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        write_varstring(&mut out, &self.user_agent);
        write_var_int_list(&mut out, &self.streams);
        out
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf);
        let protocol = r.read_u32()?;
        let services = r.read_u64()?;
        let timestamp = r.read_i64()?;
        let recipient = NetworkAddress::read(&mut r)?;
        let sender = NetworkAddress::read(&mut r)?;
        let nonce = r.read_u64()?;
        let user_agent = r.read_varstring()?;
        let streams = r.read_var_int_list()?;

        Ok(Self {
            protocol,
            services,
            timestamp,
            recipient,
            sender,
            nonce,
            user_agent,
            streams,
        })
    }
}

/// `addr`: up to 1000 known peers from shared streams.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct AddrMessage {
    pub addresses: Vec<NetworkAddress>,
}

impl AddrMessage {
    pub const MAX_ADDRESSES: usize = 1000;

    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(&mut out, self.addresses.len() as u64);
        for address in &self.addresses {
            address.write(&mut out);
        }
        out
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf);
        let count = r.read_varint_usize()?;
        let mut addresses = Vec::with_capacity(count.min(Self::MAX_ADDRESSES));
        for _ in 0..count {
            addresses.push(NetworkAddress::read(&mut r)?);
        }
        Ok(Self { addresses })
    }
}

/// A bare list of [`InventoryVector`]s, the shared shape of `inv` and
/// `getdata`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct InventoryVectorList {
    pub ivs: Vec<InventoryVector>,
}

impl InventoryVectorList {
    pub fn new(ivs: Vec<InventoryVector>) -> Self {
        Self { ivs }
    }

    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(&mut out, self.ivs.len() as u64);
        for iv in &self.ivs {
            out.extend_from_slice(iv);
        }
        out
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf);
        let count = r.read_varint_usize()?;
        let mut ivs = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            let bytes = r.read_bytes(32)?;
            let iv: InventoryVector = bytes
                .try_into()
                .map_err(|_| Error::MalformedWire("bad inventory vector".into()))?;
            ivs.push(iv);
        }
        Ok(Self { ivs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_address() -> NetworkAddress {
        NetworkAddress::new(1, 1, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 8444)
    }

    #[test]
    fn version_message_roundtrip() {
        let msg = VersionMessage {
            protocol: PROTOCOL_VERSION,
            services: 1,
            timestamp: 1_700_000_000,
            recipient: sample_address(),
            sender: sample_address(),
            nonce: 0xDEAD_BEEF_CAFE_F00D,
            user_agent: "/bitmessage-rs:0.1/".into(),
            streams: vec![1],
        };
        let bytes = msg.write();
        assert_eq!(VersionMessage::read(&bytes).unwrap(), msg);
    }

    #[test]
    fn addr_message_roundtrip() {
        let msg = AddrMessage {
            addresses: vec![sample_address(), sample_address()],
        };
        let bytes = msg.write();
        assert_eq!(AddrMessage::read(&bytes).unwrap(), msg);
    }

    #[test]
    fn inventory_vector_list_roundtrip() {
        let list = InventoryVectorList::new(vec![[1u8; 32], [2u8; 32]]);
        let bytes = list.write();
        assert_eq!(InventoryVectorList::read(&bytes).unwrap(), list);
    }
}
