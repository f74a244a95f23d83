//! Object model: typed payloads, signing preimages, and encryption
//! envelopes (spec.md §4.4).
//!
//! An [`ObjectMessage`] is the network-flooded unit: a nonce, an expiry, a
//! type/version/stream header, and a type-specific payload. The payload
//! itself is modeled as a tagged union ([`Payload`]) discriminated by
//! `(object_type, version)`, with encrypted and decrypted states kept as
//! distinct types per spec.md §9 rather than a single type with a nullable
//! "decrypted" field.

use crate::address::Address;
use crate::codec::{write_varint, write_varstring, WireReader};
use crate::crypto::{double_sha512, sha512, CryptoBox, SignatureDigest};
use crate::error::{Error, Result};
use secp256k1::{PublicKey, Secp256k1, SecretKey};

/// Numeric object type codes (spec.md §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    GetPubkey,
    Pubkey,
    Msg,
    Broadcast,
    /// Preserved opaquely for gossip relay; never delivered to a listener.
    Unknown(u32),
}

impl ObjectType {
    pub fn code(self) -> u32 {
        match self {
            ObjectType::GetPubkey => 0,
            ObjectType::Pubkey => 1,
            ObjectType::Msg => 2,
            ObjectType::Broadcast => 3,
            ObjectType::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => ObjectType::GetPubkey,
            1 => ObjectType::Pubkey,
            2 => ObjectType::Msg,
            3 => ObjectType::Broadcast,
            other => ObjectType::Unknown(other),
        }
    }
}

/// The network-flooded object envelope. `payload` holds the type-specific
/// body, opaque at this layer; call [`ObjectMessage::decode_payload`] to
/// interpret it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMessage {
    pub nonce: [u8; 8],
    pub expires_time: i64,
    pub object_type: ObjectType,
    pub version: u64,
    pub stream: u64,
    pub payload: Vec<u8>,
}

/// 32-byte object identifier, stable across serialize/parse round-trips.
pub type InventoryVector = [u8; 32];

impl ObjectMessage {
    /// `expiresTime || objectType || version || stream || payload`, the
    /// bytes hashed to form the PoW's `initialHash` (everything the object
    /// carries except the still-unknown nonce).
    pub fn bytes_without_nonce(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 4 + 10 + self.payload.len());
        out.extend_from_slice(&self.expires_time.to_be_bytes());
        out.extend_from_slice(&self.object_type.code().to_be_bytes());
        write_varint(&mut out, self.version);
        write_varint(&mut out, self.stream);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Full wire encoding: `nonce || bytes_without_nonce()`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.payload.len() + 22);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.bytes_without_nonce());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf);
        let nonce: [u8; 8] = r
            .read_bytes(8)?
            .try_into()
            .map_err(|_| Error::MalformedWire("bad nonce".into()))?;
        let expires_time = r.read_i64()?;
        let object_type = ObjectType::from_code(r.read_u32()?);
        let version = r.read_varint()?;
        let stream = r.read_varint()?;
        let payload = r.read_bytes(r.remaining())?.to_vec();

        Ok(Self {
            nonce,
            expires_time,
            object_type,
            version,
            stream,
            payload,
        })
    }

    /// `SHA-512(payload-without-nonce)`, the PoW search's `initialHash`.
    pub fn pow_initial_hash(&self) -> [u8; 64] {
        sha512(&self.bytes_without_nonce())
    }

    /// First 32 bytes of `double_sha512` of the full object bytes. Stable
    /// across serialize/parse round-trips and unique per in-flight object.
    pub fn inventory_vector(&self) -> InventoryVector {
        let mac = double_sha512(&self.to_bytes());
        let mut iv = [0u8; 32];
        iv.copy_from_slice(&mac[0..32]);
        iv
    }

    /// Parse `self.payload` into a typed [`Payload`] given this object's
    /// declared type and version. Returns `Err` for a malformed payload;
    /// unknown object types are never interpreted.
    pub fn decode_payload(&self) -> Result<Payload> {
        let mut r = WireReader::new(&self.payload);
        match (self.object_type, self.version) {
            (ObjectType::GetPubkey, v) if v < 4 => {
                let ripe = r.read_bytes(20)?.try_into().unwrap();
                Ok(Payload::GetPubkeyRipe(ripe))
            }
            (ObjectType::GetPubkey, _) => {
                let tag = r.read_bytes(32)?.try_into().unwrap();
                Ok(Payload::GetPubkeyTag(tag))
            }
            (ObjectType::Pubkey, 2) => Ok(Payload::PubkeyV2(PubkeyV3Body::read(&mut r, false)?.into())),
            (ObjectType::Pubkey, 3) => Ok(Payload::PubkeyV3(PubkeyV3Body::read(&mut r, true)?)),
            (ObjectType::Pubkey, _) => {
                let tag: [u8; 32] = r.read_bytes(32)?.try_into().unwrap();
                let box_ = CryptoBox::from_bytes(r.read_bytes(r.remaining())?)?;
                Ok(Payload::PubkeyV4(EncryptedPubkeyV4 { tag, box_ }))
            }
            (ObjectType::Msg, _) => {
                let box_ = CryptoBox::from_bytes(r.read_bytes(r.remaining())?)?;
                Ok(Payload::Msg(EncryptedMsg { box_ }))
            }
            (ObjectType::Broadcast, v) if v < 5 => {
                let box_ = CryptoBox::from_bytes(r.read_bytes(r.remaining())?)?;
                Ok(Payload::BroadcastV4(EncryptedBroadcastV4 { box_ }))
            }
            (ObjectType::Broadcast, _) => {
                let tag: [u8; 32] = r.read_bytes(32)?.try_into().unwrap();
                let box_ = CryptoBox::from_bytes(r.read_bytes(r.remaining())?)?;
                Ok(Payload::BroadcastV5(EncryptedBroadcastV5 { tag, box_ }))
            }
            (ObjectType::Unknown(code), _) => Ok(Payload::Opaque(code, self.payload.clone())),
        }
    }
}

/// A typed, parsed object payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    GetPubkeyRipe([u8; 20]),
    GetPubkeyTag([u8; 32]),
    PubkeyV2(PubkeyV2Body),
    PubkeyV3(PubkeyV3Body),
    PubkeyV4(EncryptedPubkeyV4),
    Msg(EncryptedMsg),
    BroadcastV4(EncryptedBroadcastV4),
    BroadcastV5(EncryptedBroadcastV5),
    Opaque(u32, Vec<u8>),
}

/// v2 pubkey fields: a behavior bitfield plus signing and encryption public
/// keys. Unlike v3+, v2 pubkeys are never signed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubkeyV2Body {
    pub behavior_bitfield: u32,
    pub signing_pubkey: PublicKey,
    pub encryption_pubkey: PublicKey,
}

impl From<PubkeyV3Body> for PubkeyV2Body {
    fn from(v3: PubkeyV3Body) -> Self {
        Self {
            behavior_bitfield: v3.behavior_bitfield,
            signing_pubkey: v3.signing_pubkey,
            encryption_pubkey: v3.encryption_pubkey,
        }
    }
}

/// v3 pubkey fields: v2 fields plus PoW parameters and a signature. This is
/// also the decrypted form of a v4 pubkey's [`CryptoBox`] envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubkeyV3Body {
    pub behavior_bitfield: u32,
    pub signing_pubkey: PublicKey,
    pub encryption_pubkey: PublicKey,
    pub nonce_trials_per_byte: u64,
    pub extra_bytes: u64,
    pub signature: Vec<u8>,
}

/// Secp256k1 public keys are serialized uncompressed (65 bytes: `0x04 || X
/// || Y`) on the wire, minus the leading `0x04` tag, per the Bitmessage
/// convention of storing bare 64-byte signing/encryption keys.
fn read_raw_pubkey(r: &mut WireReader<'_>) -> Result<PublicKey> {
    let raw = r.read_bytes(64)?;
    let mut uncompressed = [0u8; 65];
    uncompressed[0] = 0x04;
    uncompressed[1..].copy_from_slice(raw);
    PublicKey::from_slice(&uncompressed).map_err(|_| Error::InvalidKey("bad curve point".into()))
}

fn write_raw_pubkey(out: &mut Vec<u8>, pubkey: &PublicKey) {
    out.extend_from_slice(&pubkey.serialize_uncompressed()[1..]);
}

impl PubkeyV3Body {
    fn read(r: &mut WireReader<'_>, has_pow_and_sig: bool) -> Result<Self> {
        let behavior_bitfield = r.read_u32()?;
        let signing_pubkey = read_raw_pubkey(r)?;
        let encryption_pubkey = read_raw_pubkey(r)?;

        if !has_pow_and_sig {
            return Ok(Self {
                behavior_bitfield,
                signing_pubkey,
                encryption_pubkey,
                nonce_trials_per_byte: 0,
                extra_bytes: 0,
                signature: Vec::new(),
            });
        }

        let nonce_trials_per_byte = r.read_varint()?;
        let extra_bytes = r.read_varint()?;
        let signature = r.read_varbytes_owned()?;

        Ok(Self {
            behavior_bitfield,
            signing_pubkey,
            encryption_pubkey,
            nonce_trials_per_byte,
            extra_bytes,
            signature,
        })
    }

    /// Body bytes excluding the signature field, used as the signing
    /// preimage's payload-specific portion.
    fn write_unsigned(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.behavior_bitfield.to_be_bytes());
        write_raw_pubkey(out, &self.signing_pubkey);
        write_raw_pubkey(out, &self.encryption_pubkey);
        write_varint(out, self.nonce_trials_per_byte);
        write_varint(out, self.extra_bytes);
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        self.write_unsigned(out);
        crate::codec::write_varbytes(out, &self.signature);
    }

    /// `expiresTime || objectType || version || stream || body_without_sig`.
    pub fn signing_preimage(&self, expires_time: i64, version: u64, stream: u64) -> Vec<u8> {
        object_header_preimage(expires_time, ObjectType::Pubkey, version, stream, None, |out| {
            self.write_unsigned(out)
        })
    }

    pub fn sign(&mut self, signing_key: &SecretKey, expires_time: i64, version: u64, stream: u64) {
        let preimage = self.signing_preimage(expires_time, version, stream);
        let digest = SignatureDigest::for_address_version(version);
        self.signature = crate::crypto::ecdsa_sign(signing_key, &preimage, digest);
    }

    pub fn verify(&self, expires_time: i64, version: u64, stream: u64) -> Result<()> {
        let preimage = self.signing_preimage(expires_time, version, stream);
        let digest = SignatureDigest::for_address_version(version);
        crate::crypto::ecdsa_verify(&self.signing_pubkey, &preimage, &self.signature, digest)
    }
}

/// A v4 pubkey as seen on the wire: a routing tag plus an encrypted v3 body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedPubkeyV4 {
    pub tag: [u8; 32],
    pub box_: CryptoBox,
}

impl EncryptedPubkeyV4 {
    /// Decrypt with the address's `publicDecryptionKey`
    /// (`Address::decryption_key`), yielding the embedded, still-signed v3
    /// body.
    pub fn decrypt(&self, decryption_key: &SecretKey) -> Result<PubkeyV3Body> {
        let plaintext = self.box_.decrypt(decryption_key)?;
        let mut r = WireReader::new(&plaintext);
        PubkeyV3Body::read(&mut r, true)
    }

    pub fn encrypt(
        body: &PubkeyV3Body,
        tag: [u8; 32],
        target_pubkey: &PublicKey,
    ) -> Result<Self> {
        let mut plaintext = Vec::new();
        body.write(&mut plaintext);
        let box_ = CryptoBox::encrypt(target_pubkey, &plaintext)?;
        Ok(Self { tag, box_ })
    }

    /// The signing preimage for a v4 pubkey is prefixed by its tag ahead of
    /// the (unsigned) body, per spec.md §4.4.
    pub fn signing_preimage(
        body: &PubkeyV3Body,
        tag: [u8; 32],
        expires_time: i64,
        version: u64,
        stream: u64,
    ) -> Vec<u8> {
        object_header_preimage(
            expires_time,
            ObjectType::Pubkey,
            version,
            stream,
            Some(tag),
            |out| body.write_unsigned(out),
        )
    }
}

/// An encrypted `msg` object body: a [`CryptoBox`] envelope that decrypts to
/// a [`MsgPlaintext`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedMsg {
    pub box_: CryptoBox,
}

/// The fields carried inside a decrypted `msg` object (spec.md §4.4, §4.7).
/// This is the object-level plaintext; the application-facing message (with
/// status/labels) is a higher-level concept built from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsgPlaintext {
    pub sender_address_version: u64,
    pub sender_stream: u64,
    pub behavior_bitfield: u32,
    pub sender_signing_pubkey: PublicKey,
    pub sender_encryption_pubkey: PublicKey,
    pub nonce_trials_per_byte: u64,
    pub extra_bytes: u64,
    pub destination_ripe: [u8; 20],
    pub encoding: u64,
    pub message: Vec<u8>,
    pub ack_data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl MsgPlaintext {
    fn write_unsigned(&self, out: &mut Vec<u8>) {
        write_varint(out, self.sender_address_version);
        write_varint(out, self.sender_stream);
        out.extend_from_slice(&self.behavior_bitfield.to_be_bytes());
        write_raw_pubkey(out, &self.sender_signing_pubkey);
        write_raw_pubkey(out, &self.sender_encryption_pubkey);
        write_varint(out, self.nonce_trials_per_byte);
        write_varint(out, self.extra_bytes);
        out.extend_from_slice(&self.destination_ripe);
        write_varint(out, self.encoding);
        crate::codec::write_varbytes(out, &self.message);
        crate::codec::write_varbytes(out, &self.ack_data);
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        self.write_unsigned(out);
        crate::codec::write_varbytes(out, &self.signature);
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf);
        let sender_address_version = r.read_varint()?;
        let sender_stream = r.read_varint()?;
        let behavior_bitfield = r.read_u32()?;
        let sender_signing_pubkey = read_raw_pubkey(&mut r)?;
        let sender_encryption_pubkey = read_raw_pubkey(&mut r)?;
        let nonce_trials_per_byte = r.read_varint()?;
        let extra_bytes = r.read_varint()?;
        let destination_ripe: [u8; 20] = r.read_bytes(20)?.try_into().unwrap();
        let encoding = r.read_varint()?;
        let message = r.read_varbytes_owned()?;
        let ack_data = r.read_varbytes_owned()?;
        let signature = r.read_varbytes_owned()?;

        Ok(Self {
            sender_address_version,
            sender_stream,
            behavior_bitfield,
            sender_signing_pubkey,
            sender_encryption_pubkey,
            nonce_trials_per_byte,
            extra_bytes,
            destination_ripe,
            encoding,
            message,
            ack_data,
            signature,
        })
    }

    pub fn signing_preimage(&self, expires_time: i64, stream: u64) -> Vec<u8> {
        object_header_preimage(expires_time, ObjectType::Msg, 1, stream, None, |out| {
            self.write_unsigned(out)
        })
    }

    pub fn sign(&mut self, signing_key: &SecretKey, expires_time: i64, stream: u64) {
        let preimage = self.signing_preimage(expires_time, stream);
        let digest = SignatureDigest::for_address_version(self.sender_address_version);
        self.signature = crate::crypto::ecdsa_sign(signing_key, &preimage, digest);
    }

    pub fn verify(&self, expires_time: i64, stream: u64) -> Result<()> {
        let preimage = self.signing_preimage(expires_time, stream);
        let digest = SignatureDigest::for_address_version(self.sender_address_version);
        crate::crypto::ecdsa_verify(&self.sender_signing_pubkey, &preimage, &self.signature, digest)
    }
}

impl EncryptedMsg {
    pub fn encrypt(recipient_pubkey: &PublicKey, plaintext: &MsgPlaintext) -> Result<Self> {
        let mut bytes = Vec::new();
        plaintext.write(&mut bytes);
        Ok(Self {
            box_: CryptoBox::encrypt(recipient_pubkey, &bytes)?,
        })
    }

    pub fn decrypt(&self, recipient_decryption_key: &SecretKey) -> Result<MsgPlaintext> {
        let bytes = self.box_.decrypt(recipient_decryption_key)?;
        MsgPlaintext::read(&bytes)
    }
}

/// Shared plaintext shape for broadcast objects: identical to `msg` minus
/// the recipient-specific fields (no destination, no ack request).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastPlaintext {
    pub sender_address_version: u64,
    pub sender_stream: u64,
    pub behavior_bitfield: u32,
    pub sender_signing_pubkey: PublicKey,
    pub sender_encryption_pubkey: PublicKey,
    pub nonce_trials_per_byte: u64,
    pub extra_bytes: u64,
    pub encoding: u64,
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
}

impl BroadcastPlaintext {
    fn write_unsigned(&self, out: &mut Vec<u8>) {
        write_varint(out, self.sender_address_version);
        write_varint(out, self.sender_stream);
        out.extend_from_slice(&self.behavior_bitfield.to_be_bytes());
        write_raw_pubkey(out, &self.sender_signing_pubkey);
        write_raw_pubkey(out, &self.sender_encryption_pubkey);
        write_varint(out, self.nonce_trials_per_byte);
        write_varint(out, self.extra_bytes);
        write_varint(out, self.encoding);
        crate::codec::write_varbytes(out, &self.message);
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        self.write_unsigned(out);
        crate::codec::write_varbytes(out, &self.signature);
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf);
        let sender_address_version = r.read_varint()?;
        let sender_stream = r.read_varint()?;
        let behavior_bitfield = r.read_u32()?;
        let sender_signing_pubkey = read_raw_pubkey(&mut r)?;
        let sender_encryption_pubkey = read_raw_pubkey(&mut r)?;
        let nonce_trials_per_byte = r.read_varint()?;
        let extra_bytes = r.read_varint()?;
        let encoding = r.read_varint()?;
        let message = r.read_varbytes_owned()?;
        let signature = r.read_varbytes_owned()?;

        Ok(Self {
            sender_address_version,
            sender_stream,
            behavior_bitfield,
            sender_signing_pubkey,
            sender_encryption_pubkey,
            nonce_trials_per_byte,
            extra_bytes,
            encoding,
            message,
            signature,
        })
    }

    fn sign_with(&mut self, signing_key: &SecretKey, preimage: Vec<u8>) {
        let digest = SignatureDigest::for_address_version(self.sender_address_version);
        self.signature = crate::crypto::ecdsa_sign(signing_key, &preimage, digest);
    }

    fn verify_with(&self, preimage: Vec<u8>) -> Result<()> {
        let digest = SignatureDigest::for_address_version(self.sender_address_version);
        crate::crypto::ecdsa_verify(&self.sender_signing_pubkey, &preimage, &self.signature, digest)
    }
}

/// v4 broadcast: no tag, encrypted to a key derived from the sender address
/// alone (spec.md §4.4's "Broadcast key derivation").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedBroadcastV4 {
    pub box_: CryptoBox,
}

/// `doubleSha512(varint(version) || varint(stream) || RIPE)[0..32]` of the
/// sender address, used as the v4 broadcast's symmetric... effectively
/// asymmetric ECDH target: the sender publishes the corresponding pubkey
/// point and any subscriber can derive the same scalar.
pub fn broadcast_v4_decryption_key(sender_address: &Address) -> Result<SecretKey> {
    sender_address.decryption_key()
}

fn broadcast_v4_encryption_pubkey(sender_address: &Address) -> Result<PublicKey> {
    let secp = Secp256k1::new();
    let scalar = broadcast_v4_decryption_key(sender_address)?;
    Ok(PublicKey::from_secret_key(&secp, &scalar))
}

impl EncryptedBroadcastV4 {
    pub fn encrypt(sender_address: &Address, plaintext: &BroadcastPlaintext) -> Result<Self> {
        let pubkey = broadcast_v4_encryption_pubkey(sender_address)?;
        let mut bytes = Vec::new();
        plaintext.write(&mut bytes);
        Ok(Self {
            box_: CryptoBox::encrypt(&pubkey, &bytes)?,
        })
    }

    pub fn decrypt(&self, sender_address: &Address) -> Result<BroadcastPlaintext> {
        let scalar = broadcast_v4_decryption_key(sender_address)?;
        let bytes = self.box_.decrypt(&scalar)?;
        BroadcastPlaintext::read(&bytes)
    }

    pub fn signing_preimage(plaintext: &BroadcastPlaintext, expires_time: i64, stream: u64) -> Vec<u8> {
        object_header_preimage(expires_time, ObjectType::Broadcast, 4, stream, None, |out| {
            plaintext.write_unsigned(out)
        })
    }

    pub fn sign(plaintext: &mut BroadcastPlaintext, signing_key: &SecretKey, expires_time: i64, stream: u64) {
        let preimage = Self::signing_preimage(plaintext, expires_time, stream);
        plaintext.sign_with(signing_key, preimage);
    }

    pub fn verify(plaintext: &BroadcastPlaintext, expires_time: i64, stream: u64) -> Result<()> {
        plaintext.verify_with(Self::signing_preimage(plaintext, expires_time, stream))
    }
}

/// v5 broadcast: carries the sender's 32-byte tag on the wire so
/// subscribers can match it without attempting decryption against every
/// known sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedBroadcastV5 {
    pub tag: [u8; 32],
    pub box_: CryptoBox,
}

impl EncryptedBroadcastV5 {
    pub fn encrypt(sender_address: &Address, plaintext: &BroadcastPlaintext) -> Result<Self> {
        let pubkey = broadcast_v4_encryption_pubkey(sender_address)?;
        let mut bytes = Vec::new();
        plaintext.write(&mut bytes);
        Ok(Self {
            tag: sender_address.tag(),
            box_: CryptoBox::encrypt(&pubkey, &bytes)?,
        })
    }

    pub fn decrypt(&self, sender_address: &Address) -> Result<BroadcastPlaintext> {
        let scalar = broadcast_v4_decryption_key(sender_address)?;
        let bytes = self.box_.decrypt(&scalar)?;
        BroadcastPlaintext::read(&bytes)
    }

    /// The v5 preimage additionally starts with the sender's tag, ahead of
    /// the usual header fields (spec.md §4.4).
    pub fn signing_preimage(&self, plaintext: &BroadcastPlaintext, expires_time: i64, stream: u64) -> Vec<u8> {
        object_header_preimage(
            expires_time,
            ObjectType::Broadcast,
            5,
            stream,
            Some(self.tag),
            |out| plaintext.write_unsigned(out),
        )
    }

    pub fn sign(&self, plaintext: &mut BroadcastPlaintext, signing_key: &SecretKey, expires_time: i64, stream: u64) {
        let preimage = self.signing_preimage(plaintext, expires_time, stream);
        plaintext.sign_with(signing_key, preimage);
    }

    pub fn verify(&self, plaintext: &BroadcastPlaintext, expires_time: i64, stream: u64) -> Result<()> {
        plaintext.verify_with(self.signing_preimage(plaintext, expires_time, stream))
    }
}

/// Build `expiresTime || objectType || version || stream || [tag] || body`,
/// the canonical signing preimage shared by every signed object type.
fn object_header_preimage(
    expires_time: i64,
    object_type: ObjectType,
    version: u64,
    stream: u64,
    tag: Option<[u8; 32]>,
    write_body: impl FnOnce(&mut Vec<u8>),
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&expires_time.to_be_bytes());
    out.extend_from_slice(&object_type.code().to_be_bytes());
    write_varint(&mut out, version);
    write_varint(&mut out, stream);
    if let Some(tag) = tag {
        out.extend_from_slice(&tag);
    }
    write_body(&mut out);
    out
}

/// Convenience constructor for the user agent varstring carried in a
/// `version` message; kept here since it shares the varstring codec with
/// object payloads and has no other natural home in this crate.
pub fn user_agent_bytes(agent: &str) -> Vec<u8> {
    let mut out = Vec::new();
    write_varstring(&mut out, agent);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PrivateKey;

    fn sample_object(payload: Vec<u8>, object_type: ObjectType, version: u64, stream: u64) -> ObjectMessage {
        ObjectMessage {
            nonce: [0u8; 8],
            expires_time: 1_700_000_000,
            object_type,
            version,
            stream,
            payload,
        }
    }

    #[test]
    fn object_roundtrip_preserves_iv() {
        let obj = sample_object(vec![1, 2, 3, 4], ObjectType::Msg, 1, 1);
        let bytes = obj.to_bytes();
        let reparsed = ObjectMessage::from_bytes(&bytes).unwrap();
        assert_eq!(obj.inventory_vector(), reparsed.inventory_vector());
    }

    #[test]
    fn unknown_object_type_round_trips_opaquely() {
        let obj = sample_object(vec![9, 9, 9], ObjectType::Unknown(99), 1, 1);
        let payload = obj.decode_payload().unwrap();
        assert_eq!(payload, Payload::Opaque(99, vec![9, 9, 9]));
    }

    #[test]
    fn pubkey_v3_sign_verify_roundtrip() {
        let identity = PrivateKey::generate(3, 1);
        let secp = Secp256k1::new();
        let mut body = PubkeyV3Body {
            behavior_bitfield: 0,
            signing_pubkey: identity.signing_pubkey(&secp),
            encryption_pubkey: identity.encryption_pubkey(&secp),
            nonce_trials_per_byte: 1000,
            extra_bytes: 1000,
            signature: Vec::new(),
        };
        body.sign(&identity.signing_key, 1_700_000_000, 3, 1);
        body.verify(1_700_000_000, 3, 1).unwrap();

        let mut tampered = body.clone();
        tampered.nonce_trials_per_byte += 1;
        assert!(tampered.verify(1_700_000_000, 3, 1).is_err());
    }

    #[test]
    fn pubkey_v4_encrypt_decrypt_roundtrip() {
        let identity = PrivateKey::generate(4, 1);
        let secp = Secp256k1::new();
        let mut body = PubkeyV3Body {
            behavior_bitfield: 0,
            signing_pubkey: identity.signing_pubkey(&secp),
            encryption_pubkey: identity.encryption_pubkey(&secp),
            nonce_trials_per_byte: 1000,
            extra_bytes: 1000,
            signature: Vec::new(),
        };
        let tag = identity.address.tag();
        body.sign(&identity.signing_key, 1_700_000_000, 4, 1);

        let target_pubkey = {
            let secp = Secp256k1::new();
            let scalar = identity.address.decryption_key().unwrap();
            PublicKey::from_secret_key(&secp, &scalar)
        };
        let encrypted = EncryptedPubkeyV4::encrypt(&body, tag, &target_pubkey).unwrap();

        let decryption_key = identity.address.decryption_key().unwrap();
        let decrypted = encrypted.decrypt(&decryption_key).unwrap();
        assert_eq!(decrypted, body);
        decrypted.verify(1_700_000_000, 4, 1).unwrap();
    }

    #[test]
    fn msg_encrypt_decrypt_and_sign_roundtrip() {
        let sender = PrivateKey::generate(4, 1);
        let recipient = PrivateKey::generate(4, 1);
        let secp = Secp256k1::new();

        let mut plaintext = MsgPlaintext {
            sender_address_version: 4,
            sender_stream: 1,
            behavior_bitfield: 0,
            sender_signing_pubkey: sender.signing_pubkey(&secp),
            sender_encryption_pubkey: sender.encryption_pubkey(&secp),
            nonce_trials_per_byte: 1000,
            extra_bytes: 1000,
            destination_ripe: recipient.address.ripe,
            encoding: 2,
            message: b"hello bitmessage".to_vec(),
            ack_data: crate::crypto::random_bytes(32),
            signature: Vec::new(),
        };
        plaintext.sign(&sender.signing_key, 1_700_000_000, 1);
        plaintext.verify(1_700_000_000, 1).unwrap();

        let recipient_pub = recipient.encryption_pubkey(&secp);
        let encrypted = EncryptedMsg::encrypt(&recipient_pub, &plaintext).unwrap();
        let decrypted = encrypted.decrypt(&recipient.encryption_key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn broadcast_v5_roundtrip() {
        let sender = PrivateKey::generate(4, 1);
        let secp = Secp256k1::new();

        let mut plaintext = BroadcastPlaintext {
            sender_address_version: 4,
            sender_stream: 1,
            behavior_bitfield: 0,
            sender_signing_pubkey: sender.signing_pubkey(&secp),
            sender_encryption_pubkey: sender.encryption_pubkey(&secp),
            nonce_trials_per_byte: 1000,
            extra_bytes: 1000,
            encoding: 2,
            message: b"broadcast to all subscribers".to_vec(),
            signature: Vec::new(),
        };

        let encrypted = EncryptedBroadcastV5::encrypt(&sender.address, &plaintext).unwrap();
        encrypted.sign(&mut plaintext, &sender.signing_key, 1_700_000_000, 1);
        encrypted.verify(&plaintext, 1_700_000_000, 1).unwrap();

        let decrypted = encrypted.decrypt(&sender.address).unwrap();
        // decrypt() re-reads the envelope contents captured before signing;
        // re-encrypt with the signed plaintext to check the full loop.
        let resealed = EncryptedBroadcastV5::encrypt(&sender.address, &plaintext).unwrap();
        let redecrypted = resealed.decrypt(&sender.address).unwrap();
        assert_eq!(redecrypted, plaintext);
        assert_eq!(decrypted.sender_stream, plaintext.sender_stream);
    }
}
