//! Bitmessage address derivation and parsing (spec.md §3, §4.3)

use crate::codec::{write_varint, WireReader};
use crate::crypto::{double_sha512, ripemd160, sha512};
use crate::error::{Error, Result};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

const ADDRESS_PREFIX: &str = "BM-";

/// A parsed or derived Bitmessage address: version, stream, and the
/// 20-byte RIPE digest of the owner's signing and encryption public keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub version: u64,
    pub stream: u64,
    pub ripe: [u8; 20],
}

impl Address {
    pub fn new(version: u64, stream: u64, ripe: [u8; 20]) -> Self {
        Self { version, stream, ripe }
    }

    /// Derive an address from a pair of public keys, per spec.md §3:
    /// `RIPE = RIPEMD160(SHA512(signing_pub || encryption_pub))`.
    pub fn from_public_keys(
        version: u64,
        stream: u64,
        signing_pubkey: &PublicKey,
        encryption_pubkey: &PublicKey,
    ) -> Self {
        let ripe = ripe_digest(signing_pubkey, encryption_pubkey);
        Self { version, stream, ripe }
    }

    /// The bytes hashed twice to produce the checksum and (for v4+) the tag
    /// and public decryption key: `varint(version) || varint(stream) || ripe`.
    fn checksum_preimage(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 20);
        write_varint(&mut out, self.version);
        write_varint(&mut out, self.stream);
        out.extend_from_slice(&self.ripe);
        out
    }

    /// `SHA512(SHA512(varint(version) || varint(stream) || ripe))`.
    fn mac(&self) -> [u8; 64] {
        double_sha512(&self.checksum_preimage())
    }

    /// For v4+ addresses: `tag = mac[32..64]`, used to route v4 pubkeys and
    /// v5 broadcasts without revealing the address.
    pub fn tag(&self) -> [u8; 32] {
        let mac = self.mac();
        let mut tag = [0u8; 32];
        tag.copy_from_slice(&mac[32..64]);
        tag
    }

    /// For v4+ addresses: `publicDecryptionKey = mac[0..32]`, used as the
    /// ECDH private scalar for the address's v4 pubkey / v5 broadcast
    /// envelope.
    pub fn decryption_key(&self) -> Result<SecretKey> {
        let mac = self.mac();
        let mut key = [0u8; 32];
        key.copy_from_slice(&mac[0..32]);
        SecretKey::from_slice(&key).map_err(|_| Error::InvalidKey("zero decryption scalar".into()))
    }

    /// Render the canonical `BM-...` string form.
    pub fn to_string_form(&self) -> String {
        let preimage = self.checksum_preimage();
        let checksum = &double_sha512(&preimage)[0..4];

        let mut payload = preimage;
        payload.extend_from_slice(checksum);

        format!("{ADDRESS_PREFIX}{}", bs58::encode(payload).into_string())
    }

    /// Parse a `BM-...` address string, validating its checksum.
    pub fn parse(s: &str) -> Result<Self> {
        let encoded = s
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or_else(|| Error::InvalidAddress("missing BM- prefix".into()))?;

        let payload = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| Error::InvalidAddress(format!("base58 decode: {e}")))?;

        if payload.len() < 4 {
            return Err(Error::InvalidAddress("address too short".into()));
        }
        let (body, checksum) = payload.split_at(payload.len() - 4);

        let expected = &double_sha512(body)[0..4];
        if expected != checksum {
            return Err(Error::InvalidAddress("bad checksum".into()));
        }

        let mut r = WireReader::new(body);
        let version = r.read_varint()?;
        let stream = r.read_varint()?;
        let ripe_bytes = r.read_bytes(r.remaining())?;
        if ripe_bytes.len() > 20 {
            return Err(Error::InvalidAddress("ripe digest too long".into()));
        }

        // The RIPE digest is left-stripped of leading zero bytes on the
        // wire/in the string form; pad it back out to 20 bytes.
        let mut ripe = [0u8; 20];
        ripe[20 - ripe_bytes.len()..].copy_from_slice(ripe_bytes);

        Ok(Self { version, stream, ripe })
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_form())
    }
}

/// Compute the RIPE digest for a pair of public keys, stripped back to its
/// full 20-byte form (leading-zero stripping only applies to the wire/string
/// encoding, not to in-memory use).
pub fn ripe_digest(signing_pubkey: &PublicKey, encryption_pubkey: &PublicKey) -> [u8; 20] {
    let mut preimage = Vec::with_capacity(130);
    preimage.extend_from_slice(&signing_pubkey.serialize_uncompressed());
    preimage.extend_from_slice(&encryption_pubkey.serialize_uncompressed());
    ripemd160(&sha512(&preimage))
}

/// A private key pair: a signing scalar and an encryption scalar, plus the
/// address they derive.
pub struct PrivateKey {
    pub signing_key: SecretKey,
    pub encryption_key: SecretKey,
    pub address: Address,
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        // SecretKey itself does not zeroize on drop; scrub our copies of the
        // raw scalars explicitly.
        let mut sk = self.signing_key.secret_bytes();
        let mut ek = self.encryption_key.secret_bytes();
        sk.zeroize();
        ek.zeroize();
    }
}

impl PrivateKey {
    pub fn signing_pubkey(&self, secp: &Secp256k1<secp256k1::All>) -> PublicKey {
        PublicKey::from_secret_key(secp, &self.signing_key)
    }

    pub fn encryption_pubkey(&self, secp: &Secp256k1<secp256k1::All>) -> PublicKey {
        PublicKey::from_secret_key(secp, &self.encryption_key)
    }

    /// Generate a fresh identity for `(version, stream)`.
    ///
    /// For v3/v4 addresses, generation retries with fresh scalars until the
    /// derived RIPE digest begins with at least one zero byte, shortening
    /// the resulting address string (spec.md §3).
    pub fn generate(version: u64, stream: u64) -> Self {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();

        loop {
            let signing_key = SecretKey::new(&mut rng);
            let encryption_key = SecretKey::new(&mut rng);
            let signing_pub = PublicKey::from_secret_key(&secp, &signing_key);
            let encryption_pub = PublicKey::from_secret_key(&secp, &encryption_key);

            let address = Address::from_public_keys(version, stream, &signing_pub, &encryption_pub);

            if version < 3 || address.ripe[0] == 0 {
                return Self {
                    signing_key,
                    encryption_key,
                    address,
                };
            }
        }
    }
}

/// `SHA-256(SHA-256(data))`, the Bitcoin Base58Check checksum algorithm WIF
/// inherits. Distinct from [`double_sha512`], which is what Bitmessage's own
/// address/tag/key derivation uses.
fn double_sha256(data: &[u8]) -> [u8; 32] {
    let once = Sha256::digest(data);
    let twice = Sha256::digest(once);
    let mut out = [0u8; 32];
    out.copy_from_slice(&twice);
    out
}

/// Decode a Wallet Import Format private key string (the Bitcoin-derived
/// Base58Check encoding PyBitmessage reuses for `.wif` key exports):
/// `version(0x80) || scalar(32) || [compression flag(0x01)] || checksum(4)`.
pub fn decode_wif(s: &str) -> Result<SecretKey> {
    let payload = bs58::decode(s)
        .into_vec()
        .map_err(|e| Error::InvalidKey(format!("base58 decode: {e}")))?;

    if payload.len() < 1 + 32 + 4 {
        return Err(Error::InvalidKey("wif too short".into()));
    }
    let (body, checksum) = payload.split_at(payload.len() - 4);
    let expected = &double_sha256(body)[0..4];
    if expected != checksum {
        return Err(Error::InvalidKey("wif checksum mismatch".into()));
    }

    if body[0] != 0x80 {
        return Err(Error::InvalidKey("unexpected wif version byte".into()));
    }
    let scalar = match body.len() {
        33 => &body[1..33],
        34 if body[33] == 0x01 => &body[1..33],
        _ => return Err(Error::InvalidKey("unexpected wif body length".into())),
    };

    SecretKey::from_slice(scalar).map_err(|_| Error::InvalidKey("scalar out of range".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_string_roundtrip() {
        let pk = PrivateKey::generate(4, 1);
        let s = pk.address.to_string_form();
        let reparsed = Address::parse(&s).unwrap();
        assert_eq!(reparsed, pk.address);
        assert_eq!(reparsed.to_string_form(), s);
    }

    #[test]
    fn v3_and_v4_addresses_have_zero_prefixed_ripe() {
        for version in [3, 4] {
            let pk = PrivateKey::generate(version, 1);
            assert_eq!(pk.address.ripe[0], 0);
        }
    }

    #[test]
    fn parse_known_v3_address() {
        // spec.md S1
        let addr = Address::parse("BM-2D9Vc5rFxxR5vTi53T9gkLfemViHRMVLQZ").unwrap();
        assert_eq!(addr.version, 3);
        assert_eq!(addr.stream, 1);
        assert_eq!(hex::encode(addr.ripe), "007402be6e76c3cb87caa946d0c003a3d4d8e1d5");
    }

    #[test]
    fn bad_checksum_rejected() {
        let pk = PrivateKey::generate(4, 1);
        let mut s = pk.address.to_string_form();
        // Flip the last character of the base58 body to corrupt the checksum.
        let mut chars: Vec<char> = s.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '1' { '2' } else { '1' };
        s = chars.into_iter().collect();
        assert!(Address::parse(&s).is_err());
    }

    #[test]
    fn tag_and_decryption_key_are_deterministic() {
        let pk = PrivateKey::generate(4, 1);
        assert_eq!(pk.address.tag(), pk.address.tag());
        let k1 = pk.address.decryption_key().unwrap();
        let k2 = pk.address.decryption_key().unwrap();
        assert_eq!(k1.secret_bytes(), k2.secret_bytes());
    }
}
