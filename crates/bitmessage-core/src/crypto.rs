//! Cryptographic adapter (spec.md §4.2)
//!
//! Wraps the primitives Bitmessage actually specifies: SHA-512/SHA-256/SHA-1
//! hashing, RIPEMD-160, HMAC-SHA-256, secp256k1 ECDSA/ECDH, and AES-256-CBC
//! with PKCS#7 padding. Also implements the CryptoBox ECIES envelope that
//! every encryption-carrying object (Msg, Broadcast v4/v5, Pubkey v4) uses.

use crate::error::{Error, Result};
use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// The digest used for an object's ECDSA signing preimage. Bitmessage signs
/// v2 addresses' objects with SHA-1 and v3+ addresses' objects with SHA-256;
/// implementations that mismatch this silently fail to interoperate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureDigest {
    Sha1,
    Sha256,
}

impl SignatureDigest {
    /// The digest to use for a given address version.
    pub fn for_address_version(version: u64) -> Self {
        if version <= 2 {
            SignatureDigest::Sha1
        } else {
            SignatureDigest::Sha256
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            SignatureDigest::Sha1 => sha1::Sha1::digest(data).to_vec(),
            SignatureDigest::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// SHA-512 of `data`.
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let out = Sha512::digest(data);
    let mut buf = [0u8; 64];
    buf.copy_from_slice(&out);
    buf
}

/// SHA-512(SHA-512(data)), the "mac" helper used throughout the address and
/// object model for RIPE/tag/checksum derivation.
pub fn double_sha512(data: &[u8]) -> [u8; 64] {
    sha512(&sha512(data))
}

/// RIPEMD-160 of `data`.
pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    let out = Ripemd160::digest(data);
    let mut buf = [0u8; 20];
    buf.copy_from_slice(&out);
    buf
}

/// HMAC-SHA-256(key, data).
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let out = mac.finalize().into_bytes();
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&out);
    buf
}

fn hmac_sha256_verify(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// 8 random bytes suitable as a PoW nonce seed / connection nonce.
pub fn random_nonce() -> u64 {
    rand::thread_rng().next_u64()
}

/// `n` cryptographically random bytes.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Sign `message` (the canonical object preimage) with `privkey` using the
/// digest appropriate to `digest`. Returns a DER-encoded ECDSA signature.
pub fn ecdsa_sign(privkey: &SecretKey, message: &[u8], digest: SignatureDigest) -> Vec<u8> {
    let secp = Secp256k1::signing_only();
    let msg = message_from_digest(&digest.digest(message));
    let sig = secp.sign_ecdsa(&msg, privkey);
    sig.serialize_der().to_vec()
}

/// Verify a DER-encoded ECDSA `signature` over `message` against `pubkey`.
pub fn ecdsa_verify(
    pubkey: &PublicKey,
    message: &[u8],
    signature: &[u8],
    digest: SignatureDigest,
) -> Result<()> {
    let secp = Secp256k1::verification_only();
    let msg = message_from_digest(&digest.digest(message));
    let sig = Signature::from_der(signature).map_err(|_| Error::InvalidSignature)?;
    secp.verify_ecdsa(&msg, &sig, pubkey)
        .map_err(|_| Error::InvalidSignature)
}

/// ECDSA treats a digest shorter than the curve order as the low-order bits
/// of the integer message; a SHA-1 digest is therefore left-padded with
/// zero bytes to 32 bytes rather than hashed again.
fn message_from_digest(digest: &[u8]) -> Message {
    let mut buf = [0u8; 32];
    if digest.len() >= 32 {
        buf.copy_from_slice(&digest[digest.len() - 32..]);
    } else {
        buf[32 - digest.len()..].copy_from_slice(digest);
    }
    Message::from_digest(buf)
}

/// Derive the shared x-coordinate of `priv_scalar * pub_point`, the raw
/// secp256k1 ECDH primitive used both standalone and inside CryptoBox.
pub fn ecdh_shared_secret(priv_scalar: &SecretKey, pub_point: &PublicKey) -> Result<[u8; 32]> {
    let secp = Secp256k1::new();
    let scalar = Scalar::from_be_bytes(priv_scalar.secret_bytes())
        .map_err(|_| Error::InvalidKey("scalar out of range".into()))?;
    let shared_point = pub_point
        .mul_tweak(&secp, &scalar)
        .map_err(|_| Error::InvalidKey("ecdh point multiplication failed".into()))?;
    let uncompressed = shared_point.serialize_uncompressed();
    let mut x = [0u8; 32];
    x.copy_from_slice(&uncompressed[1..33]);
    Ok(x)
}

/// AES-256-CBC encrypt with PKCS#7 padding.
pub fn aes256_cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
}

/// AES-256-CBC decrypt with PKCS#7 padding.
pub fn aes256_cbc_decrypt(key: &[u8; 32], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| Error::DecryptionFailed)
}

/// OpenSSL's historical `EC_GROUP` identifier for secp256k1, embedded in the
/// CryptoBox wire format ahead of the ephemeral public key coordinates.
pub const CRYPTOBOX_CURVE_TYPE: u16 = 0x02CA;

/// Bitmessage's ECIES envelope: an ephemeral secp256k1 keypair, an ECDH
/// shared secret split into an AES key and an HMAC key, and a MAC computed
/// over the whole envelope minus itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CryptoBox {
    pub iv: [u8; 16],
    pub ephemeral_pubkey: PublicKey,
    pub ciphertext: Vec<u8>,
    pub mac: [u8; 32],
}

impl CryptoBox {
    /// Encrypt `plaintext` to `target_pubkey`, generating a fresh ephemeral
    /// keypair internally.
    pub fn encrypt(target_pubkey: &PublicKey, plaintext: &[u8]) -> Result<Self> {
        let secp = Secp256k1::new();
        let ephemeral_secret = SecretKey::new(&mut rand::thread_rng());
        let ephemeral_pubkey = PublicKey::from_secret_key(&secp, &ephemeral_secret);

        let shared_x = ecdh_shared_secret(&ephemeral_secret, target_pubkey)?;
        let derived = Zeroizing::new(double_sha512_halves(&shared_x));
        let (enc_key, mac_key) = (&derived.0, &derived.1);

        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = aes256_cbc_encrypt(enc_key, &iv, plaintext);

        let mac = hmac_sha256(mac_key, &mac_preimage(&iv, &ephemeral_pubkey, &ciphertext));

        Ok(Self {
            iv,
            ephemeral_pubkey,
            ciphertext,
            mac,
        })
    }

    /// Decrypt using `priv_scalar`, the recipient's encryption private key.
    /// Verifies the MAC in constant time before attempting AES decryption.
    pub fn decrypt(&self, priv_scalar: &SecretKey) -> Result<Vec<u8>> {
        let shared_x = ecdh_shared_secret(priv_scalar, &self.ephemeral_pubkey)?;
        let derived = Zeroizing::new(double_sha512_halves(&shared_x));
        let (enc_key, mac_key) = (&derived.0, &derived.1);

        let preimage = mac_preimage(&self.iv, &self.ephemeral_pubkey, &self.ciphertext);
        if !hmac_sha256_verify(mac_key, &preimage, &self.mac) {
            return Err(Error::DecryptionFailed);
        }

        aes256_cbc_decrypt(enc_key, &self.iv, &self.ciphertext)
    }

    /// Serialize as `iv || curveType || xLen || R.x || yLen || R.y ||
    /// ciphertext || mac`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let uncompressed = self.ephemeral_pubkey.serialize_uncompressed();
        let (x, y) = (&uncompressed[1..33], &uncompressed[33..65]);

        let mut out = Vec::with_capacity(16 + 2 + 2 + 32 + 2 + 32 + self.ciphertext.len() + 32);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&CRYPTOBOX_CURVE_TYPE.to_be_bytes());
        out.extend_from_slice(&(x.len() as u16).to_be_bytes());
        out.extend_from_slice(x);
        out.extend_from_slice(&(y.len() as u16).to_be_bytes());
        out.extend_from_slice(y);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.mac);
        out
    }

    /// Parse the wire form produced by [`Self::to_bytes`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 + 2 + 2 + 2 + 32 {
            return Err(Error::MalformedWire("cryptobox too short".into()));
        }
        let mut r = crate::codec::WireReader::new(buf);
        let iv: [u8; 16] = r
            .read_bytes(16)?
            .try_into()
            .map_err(|_| Error::MalformedWire("bad iv".into()))?;
        let curve_type = r.read_u16()?;
        if curve_type != CRYPTOBOX_CURVE_TYPE {
            return Err(Error::MalformedWire(format!(
                "unexpected curve type {curve_type:#06x}"
            )));
        }
        let x_len = r.read_u16()? as usize;
        let x = r.read_bytes(x_len)?;
        let y_len = r.read_u16()? as usize;
        let y = r.read_bytes(y_len)?;

        if r.remaining() < 32 {
            return Err(Error::MalformedWire("cryptobox missing mac".into()));
        }
        let ciphertext_len = r.remaining() - 32;
        let ciphertext = r.read_bytes(ciphertext_len)?.to_vec();
        let mac: [u8; 32] = r
            .read_bytes(32)?
            .try_into()
            .map_err(|_| Error::MalformedWire("bad mac".into()))?;

        let mut uncompressed = [0u8; 65];
        uncompressed[0] = 0x04;
        uncompressed[1 + (32 - x.len())..33].copy_from_slice(x);
        uncompressed[33 + (32 - y.len())..65].copy_from_slice(y);
        let ephemeral_pubkey = PublicKey::from_slice(&uncompressed)
            .map_err(|_| Error::InvalidKey("bad ephemeral pubkey point".into()))?;

        Ok(Self {
            iv,
            ephemeral_pubkey,
            ciphertext,
            mac,
        })
    }
}

fn mac_preimage(iv: &[u8; 16], ephemeral_pubkey: &PublicKey, ciphertext: &[u8]) -> Vec<u8> {
    let uncompressed = ephemeral_pubkey.serialize_uncompressed();
    let (x, y) = (&uncompressed[1..33], &uncompressed[33..65]);

    let mut out = Vec::with_capacity(16 + 2 + 2 + 32 + 2 + 32 + ciphertext.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(&CRYPTOBOX_CURVE_TYPE.to_be_bytes());
    out.extend_from_slice(&(x.len() as u16).to_be_bytes());
    out.extend_from_slice(x);
    out.extend_from_slice(&(y.len() as u16).to_be_bytes());
    out.extend_from_slice(y);
    out.extend_from_slice(ciphertext);
    out
}

/// Split `SHA-512(shared_secret)` into the AES key (first half) and the MAC
/// key (second half).
fn double_sha512_halves(shared_secret: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let h = sha512(shared_secret);
    let mut enc = [0u8; 32];
    let mut mac = [0u8; 32];
    enc.copy_from_slice(&h[0..32]);
    mac.copy_from_slice(&h[32..64]);
    (enc, mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_sha512_is_sha512_twice() {
        let once = sha512(b"hello");
        let twice = sha512(&once);
        assert_eq!(double_sha512(b"hello"), twice);
    }

    #[test]
    fn hmac_verify_matches_compute() {
        let key = b"a mac key";
        let tag = hmac_sha256(key, b"data");
        assert!(hmac_sha256_verify(key, b"data", &tag));
        assert!(!hmac_sha256_verify(key, b"tampered", &tag));
    }

    #[test]
    fn aes_cbc_roundtrip() {
        let key = [7u8; 32];
        let iv = [9u8; 16];
        let plaintext = b"a secret bitmessage payload";
        let ciphertext = aes256_cbc_encrypt(&key, &iv, plaintext);
        let decrypted = aes256_cbc_decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn ecdh_is_symmetric() {
        let secp = Secp256k1::new();
        let a = SecretKey::new(&mut rand::thread_rng());
        let b = SecretKey::new(&mut rand::thread_rng());
        let a_pub = PublicKey::from_secret_key(&secp, &a);
        let b_pub = PublicKey::from_secret_key(&secp, &b);

        assert_eq!(
            ecdh_shared_secret(&a, &b_pub).unwrap(),
            ecdh_shared_secret(&b, &a_pub).unwrap()
        );
    }

    #[test]
    fn ecdsa_sign_verify_roundtrip() {
        let secp = Secp256k1::new();
        let sk = SecretKey::new(&mut rand::thread_rng());
        let pk = PublicKey::from_secret_key(&secp, &sk);
        let message = b"object preimage bytes";

        for digest in [SignatureDigest::Sha1, SignatureDigest::Sha256] {
            let sig = ecdsa_sign(&sk, message, digest);
            ecdsa_verify(&pk, message, &sig, digest).unwrap();

            let mut tampered = message.to_vec();
            tampered[0] ^= 0xFF;
            assert!(ecdsa_verify(&pk, &tampered, &sig, digest).is_err());
        }
    }

    #[test]
    fn cryptobox_roundtrip() {
        let secp = Secp256k1::new();
        let sk = SecretKey::new(&mut rand::thread_rng());
        let pk = PublicKey::from_secret_key(&secp, &sk);

        let plaintext = b"hello, encrypted bitmessage world!";
        let sealed = CryptoBox::encrypt(&pk, plaintext).unwrap();
        let opened = sealed.decrypt(&sk).unwrap();
        assert_eq!(opened, plaintext);

        let bytes = sealed.to_bytes();
        let reparsed = CryptoBox::from_bytes(&bytes).unwrap();
        assert_eq!(reparsed.decrypt(&sk).unwrap(), plaintext);
    }

    #[test]
    fn cryptobox_mac_tamper_fails() {
        let secp = Secp256k1::new();
        let sk = SecretKey::new(&mut rand::thread_rng());
        let pk = PublicKey::from_secret_key(&secp, &sk);

        let mut sealed = CryptoBox::encrypt(&pk, b"payload").unwrap();
        sealed.mac[0] ^= 0xFF;
        assert!(sealed.decrypt(&sk).is_err());
    }
}
