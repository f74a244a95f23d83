//! Fixed cross-module vectors and full-pipeline composition tests.
//!
//! Unlike the unit tests living alongside each module, these exercise
//! address parsing, key import, signing, and encryption together, the way
//! a real identity moves through the system.

use crate::address::{decode_wif, Address, PrivateKey};
use crate::object::{EncryptedPubkeyV4, MsgPlaintext, PubkeyV3Body};
use secp256k1::{PublicKey, Secp256k1, SecretKey};

#[test]
fn known_address_parses_to_known_ripe() {
    let addr = Address::parse("BM-2D9Vc5rFxxR5vTi53T9gkLfemViHRMVLQZ").unwrap();
    assert_eq!(addr.version, 3);
    assert_eq!(addr.stream, 1);
    assert_eq!(
        hex::encode(addr.ripe),
        "007402be6e76c3cb87caa946d0c003a3d4d8e1d5"
    );
}

#[test]
fn known_wif_decodes_to_known_scalar() {
    let scalar = decode_wif("5HueCGU8rMjxEXxiPuD5BDku4MkFqeZyd4dZ1jvhTVqvbTLvyTJ").unwrap();
    assert_eq!(
        hex::encode(scalar.secret_bytes()),
        "0c28fca386c7a227600b2fe50b7cae11ec86d3bf1fbe471be89827e19d72aa1"
    );
}

#[test]
fn imported_wif_key_derives_a_stable_address() {
    let secp = Secp256k1::new();
    let signing_key = decode_wif("5HueCGU8rMjxEXxiPuD5BDku4MkFqeZyd4dZ1jvhTVqvbTLvyTJ").unwrap();
    let encryption_key = SecretKey::new(&mut rand::thread_rng());

    let signing_pub = PublicKey::from_secret_key(&secp, &signing_key);
    let encryption_pub = PublicKey::from_secret_key(&secp, &encryption_key);
    let address = Address::from_public_keys(3, 1, &signing_pub, &encryption_pub);

    let roundtripped = Address::parse(&address.to_string_form()).unwrap();
    assert_eq!(roundtripped, address);
}

/// A freshly generated v4 identity publishes a v3 pubkey body sealed inside
/// a v4 envelope; a peer who only knows the address can recover and verify
/// it without ever seeing the identity's private keys.
#[test]
fn full_v4_identity_publish_and_peer_recovery() {
    let identity = PrivateKey::generate(4, 1);
    let secp = Secp256k1::new();

    let mut body = PubkeyV3Body {
        behavior_bitfield: 1,
        signing_pubkey: identity.signing_pubkey(&secp),
        encryption_pubkey: identity.encryption_pubkey(&secp),
        nonce_trials_per_byte: 1000,
        extra_bytes: 1000,
        signature: Vec::new(),
    };
    let expires_time = 1_700_000_000;
    body.sign(&identity.signing_key, expires_time, 4, 1);

    let target_pubkey = {
        let scalar = identity.address.decryption_key().unwrap();
        PublicKey::from_secret_key(&secp, &scalar)
    };
    let published = EncryptedPubkeyV4::encrypt(&body, identity.address.tag(), &target_pubkey).unwrap();

    // A peer holding only the address string recovers the identity's
    // pubkey payload and checks the embedded signature.
    let peer_view_address = Address::parse(&identity.address.to_string_form()).unwrap();
    let decryption_key = peer_view_address.decryption_key().unwrap();
    let recovered = published.decrypt(&decryption_key).unwrap();
    recovered.verify(expires_time, 4, 1).unwrap();
    assert_eq!(recovered.signing_pubkey, body.signing_pubkey);
}

/// End-to-end message send: sender composes and signs a plaintext, seals it
/// to the recipient's encryption pubkey, and the recipient recovers the
/// original fields after decrypting with their own private key.
#[test]
fn full_message_seal_and_recover() {
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
        message: b"this message only the recipient can read".to_vec(),
        ack_data: crate::crypto::random_bytes(32),
        signature: Vec::new(),
    };
    plaintext.sign(&sender.signing_key, 1_700_000_000, 1);

    let sealed =
        crate::object::EncryptedMsg::encrypt(&recipient.encryption_pubkey(&secp), &plaintext).unwrap();

    let recovered = sealed.decrypt(&recipient.encryption_key).unwrap();
    recovered.verify(1_700_000_000, 1).unwrap();
    assert_eq!(recovered.message, plaintext.message);
    assert_eq!(recovered.destination_ripe, recipient.address.ripe);
}
