//! Send/receive pipeline (spec.md §4.7).
//!
//! Turns application-level sends into proof-of-worked, flooded objects, and
//! dispatches inbound objects to the right identity, contact, or
//! subscription. Everything here is synchronous bookkeeping plus one
//! blocking step -- the PoW search -- which goes through [`PowEngine`] so
//! only one runs at a time process-wide.

use crate::ports::{
    Contact, Identity, InMemoryAddressBook, InMemoryMessageStore, InMemoryPowQueue, Message, MessageKind,
    MessageStatus, PendingPow, Subscription,
};
use bitmessage_core::address::Address;
use bitmessage_core::crypto::{ecdsa_verify, SignatureDigest};
use bitmessage_core::object::{
    BroadcastPlaintext, EncryptedBroadcastV4, EncryptedBroadcastV5, EncryptedPubkeyV4, InventoryVector,
    MsgPlaintext, ObjectMessage, ObjectType, Payload, PubkeyV3Body,
};
use bitmessage_core::pow::{self, PowEngine};
use bitmessage_net::inventory::{Inventory, InventoryEntry};
use parking_lot::RwLock;
use secp256k1::Secp256k1;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How long a fresh object lives before expiring, absent any per-message
/// override. PyBitmessage's own default is in this range.
pub const DEFAULT_TTL_SECONDS: i64 = 4 * 24 * 3600;
/// How long to wait before re-answering a `getpubkey` for the same identity
/// (spec.md §4.7, Open Question 1 -- left unenforced in the reference; this
/// is the supplemented enforcement).
pub const PUBKEY_REBROADCAST_GUARD_SECONDS: u64 = 28 * 24 * 3600;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Core(#[from] bitmessage_core::Error),
    #[error("proof-of-work search was aborted")]
    PowAborted,
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn worker_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Drives outbound sends and inbound object dispatch for one node.
pub struct Pipeline {
    address_book: Arc<InMemoryAddressBook>,
    messages: Arc<InMemoryMessageStore>,
    inventory: Arc<dyn Inventory>,
    pow_engine: Arc<PowEngine>,
    pow_queue: Arc<InMemoryPowQueue>,
    announce_tx: mpsc::Sender<InventoryVector>,
    subscriptions: RwLock<Vec<Subscription>>,
    last_pubkey_broadcast: RwLock<HashMap<Vec<u8>, u64>>,
    /// `ackData -> message id` for messages awaiting an ACK.
    pending_acks: RwLock<HashMap<Vec<u8>, u64>>,
    next_object_id: AtomicU64,
}

impl Pipeline {
    pub fn new(
        address_book: Arc<InMemoryAddressBook>,
        messages: Arc<InMemoryMessageStore>,
        inventory: Arc<dyn Inventory>,
        pow_engine: Arc<PowEngine>,
        pow_queue: Arc<InMemoryPowQueue>,
        announce_tx: mpsc::Sender<InventoryVector>,
        subscriptions: Vec<Subscription>,
    ) -> Self {
        Self {
            address_book,
            messages,
            inventory,
            pow_engine,
            pow_queue,
            announce_tx,
            subscriptions: RwLock::new(subscriptions),
            last_pubkey_broadcast: RwLock::new(HashMap::new()),
            pending_acks: RwLock::new(HashMap::new()),
            next_object_id: AtomicU64::new(1),
        }
    }

    /// Run a PoW search and flood the resulting sealed object.
    async fn seal_and_flood(
        &self,
        object_type: ObjectType,
        version: u64,
        stream: u64,
        payload: Vec<u8>,
    ) -> Result<ObjectMessage, PipelineError> {
        let now = unix_now();
        let expires_time = now + DEFAULT_TTL_SECONDS;
        let mut object = ObjectMessage {
            nonce: [0u8; 8],
            expires_time,
            object_type,
            version,
            stream,
            payload,
        };

        let initial_hash = object.pow_initial_hash();
        let payload_length = object.bytes_without_nonce().len() as u64;
        let target = pow::target_for(
            payload_length,
            DEFAULT_TTL_SECONDS,
            pow::DEFAULT_NONCE_TRIALS_PER_BYTE,
            pow::DEFAULT_EXTRA_BYTES,
        );

        let object_id = self.next_id();
        self.pow_queue.enqueue(PendingPow {
            object_id,
            initial_hash,
            target: target.clone(),
        });

        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let result = self
            .pow_engine
            .run(initial_hash, target, worker_count(), cancel_rx)
            .await;
        self.pow_queue.remove(object_id);
        let nonce = result.map_err(|_| PipelineError::PowAborted)?;
        object.nonce = nonce.to_be_bytes();

        let iv = object.inventory_vector();
        self.inventory.insert(
            iv,
            InventoryEntry {
                stream,
                expires_time,
                object: object.clone(),
            },
        );
        let _ = self.announce_tx.send(iv).await;
        Ok(object)
    }

    fn next_id(&self) -> u64 {
        self.next_object_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Outbound MSG flow (spec.md §4.7). If the recipient's pubkey is
    /// already known the message goes straight to proof-of-work; otherwise
    /// a `getpubkey` is flooded and the message is parked `PUBKEY_REQUESTED`
    /// until a matching `pubkey` arrives.
    pub async fn send_message(
        &self,
        from: &Identity,
        to: Address,
        subject: String,
        body: Vec<u8>,
        request_ack: bool,
    ) -> Result<u64, PipelineError> {
        let ack_data = if request_ack {
            bitmessage_core::crypto::random_bytes(32)
        } else {
            Vec::new()
        };

        let message = Message {
            id: 0,
            kind: MessageKind::Msg,
            from: from.address(),
            to: Some(to),
            subject,
            body,
            ack_data: ack_data.clone(),
            status: MessageStatus::Draft,
            labels: Vec::new(),
        };
        let id = self.messages.save(message);
        if request_ack {
            self.pending_acks.write().insert(ack_data, id);
        }

        let lookup_key: Vec<u8> = if to.version >= 4 { to.tag().to_vec() } else { to.ripe.to_vec() };
        if let Some(contact) = self.address_book.find_contact(&lookup_key) {
            if let Some(pubkey) = contact.pubkey.clone() {
                self.messages.update_status(id, MessageStatus::DoingProofOfWork);
                self.seal_and_send_msg(from, &contact.address, &pubkey, id).await?;
                return Ok(id);
            }
        }

        self.messages.update_status(id, MessageStatus::PubkeyRequested);
        let payload = if to.version >= 4 {
            let mut out = Vec::with_capacity(32);
            out.extend_from_slice(&to.tag());
            out
        } else {
            to.ripe.to_vec()
        };
        self.seal_and_flood(ObjectType::GetPubkey, to.version, to.stream, payload).await?;
        Ok(id)
    }

    async fn seal_and_send_msg(
        &self,
        from: &Identity,
        to: &Address,
        to_pubkey: &PubkeyV3Body,
        message_id: u64,
    ) -> Result<(), PipelineError> {
        let secp = Secp256k1::new();
        let now = unix_now();

        let mut plaintext = MsgPlaintext {
            sender_address_version: from.address().version,
            sender_stream: from.address().stream,
            behavior_bitfield: 0,
            sender_signing_pubkey: from.key.signing_pubkey(&secp),
            sender_encryption_pubkey: from.key.encryption_pubkey(&secp),
            nonce_trials_per_byte: from.nonce_trials_per_byte,
            extra_bytes: from.extra_bytes,
            destination_ripe: to.ripe,
            encoding: 2,
            message: self.messages.get(message_id).map(|m| m.body).unwrap_or_default(),
            ack_data: self.messages.get(message_id).map(|m| m.ack_data).unwrap_or_default(),
            signature: Vec::new(),
        };
        plaintext.sign(&from.key.signing_key, now + DEFAULT_TTL_SECONDS, to.stream);

        let encrypted = bitmessage_core::object::EncryptedMsg::encrypt(&to_pubkey.encryption_pubkey, &plaintext)?;
        let mut payload = Vec::new();
        payload.extend_from_slice(&encrypted.box_.to_bytes());

        self.seal_and_flood(ObjectType::Msg, 1, to.stream, payload).await?;
        self.messages.update_status(message_id, MessageStatus::Sent);
        Ok(())
    }

    /// Outbound BROADCAST flow: no pubkey lookup, encrypt to the
    /// sender-derived broadcast key.
    pub async fn send_broadcast(&self, from: &Identity, subject: String, body: Vec<u8>) -> Result<u64, PipelineError> {
        let secp = Secp256k1::new();
        let now = unix_now();
        let address = from.address();

        let message = Message {
            id: 0,
            kind: MessageKind::Broadcast,
            from: address,
            to: None,
            subject,
            body: body.clone(),
            ack_data: Vec::new(),
            status: MessageStatus::DoingProofOfWork,
            labels: Vec::new(),
        };
        let id = self.messages.save(message);

        let mut plaintext = BroadcastPlaintext {
            sender_address_version: address.version,
            sender_stream: address.stream,
            behavior_bitfield: 0,
            sender_signing_pubkey: from.key.signing_pubkey(&secp),
            sender_encryption_pubkey: from.key.encryption_pubkey(&secp),
            nonce_trials_per_byte: from.nonce_trials_per_byte,
            extra_bytes: from.extra_bytes,
            encoding: 2,
            message: body,
            signature: Vec::new(),
        };

        let payload = if address.version >= 5 {
            let encrypted = EncryptedBroadcastV5::encrypt(&address, &plaintext)?;
            encrypted.sign(&mut plaintext, &from.key.signing_key, now + DEFAULT_TTL_SECONDS, address.stream);
            let mut out = Vec::new();
            out.extend_from_slice(&encrypted.tag);
            out.extend_from_slice(&encrypted.box_.to_bytes());
            out
        } else {
            let encrypted = EncryptedBroadcastV4::encrypt(&address, &plaintext)?;
            EncryptedBroadcastV4::sign(&mut plaintext, &from.key.signing_key, now + DEFAULT_TTL_SECONDS, address.stream);
            encrypted.box_.to_bytes()
        };

        let version = if address.version >= 5 { 5 } else { 4 };
        self.seal_and_flood(ObjectType::Broadcast, version, address.stream, payload).await?;
        self.messages.update_status(id, MessageStatus::Sent);
        Ok(id)
    }

    /// Inbound dispatch (spec.md §4.7). Called by the network layer for
    /// every object accepted into the inventory.
    pub async fn handle_inbound_object(&self, object: &ObjectMessage) -> Result<(), PipelineError> {
        let payload = match object.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "dropping unparseable object payload");
                return Ok(());
            }
        };

        match payload {
            Payload::GetPubkeyRipe(ripe) => self.handle_get_pubkey(&ripe, object.stream).await?,
            Payload::GetPubkeyTag(tag) => self.handle_get_pubkey(&tag, object.stream).await?,
            Payload::PubkeyV2(body) => self.handle_pubkey_v2(body).await,
            Payload::PubkeyV3(body) => self.handle_pubkey_v2_v3(body, object.expires_time, object.stream).await,
            Payload::PubkeyV4(encrypted) => {
                self.handle_pubkey_v4(&encrypted, object.expires_time, object.stream).await
            }
            Payload::Msg(msg) => self.handle_msg(&msg.box_, object.expires_time, object.stream).await,
            Payload::BroadcastV4(b) => self.handle_broadcast(&b.box_, None, object.expires_time, object.stream),
            Payload::BroadcastV5(b) => self.handle_broadcast(&b.box_, Some(b.tag), object.expires_time, object.stream),
            Payload::Opaque(..) => {}
        }
        Ok(())
    }

    async fn handle_get_pubkey(&self, ripe_or_tag: &[u8], stream: u64) -> Result<(), PipelineError> {
        let Some(identity) = self.address_book.find_identity(ripe_or_tag) else {
            return Ok(());
        };
        let now = unix_now();
        {
            let guard = self.last_pubkey_broadcast.read();
            if let Some(last) = guard.get(ripe_or_tag) {
                if now as u64 - *last < PUBKEY_REBROADCAST_GUARD_SECONDS {
                    debug!("suppressing pubkey re-broadcast within guard window");
                    return Ok(());
                }
            }
        }

        let secp = Secp256k1::new();
        let address = identity.address();
        let mut body = PubkeyV3Body {
            behavior_bitfield: 0,
            signing_pubkey: identity.key.signing_pubkey(&secp),
            encryption_pubkey: identity.key.encryption_pubkey(&secp),
            nonce_trials_per_byte: identity.nonce_trials_per_byte,
            extra_bytes: identity.extra_bytes,
            signature: Vec::new(),
        };

        let payload = if address.version >= 4 {
            let tag = address.tag();
            body.sign(&identity.key.signing_key, now + DEFAULT_TTL_SECONDS, address.version, stream);
            let target_pubkey = {
                let secp = Secp256k1::new();
                let scalar = address.decryption_key()?;
                secp256k1::PublicKey::from_secret_key(&secp, &scalar)
            };
            let encrypted = EncryptedPubkeyV4::encrypt(&body, tag, &target_pubkey)?;
            let mut out = Vec::new();
            out.extend_from_slice(&tag);
            out.extend_from_slice(&encrypted.box_.to_bytes());
            out
        } else {
            body.sign(&identity.key.signing_key, now + DEFAULT_TTL_SECONDS, address.version, stream);
            let mut out = Vec::new();
            body.write(&mut out);
            out
        };

        self.seal_and_flood(ObjectType::Pubkey, address.version, stream, payload).await?;
        self.last_pubkey_broadcast.write().insert(ripe_or_tag.to_vec(), now as u64);
        Ok(())
    }

    /// v2 pubkeys carry no PoW parameters or signature (spec.md §4.4); store
    /// on trust, the way the reference client does for this legacy,
    /// deprecated version, filling in the PoW defaults every v3+ identity
    /// otherwise advertises for itself.
    async fn handle_pubkey_v2(&self, body: bitmessage_core::object::PubkeyV2Body) {
        let ripe = bitmessage_core::address::ripe_digest(&body.signing_pubkey, &body.encryption_pubkey);
        let pending = self.messages.find_by_status(MessageStatus::PubkeyRequested, None);
        let Some(address) = pending.iter().find_map(|m| m.to.filter(|a| a.ripe == ripe)) else {
            return;
        };
        let body = PubkeyV3Body {
            behavior_bitfield: body.behavior_bitfield,
            signing_pubkey: body.signing_pubkey,
            encryption_pubkey: body.encryption_pubkey,
            nonce_trials_per_byte: pow::DEFAULT_NONCE_TRIALS_PER_BYTE,
            extra_bytes: pow::DEFAULT_EXTRA_BYTES,
            signature: Vec::new(),
        };
        self.flush_pubkey_requests(address, body).await;
    }

    async fn handle_pubkey_v2_v3(&self, body: PubkeyV3Body, expires_time: i64, stream: u64) {
        let ripe = bitmessage_core::address::ripe_digest(&body.signing_pubkey, &body.encryption_pubkey);
        let pending = self.messages.find_by_status(MessageStatus::PubkeyRequested, None);
        let Some(address) = pending.iter().find_map(|m| m.to.filter(|a| a.ripe == ripe)) else {
            return;
        };
        if body.verify(expires_time, address.version, stream).is_err() {
            warn!("pubkey v3 signature verification failed");
            return;
        }
        self.flush_pubkey_requests(address, body).await;
    }

    async fn handle_pubkey_v4(&self, encrypted: &EncryptedPubkeyV4, expires_time: i64, stream: u64) {
        let pending = self.messages.find_by_status(MessageStatus::PubkeyRequested, None);
        for message in pending {
            let Some(address) = message.to else { continue };
            if address.version < 4 || address.tag() != encrypted.tag {
                continue;
            }
            let Ok(decryption_key) = address.decryption_key() else { continue };
            let Ok(body) = encrypted.decrypt(&decryption_key) else { continue };

            let preimage =
                EncryptedPubkeyV4::signing_preimage(&body, encrypted.tag, expires_time, address.version, stream);
            let digest = SignatureDigest::for_address_version(address.version);
            if ecdsa_verify(&body.signing_pubkey, &preimage, &body.signature, digest).is_err() {
                warn!("pubkey v4 signature verification failed");
                continue;
            }

            self.flush_pubkey_requests(address, body).await;
            return;
        }
    }

    /// Stores the newly learned pubkey as a contact, then sends every
    /// `PUBKEY_REQUESTED` message addressed to it (spec.md §4.7).
    async fn flush_pubkey_requests(&self, address: Address, pubkey: PubkeyV3Body) {
        self.address_book.save_contact(Contact {
            label: address.to_string_form(),
            address,
            pubkey: Some(pubkey.clone()),
        });

        let pending = self.messages.find_by_status(MessageStatus::PubkeyRequested, Some(&address));
        for message in pending {
            let lookup_key: Vec<u8> = if message.from.version >= 4 {
                message.from.tag().to_vec()
            } else {
                message.from.ripe.to_vec()
            };
            let Some(identity) = self.address_book.find_identity(&lookup_key) else {
                continue;
            };
            self.messages.update_status(message.id, MessageStatus::DoingProofOfWork);
            if let Err(e) = self.seal_and_send_msg(identity, &address, &pubkey, message.id).await {
                warn!(error = %e, "failed to seal a message pending pubkey arrival");
            }
        }
    }

    async fn handle_msg(&self, box_: &bitmessage_core::crypto::CryptoBox, expires_time: i64, stream: u64) {
        for identity in self.address_book.identities() {
            let Ok(plaintext_bytes) = box_.decrypt(&identity.key.encryption_key) else { continue };
            let Ok(plaintext) = MsgPlaintext::read(&plaintext_bytes) else { continue };

            if let Some(&message_id) = self.pending_acks.read().get(&plaintext.ack_data) {
                self.messages.update_status(message_id, MessageStatus::AckReceived);
                info!(message_id, "ack received");
                return;
            }

            if plaintext.verify(expires_time, stream).is_err() {
                warn!("msg signature verification failed after successful decryption");
                return;
            }

            let sender = Address::from_public_keys(
                plaintext.sender_address_version,
                plaintext.sender_stream,
                &plaintext.sender_signing_pubkey,
                &plaintext.sender_encryption_pubkey,
            );
            let ack_data = plaintext.ack_data.clone();
            let sender_signing_pubkey = plaintext.sender_signing_pubkey;
            let sender_encryption_pubkey = plaintext.sender_encryption_pubkey;
            let sender_stream = plaintext.sender_stream;

            let message = Message {
                id: 0,
                kind: MessageKind::Msg,
                from: sender,
                to: Some(identity.address()),
                subject: String::new(),
                body: plaintext.message,
                ack_data: plaintext.ack_data,
                status: MessageStatus::Received,
                labels: vec!["INBOX".into(), "UNREAD".into()],
            };
            self.messages.save(message);

            if !ack_data.is_empty() {
                if let Err(e) = self
                    .send_ack(identity, sender_signing_pubkey, sender_encryption_pubkey, sender_stream, ack_data)
                    .await
                {
                    warn!(error = %e, "failed to flood ack");
                }
            }
            return;
        }
    }

    /// Floods a tiny `msg` object carrying `ack_data` back to the peer that
    /// requested it, so their own `handle_msg` recognizes delivery via
    /// `pending_acks` (spec.md §9 Open Question 3).
    async fn send_ack(
        &self,
        from: &Identity,
        to_signing_pubkey: secp256k1::PublicKey,
        to_encryption_pubkey: secp256k1::PublicKey,
        to_stream: u64,
        ack_data: Vec<u8>,
    ) -> Result<(), PipelineError> {
        let secp = Secp256k1::new();
        let now = unix_now();
        let destination_ripe = bitmessage_core::address::ripe_digest(&to_signing_pubkey, &to_encryption_pubkey);

        let mut plaintext = MsgPlaintext {
            sender_address_version: from.address().version,
            sender_stream: from.address().stream,
            behavior_bitfield: 0,
            sender_signing_pubkey: from.key.signing_pubkey(&secp),
            sender_encryption_pubkey: from.key.encryption_pubkey(&secp),
            nonce_trials_per_byte: from.nonce_trials_per_byte,
            extra_bytes: from.extra_bytes,
            destination_ripe,
            encoding: 2,
            message: Vec::new(),
            ack_data,
            signature: Vec::new(),
        };
        plaintext.sign(&from.key.signing_key, now + DEFAULT_TTL_SECONDS, to_stream);

        let encrypted = bitmessage_core::object::EncryptedMsg::encrypt(&to_encryption_pubkey, &plaintext)?;
        let mut payload = Vec::new();
        payload.extend_from_slice(&encrypted.box_.to_bytes());

        self.seal_and_flood(ObjectType::Msg, 1, to_stream, payload).await?;
        info!("ack flooded");
        Ok(())
    }

    fn handle_broadcast(
        &self,
        box_: &bitmessage_core::crypto::CryptoBox,
        tag: Option<[u8; 32]>,
        expires_time: i64,
        stream: u64,
    ) {
        let subscriptions = self.subscriptions.read().clone();
        for subscription in subscriptions {
            if let Some(tag) = tag {
                if subscription.address.tag() != tag {
                    continue;
                }
            }
            let Ok(decryption_key) = subscription.address.decryption_key() else { continue };
            let Ok(plaintext_bytes) = box_.decrypt(&decryption_key) else { continue };
            let Ok(plaintext) = BroadcastPlaintext::read(&plaintext_bytes) else { continue };

            let verified = match tag {
                Some(tag) => {
                    let envelope = EncryptedBroadcastV5 { tag, box_: box_.clone() };
                    envelope.verify(&plaintext, expires_time, stream)
                }
                None => EncryptedBroadcastV4::verify(&plaintext, expires_time, stream),
            };
            if verified.is_err() {
                warn!("broadcast signature verification failed after successful decryption");
                return;
            }

            let sender = Address::from_public_keys(
                plaintext.sender_address_version,
                plaintext.sender_stream,
                &plaintext.sender_signing_pubkey,
                &plaintext.sender_encryption_pubkey,
            );
            let message = Message {
                id: 0,
                kind: MessageKind::Broadcast,
                from: sender,
                to: None,
                subject: String::new(),
                body: plaintext.message,
                ack_data: Vec::new(),
                status: MessageStatus::Received,
                labels: vec!["INBOX".into(), "BROADCAST".into(), "UNREAD".into()],
            };
            self.messages.save(message);
            return;
        }
    }
}
