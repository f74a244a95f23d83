//! Repository ports consumed by the send/receive pipeline (spec.md §6).
//!
//! `Inventory` and `NodeRegistry` already live in `bitmessage-net` next to
//! the `ConnectionActor` that drives them directly; the ports here are the
//! ones the pipeline itself owns: identities/contacts/subscriptions,
//! messages, and the durable proof-of-work queue. Each trait is backed by
//! an in-memory default so the daemon runs without an external store;
//! persistence itself is an external port's concern (spec.md §1).

use bitmessage_core::address::{Address, PrivateKey};
use bitmessage_core::object::PubkeyV3Body;
use num_bigint::BigUint;
use parking_lot::RwLock;
use std::collections::HashMap;

/// A local identity: an address with its private key and the PoW
/// parameters it advertises to senders.
pub struct Identity {
    pub label: String,
    pub key: PrivateKey,
    pub nonce_trials_per_byte: u64,
    pub extra_bytes: u64,
}

impl Identity {
    pub fn address(&self) -> Address {
        self.key.address
    }
}

/// A remote address we have learned a pubkey for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contact {
    pub label: String,
    pub address: Address,
    pub pubkey: Option<PubkeyV3Body>,
}

/// A broadcast sender we have chosen to receive from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub label: String,
    pub address: Address,
}

/// Look up an address record by its 20-byte RIPE (v2/v3) or 32-byte tag
/// (v4+), whichever the caller has on hand.
fn matches_ripe_or_tag(address: &Address, key: &[u8]) -> bool {
    match key.len() {
        20 => address.ripe == key,
        32 => address.tag().as_slice() == key,
        _ => false,
    }
}

/// `AddressRepository` (spec.md §6): identities, contacts, and broadcast
/// subscriptions. Identities are generated once and kept
/// for the process lifetime; a persistent implementation would load/save
/// them from disk instead.
#[derive(Default)]
pub struct InMemoryAddressBook {
    identities: Vec<Identity>,
    contacts: RwLock<Vec<Contact>>,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl InMemoryAddressBook {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self {
            identities,
            contacts: RwLock::new(Vec::new()),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn find_identity(&self, ripe_or_tag: &[u8]) -> Option<&Identity> {
        self.identities
            .iter()
            .find(|id| matches_ripe_or_tag(&id.address(), ripe_or_tag))
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts.read().clone()
    }

    pub fn find_contact(&self, ripe_or_tag: &[u8]) -> Option<Contact> {
        self.contacts
            .read()
            .iter()
            .find(|c| matches_ripe_or_tag(&c.address, ripe_or_tag))
            .cloned()
    }

    pub fn save_contact(&self, contact: Contact) {
        let mut contacts = self.contacts.write();
        if let Some(existing) = contacts.iter_mut().find(|c| c.address == contact.address) {
            *existing = contact;
        } else {
            contacts.push(contact);
        }
    }

    pub fn subscriptions(&self, version: Option<u64>) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| version.map(|v| s.address.version == v).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn save_subscription(&self, subscription: Subscription) {
        self.subscriptions.write().push(subscription);
    }

    pub fn remove_contact(&self, ripe_or_tag: &[u8]) {
        self.contacts.write().retain(|c| !matches_ripe_or_tag(&c.address, ripe_or_tag));
    }
}

/// Lifecycle of an outbound/inbound message (spec.md §1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Draft,
    PubkeyRequested,
    DoingProofOfWork,
    Sent,
    Received,
    AckReceived,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Msg,
    Broadcast,
}

/// An application-level message, the higher-level counterpart to an object's
/// decrypted [`bitmessage_core::object::MsgPlaintext`] / `BroadcastPlaintext`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub kind: MessageKind,
    pub from: Address,
    pub to: Option<Address>,
    pub subject: String,
    pub body: Vec<u8>,
    pub ack_data: Vec<u8>,
    pub status: MessageStatus,
    pub labels: Vec<String>,
}

/// `MessageRepository` (spec.md §6), backed in-memory by an id-keyed map.
#[derive(Default)]
pub struct InMemoryMessageStore {
    next_id: RwLock<u64>,
    messages: RwLock<HashMap<u64, Message>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, mut message: Message) -> u64 {
        if message.id == 0 {
            let mut next_id = self.next_id.write();
            *next_id += 1;
            message.id = *next_id;
        }
        let id = message.id;
        self.messages.write().insert(id, message);
        id
    }

    pub fn get(&self, id: u64) -> Option<Message> {
        self.messages.read().get(&id).cloned()
    }

    pub fn update_status(&self, id: u64, status: MessageStatus) {
        if let Some(message) = self.messages.write().get_mut(&id) {
            message.status = status;
        }
    }

    pub fn find_by_status(&self, status: MessageStatus, recipient: Option<&Address>) -> Vec<Message> {
        self.messages
            .read()
            .values()
            .filter(|m| m.status == status)
            .filter(|m| recipient.map(|r| m.to.as_ref() == Some(r)).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn find_by_label(&self, label: &str) -> Vec<Message> {
        self.messages
            .read()
            .values()
            .filter(|m| m.labels.iter().any(|l| l == label))
            .cloned()
            .collect()
    }

    pub fn remove(&self, id: u64) {
        self.messages.write().remove(&id);
    }
}

/// A unit of work awaiting (or mid-) proof-of-work, durable across restarts
/// in a real implementation so an in-progress search is not lost to a crash.
#[derive(Clone, Debug)]
pub struct PendingPow {
    pub object_id: u64,
    pub initial_hash: [u8; 64],
    pub target: BigUint,
}

/// `ProofOfWorkRepository` (spec.md §6).
#[derive(Default)]
pub struct InMemoryPowQueue {
    items: RwLock<Vec<PendingPow>>,
}

impl InMemoryPowQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, item: PendingPow) {
        self.items.write().push(item);
    }

    pub fn dequeue(&self) -> Option<PendingPow> {
        self.items.write().pop()
    }

    pub fn remove(&self, object_id: u64) {
        self.items.write().retain(|i| i.object_id != object_id);
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
