//! Per-connection handshake and gossip loop (spec.md §4.6).
//!
//! Each accepted or dialed TCP connection is driven by one
//! [`ConnectionActor`] task: a private state machine plus the active-state
//! gossip behavior (advertise/fetch/serve/accept). Nothing here persists
//! anything; the [`Inventory`] and [`NodeRegistry`] ports own that.

use crate::framing::{Frame, FrameCodec, FrameError};
use crate::inventory::{Inventory, InventoryEntry};
use crate::messages::{AddrMessage, InventoryVectorList, VersionMessage, PROTOCOL_VERSION};
use crate::registry::NodeRegistry;
use bitmessage_core::object::{InventoryVector, ObjectMessage};
use bitmessage_core::pow;
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Reject a peer whose `version.timestamp` differs from ours by more than
/// this many seconds.
pub const MAX_CLOCK_SKEW_SECONDS: i64 = 3600;
/// How many peers to advertise a freshly accepted object to.
pub const FLOOD_FANOUT: usize = 8;
/// Reject objects expired more than this long ago.
const ACCEPT_PAST_WINDOW_SECONDS: i64 = 3 * 3600;
/// Reject objects claiming to expire further than this into the future.
const ACCEPT_FUTURE_WINDOW_SECONDS: i64 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    VersionSent,
    Verified,
    Active,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("peer's version nonce matches our own (self-connect)")]
    SelfConnect,
    #[error("peer protocol version {0} is below the minimum {PROTOCOL_VERSION}")]
    ProtocolTooOld(u32),
    #[error("peer shares no stream with us")]
    NoSharedStream,
    #[error("peer clock skew of {0}s exceeds the {MAX_CLOCK_SKEW_SECONDS}s limit")]
    ClockSkew(i64),
    #[error("frame received before handshake completed: {0}")]
    UnexpectedFrame(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Wire(#[from] bitmessage_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reject rules applied to a peer's `version` message (spec.md §4.6).
pub fn validate_peer_version(
    ours: &VersionMessage,
    theirs: &VersionMessage,
    now: i64,
) -> Result<(), ConnectionError> {
    if theirs.nonce == ours.nonce {
        return Err(ConnectionError::SelfConnect);
    }
    if theirs.protocol < PROTOCOL_VERSION {
        return Err(ConnectionError::ProtocolTooOld(theirs.protocol));
    }
    if !ours.streams.iter().any(|s| theirs.streams.contains(s)) {
        return Err(ConnectionError::NoSharedStream);
    }
    if (theirs.timestamp - now).abs() > MAX_CLOCK_SKEW_SECONDS {
        return Err(ConnectionError::ClockSkew(theirs.timestamp - now));
    }
    Ok(())
}

/// The per-object checks gating acceptance into the inventory (spec.md
/// §4.6's "Object acceptance check"). Checks 1-3 fail silently per spec;
/// the caller is expected to treat a parse failure or bad PoW (4) as
/// grounds to consider disconnecting a misbehaving peer.
pub fn passes_silent_checks(object: &ObjectMessage, subscribed_streams: &[u64], now: i64) -> bool {
    let not_too_old = object.expires_time > now - ACCEPT_PAST_WINDOW_SECONDS;
    let not_too_future = object.expires_time <= now + ACCEPT_FUTURE_WINDOW_SECONDS;
    let stream_ok = subscribed_streams.contains(&object.stream);
    not_too_old && not_too_future && stream_ok
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Drives one connection's handshake and active-state gossip loop.
pub struct ConnectionActor {
    framed: Framed<TcpStream, FrameCodec>,
    state: ConnState,
    our_version: VersionMessage,
    peer_version: Option<VersionMessage>,
    peer_verack_received: bool,
    our_verack_sent: bool,
    advertised: HashSet<InventoryVector>,
    inventory: Arc<dyn Inventory>,
    registry: Arc<dyn NodeRegistry>,
    accepted_tx: mpsc::Sender<ObjectMessage>,
    announce_rx: mpsc::Receiver<InventoryVector>,
    idle_timeout: Duration,
}

impl ConnectionActor {
    pub fn new(
        stream: TcpStream,
        our_version: VersionMessage,
        inventory: Arc<dyn Inventory>,
        registry: Arc<dyn NodeRegistry>,
        accepted_tx: mpsc::Sender<ObjectMessage>,
        announce_rx: mpsc::Receiver<InventoryVector>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec),
            state: ConnState::Connecting,
            our_version,
            peer_version: None,
            peer_verack_received: false,
            our_verack_sent: false,
            advertised: HashSet::new(),
            inventory,
            registry,
            accepted_tx,
            announce_rx,
            idle_timeout,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Drive the connection until it closes or a protocol violation occurs.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        self.framed
            .send(Frame::new("version", self.our_version.write()))
            .await?;
        self.state = ConnState::VersionSent;

        let mut last_activity = Instant::now();

        loop {
            let idle_deadline = last_activity + self.idle_timeout;
            tokio::select! {
                frame = self.framed.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            last_activity = Instant::now();
                            if let Err(e) = self.handle_frame(frame).await {
                                warn!(error = %e, "disconnecting misbehaving peer");
                                self.state = ConnState::Disconnected;
                                return Err(e);
                            }
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            self.state = ConnState::Disconnected;
                            return Ok(());
                        }
                    }
                }
                Some(iv) = self.announce_rx.recv() => {
                    self.advertise(iv).await?;
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    info!(idle_secs = self.idle_timeout.as_secs(), "closing idle connection");
                    self.state = ConnState::Disconnected;
                    return Ok(());
                }
            }

            if self.state == ConnState::Disconnected {
                return Ok(());
            }
        }
    }

    async fn advertise(&mut self, iv: InventoryVector) -> Result<(), ConnectionError> {
        if self.state != ConnState::Active || self.advertised.contains(&iv) {
            return Ok(());
        }
        self.framed
            .send(Frame::new("inv", InventoryVectorList::new(vec![iv]).write()))
            .await?;
        self.advertised.insert(iv);
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        match frame.command.as_str() {
            "version" => self.handle_version(&frame.payload).await,
            "verack" => self.handle_verack().await,
            "addr" => self.handle_addr(&frame.payload),
            "inv" => self.handle_inv(&frame.payload).await,
            "getdata" => self.handle_getdata(&frame.payload).await,
            "object" => self.handle_object(&frame.payload).await,
            other => {
                debug!(command = other, "ignoring unrecognized command");
                Ok(())
            }
        }
    }

    async fn handle_version(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.peer_version.is_some() {
            return Err(ConnectionError::UnexpectedFrame("duplicate version".into()));
        }
        let theirs = VersionMessage::read(payload)?;
        validate_peer_version(&self.our_version, &theirs, unix_now())?;

        self.registry
            .record(theirs.sender.stream, theirs.sender, unix_now());

        self.framed.send(Frame::new("verack", Vec::new())).await?;
        self.our_verack_sent = true;
        self.peer_version = Some(theirs);
        self.maybe_activate().await
    }

    async fn handle_verack(&mut self) -> Result<(), ConnectionError> {
        self.peer_verack_received = true;
        self.maybe_activate().await
    }

    async fn maybe_activate(&mut self) -> Result<(), ConnectionError> {
        if self.peer_version.is_none() {
            return Ok(());
        }
        self.state = ConnState::Verified;
        if !self.peer_verack_received || !self.our_verack_sent {
            return Ok(());
        }

        self.state = ConnState::Active;
        info!("connection active");

        let streams = self.our_version.streams.clone();
        let mut known = Vec::new();
        for stream in &streams {
            known.extend(
                self.registry
                    .known_for_stream(*stream, AddrMessage::MAX_ADDRESSES)
                    .into_iter()
                    .map(|n| n.address),
            );
        }
        known.truncate(AddrMessage::MAX_ADDRESSES);
        if !known.is_empty() {
            let addr = AddrMessage { addresses: known };
            self.framed.send(Frame::new("addr", addr.write())).await?;
        }

        let mut ivs = Vec::new();
        for stream in &streams {
            ivs.extend(self.inventory.ivs_for_stream(*stream));
        }
        if !ivs.is_empty() {
            self.advertised.extend(ivs.iter().copied());
            self.framed
                .send(Frame::new("inv", InventoryVectorList::new(ivs).write()))
                .await?;
        }

        Ok(())
    }

    fn handle_addr(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        let addr = AddrMessage::read(payload)?;
        let now = unix_now();
        for address in addr.addresses {
            if address.ip == crate::peer::UNROUTABLE {
                continue;
            }
            self.registry.record(address.stream, address, now);
        }
        Ok(())
    }

    async fn handle_inv(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        let list = InventoryVectorList::read(payload)?;
        let missing: Vec<InventoryVector> = list
            .ivs
            .into_iter()
            .filter(|iv| !self.inventory.contains(iv))
            .collect();
        if !missing.is_empty() {
            self.framed
                .send(Frame::new("getdata", InventoryVectorList::new(missing).write()))
                .await?;
        }
        Ok(())
    }

    async fn handle_getdata(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        let list = InventoryVectorList::read(payload)?;
        for iv in list.ivs {
            if let Some(entry) = self.inventory.get(&iv) {
                self.framed
                    .send(Frame::new("object", entry.object.to_bytes()))
                    .await?;
                self.advertised.insert(iv);
            }
        }
        Ok(())
    }

    async fn handle_object(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        let object = match ObjectMessage::from_bytes(payload) {
            Ok(object) => object,
            Err(e) => {
                warn!(error = %e, "dropping unparseable object");
                return Ok(());
            }
        };

        let now = unix_now();
        if !passes_silent_checks(&object, &self.our_version.streams, now) {
            debug!("object failed silent acceptance checks");
            return Ok(());
        }

        let payload_length = object.bytes_without_nonce().len() as u64;
        if pow::validate(
            &object.pow_initial_hash(),
            u64::from_be_bytes(object.nonce),
            payload_length,
            object.expires_time - now,
            pow::DEFAULT_NONCE_TRIALS_PER_BYTE,
            pow::DEFAULT_EXTRA_BYTES,
        )
        .is_err()
        {
            warn!("object failed proof-of-work check");
            return Ok(());
        }

        let iv = object.inventory_vector();
        let entry = InventoryEntry {
            stream: object.stream,
            expires_time: object.expires_time,
            object: object.clone(),
        };
        if !self.inventory.insert(iv, entry) {
            return Ok(()); // already present; do not re-notify or re-advertise
        }

        self.advertised.insert(iv);
        let _ = self.accepted_tx.send(object).await;
        Ok(())
    }
}
