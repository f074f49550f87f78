//! Transport capability consumed by the dispatcher.
//!
//! The core does not establish connections or elect the authoritative peer;
//! it only needs the narrow [`Transport`] interface. [`LoopbackHub`] is an
//! in-process implementation (ordered, reliable, crossbeam-channel backed)
//! used by the simulator and the tests.

use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Identifier of a peer on the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// An opaque message together with the peer that sent it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub from: PeerId,
    pub payload: Vec<u8>,
}

/// Ordered, reliable message delivery between peers.
///
/// Implementations must deliver each message exactly once per recipient,
/// in send order.
pub trait Transport {
    /// Identity of the local peer.
    fn local_peer(&self) -> PeerId;

    /// Whether the local peer is currently the authoritative relay.
    fn is_authoritative(&self) -> bool;

    /// Send to every peer, including the local one.
    fn send_to_all(&mut self, payload: &[u8]) -> Result<()>;

    /// Send to the authoritative peer only.
    fn send_to_authority(&mut self, payload: &[u8]) -> Result<()>;

    /// Take the next received message, if any.
    fn try_recv(&mut self) -> Option<Envelope>;
}

#[derive(Default)]
struct HubState {
    peers: Vec<(PeerId, Sender<Envelope>)>,
    authority: Option<PeerId>,
    next_peer: u32,
}

/// In-process network connecting any number of [`LoopbackEndpoint`]s.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<RwLock<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer to the network. The first peer to join becomes authoritative.
    pub fn join(&self) -> LoopbackEndpoint {
        let (tx, rx) = unbounded();
        let mut state = self.state.write().expect("Hub lock poisoned");
        let id = PeerId(state.next_peer);
        state.next_peer += 1;
        state.peers.push((id, tx));
        if state.authority.is_none() {
            state.authority = Some(id);
        }
        log::debug!("[TRANSPORT] {} joined ({} peers)", id, state.peers.len());
        LoopbackEndpoint {
            id,
            hub: self.clone(),
            inbox: rx,
        }
    }

    /// Hand the authoritative role to another peer.
    pub fn set_authority(&self, peer: PeerId) {
        let mut state = self.state.write().expect("Hub lock poisoned");
        log::info!("[TRANSPORT] Authority moves from {:?} to {}", state.authority, peer);
        state.authority = Some(peer);
    }

    /// The current authoritative peer.
    pub fn authority(&self) -> Option<PeerId> {
        self.state.read().expect("Hub lock poisoned").authority
    }

    fn deliver(&self, from: PeerId, to: Option<PeerId>, payload: &[u8]) -> Result<()> {
        let state = self.state.read().expect("Hub lock poisoned");
        for (peer, tx) in &state.peers {
            if to.is_some_and(|target| target != *peer) {
                continue;
            }
            tx.send(Envelope {
                from,
                payload: payload.to_vec(),
            })
            .map_err(|e| Error::Transport(format!("delivery to {} failed: {}", peer, e)))?;
        }
        Ok(())
    }

    fn remove(&self, peer: PeerId) {
        let mut state = self.state.write().expect("Hub lock poisoned");
        state.peers.retain(|(id, _)| *id != peer);
        if state.authority == Some(peer) {
            state.authority = None;
        }
    }
}

impl fmt::Debug for LoopbackHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().expect("Hub lock poisoned");
        f.debug_struct("LoopbackHub")
            .field("peers", &state.peers.len())
            .field("authority", &state.authority)
            .finish()
    }
}

/// One peer's connection to a [`LoopbackHub`].
///
/// Dropping the endpoint removes the peer from the network.
pub struct LoopbackEndpoint {
    id: PeerId,
    hub: LoopbackHub,
    inbox: Receiver<Envelope>,
}

impl LoopbackEndpoint {
    /// Number of messages waiting to be received.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

impl Transport for LoopbackEndpoint {
    fn local_peer(&self) -> PeerId {
        self.id
    }

    fn is_authoritative(&self) -> bool {
        self.hub.authority() == Some(self.id)
    }

    fn send_to_all(&mut self, payload: &[u8]) -> Result<()> {
        self.hub.deliver(self.id, None, payload)
    }

    fn send_to_authority(&mut self, payload: &[u8]) -> Result<()> {
        let authority = self
            .hub
            .authority()
            .ok_or_else(|| Error::Transport("no authoritative peer".to_string()))?;
        self.hub.deliver(self.id, Some(authority), payload)
    }

    fn try_recv(&mut self) -> Option<Envelope> {
        match self.inbox.try_recv() {
            Ok(envelope) => Some(envelope),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                log::warn!("[TRANSPORT] {} inbox disconnected", self.id);
                None
            }
        }
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.hub.remove(self.id);
    }
}

impl fmt::Debug for LoopbackEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackEndpoint")
            .field("id", &self.id)
            .field("pending", &self.inbox.len())
            .finish()
    }
}
