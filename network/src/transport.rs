//! Datagram transport behind a narrow trait.
//!
//! The scheduler only ever needs to hand a finished packet to a peer,
//! poll for inbound datagrams, and ask who is connected; everything else
//! (sockets, address bookkeeping) stays in here. Tests drive the mix
//! pipeline with an in-memory implementation of the same trait.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::net::SocketAddr;

use log::{debug, info, warn};
use mixer_core::{Error, PeerId};
use tokio::net::UdpSocket;

use crate::protocol::{Datagram, MAX_UDP_PAYLOAD_SIZE};

/// Best-effort datagram channel between the mixer and its peers.
pub trait Transport {
    /// Send one packet to a peer. May drop under backpressure; never
    /// blocks longer than the tick.
    fn send_datagram(&mut self, peer: PeerId, payload: &[u8]) -> Result<(), Error>;

    /// Drain every datagram that has arrived since the last call,
    /// without blocking. Datagrams from unknown sources have already
    /// been dropped.
    fn receive_datagrams(&mut self) -> Vec<Datagram>;

    fn is_connected(&self, peer: PeerId) -> bool;

    /// Connected peers in a stable order.
    fn connected_peers(&self) -> Vec<PeerId>;
}

/// UDP transport bound to one socket, with an address-to-peer table.
pub struct UdpTransport {
    socket: UdpSocket,
    peers_by_addr: HashMap<SocketAddr, PeerId>,
    addrs_by_peer: BTreeMap<PeerId, SocketAddr>,
    /// Assign a fresh `PeerId` to any unknown sender instead of
    /// dropping it. Registration normally belongs to the hosting
    /// process; this keeps a standalone mixer usable.
    accept_unregistered: bool,
    unknown_dropped: u64,
    recv_buf: Vec<u8>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr, accept_unregistered: bool) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Error::Network(format!("failed to bind UDP socket: {}", e)))?;
        info!(
            "mixer transport bound to {}",
            socket
                .local_addr()
                .map_err(|e| Error::Network(format!("failed to get local address: {}", e)))?
        );
        Ok(Self {
            socket,
            peers_by_addr: HashMap::new(),
            addrs_by_peer: BTreeMap::new(),
            accept_unregistered,
            unknown_dropped: 0,
            recv_buf: vec![0u8; MAX_UDP_PAYLOAD_SIZE],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.socket
            .local_addr()
            .map_err(|e| Error::Network(format!("failed to get local address: {}", e)))
    }

    /// Register a peer's address, returning its new id.
    pub fn register_peer(&mut self, addr: SocketAddr) -> PeerId {
        if let Some(existing) = self.peers_by_addr.get(&addr) {
            return *existing;
        }
        let peer = PeerId::new();
        self.peers_by_addr.insert(addr, peer);
        self.addrs_by_peer.insert(peer, addr);
        debug!("registered peer {} at {}", peer, addr);
        peer
    }

    pub fn deregister_peer(&mut self, peer: PeerId) -> bool {
        match self.addrs_by_peer.remove(&peer) {
            Some(addr) => {
                self.peers_by_addr.remove(&addr);
                true
            }
            None => false,
        }
    }

    /// Datagrams dropped because their sender was unknown.
    pub fn unknown_dropped(&self) -> u64 {
        self.unknown_dropped
    }
}

impl Transport for UdpTransport {
    fn send_datagram(&mut self, peer: PeerId, payload: &[u8]) -> Result<(), Error> {
        let addr = self
            .addrs_by_peer
            .get(&peer)
            .copied()
            .ok_or_else(|| Error::Network(format!("peer {} has no address", peer)))?;
        match self.socket.try_send_to(payload, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(Error::Backpressure(peer)),
            Err(e) => Err(Error::Network(format!("send to {} failed: {}", addr, e))),
        }
    }

    fn receive_datagrams(&mut self) -> Vec<Datagram> {
        let mut datagrams = Vec::new();
        loop {
            match self.socket.try_recv_from(&mut self.recv_buf) {
                Ok((len, addr)) => {
                    let peer = match self.peers_by_addr.get(&addr) {
                        Some(peer) => *peer,
                        None if self.accept_unregistered => self.register_peer(addr),
                        None => {
                            // Unregistered senders are dropped silently.
                            self.unknown_dropped += 1;
                            continue;
                        }
                    };
                    datagrams.push((peer, self.recv_buf[..len].to_vec()));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("error receiving from socket: {}", e);
                    break;
                }
            }
        }
        datagrams
    }

    fn is_connected(&self, peer: PeerId) -> bool {
        self.addrs_by_peer.contains_key(&peer)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.addrs_by_peer.keys().copied().collect()
    }
}
