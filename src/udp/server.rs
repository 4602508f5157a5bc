use super::bind_socket;
use crate::config::ServerConfig;
use crate::proto::{self, Message, Status, MAX_DATAGRAM_SIZE};
use crate::registry::{Registry, Session, SessionStatus};
use std::collections::HashMap;
use std::io::{Error, ErrorKind::Other, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};
use tokio::{select, time::interval};

/// Udp rendezvous server
///
/// keep traces of all peers, pair up connection requests and hand each pair
/// a relay peer to talk through.
pub struct Server {
    socket: UdpSocket,
    registry: Arc<Registry>,
    config: ServerConfig,
}

impl Server {
    pub async fn new<A: ToSocketAddrs>(listen_addr: A) -> Result<Self> {
        Self::with_config(listen_addr, ServerConfig::default()).await
    }

    pub async fn with_config<A: ToSocketAddrs>(listen_addr: A, config: ServerConfig) -> Result<Self> {
        let listen_addr = lookup_host(listen_addr)
            .await?
            .next()
            .ok_or_else(|| Error::new(Other, "no addr"))?;
        let socket = bind_socket(listen_addr)?;

        Ok(Self {
            socket,
            registry: Default::default(),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub async fn run(self) -> Result<()> {
        log::info!("rendezvous server listening on {}", self.socket.local_addr()?);

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut gc = interval(self.config.gc_interval);

        loop {
            select! {
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok((size, addr)) => match proto::decode(&buf[..size]) {
                        Ok(msg) => self.handle_message(msg, addr).await,
                        Err(e) => log::warn!("drop malformed datagram from {}: {}", addr, e),
                    },
                    Err(e) => log::debug!("recv error {}", e),
                },
                _ = gc.tick() => self.gc().await,
            }
        }
    }

    async fn handle_message(&self, msg: Message, addr: SocketAddr) {
        log::trace!("{} from {}", msg.tag(), addr);

        match msg {
            Message::Register { peer_id, is_relay } => {
                self.handle_register(peer_id, is_relay, addr).await
            }
            Message::Keepalive { peer_id } => self.handle_keepalive(peer_id, addr).await,
            Message::Bye { peer_id } => self.handle_bye(peer_id, addr).await,
            Message::ConnectRequest { from_peer, to_peer } => {
                self.handle_connect_request(from_peer, to_peer, addr).await
            }
            Message::AcceptConnection { from_peer } => self.handle_accept(from_peer, addr).await,
            Message::RelayReady { session_id, ports } => {
                self.handle_relay_ready(session_id, ports, addr).await
            }
            Message::SessionClose { session_id } => {
                self.handle_session_close(session_id, addr).await
            }
            Message::Error { message, .. } => log::debug!("{} reported error: {}", addr, message),
            msg @ (Message::RegisterResponse { .. }
            | Message::IncomingConnection { .. }
            | Message::RelaySetup { .. }
            | Message::RelayInfo { .. }
            | Message::RelayData { .. }) => {
                log::warn!("unexpected {} from {}", msg.tag(), addr)
            }
        }
    }

    async fn send(&self, msg: &Message, addr: SocketAddr) {
        let buf = match proto::encode(msg) {
            Ok(buf) => buf,
            Err(e) => {
                log::warn!("failed to encode {}: {}", msg.tag(), e);
                return;
            }
        };

        if let Err(e) = self.socket.send_to(&buf, addr).await {
            log::warn!("send {} to {} failed: {}", msg.tag(), addr, e);
        }
    }

    async fn send_to_peer(&self, msg: &Message, peer_id: &str) {
        match self.registry.get_peer_address(peer_id) {
            Some(addr) => self.send(msg, addr).await,
            None => log::debug!("{} not delivered, peer {} unknown", msg.tag(), peer_id),
        }
    }

    async fn handle_register(&self, peer_id: String, is_relay: bool, addr: SocketAddr) {
        if peer_id.is_empty() {
            log::warn!("register with empty peer id from {}", addr);
            return;
        }

        log::info!("register {} at {} relay={}", peer_id, addr, is_relay);
        if let Some(old) = self.registry.register_peer(&peer_id, addr, is_relay) {
            log::info!("{} replaces {} at {}", peer_id, old, addr);
            self.close_sessions_of(&old).await;
        }

        self.send(
            &Message::RegisterResponse {
                status: Status::Success,
            },
            addr,
        )
        .await;
    }

    async fn handle_keepalive(&self, peer_id: String, addr: SocketAddr) {
        log::trace!("keepalive {}", peer_id);

        if !self.registry.touch_peer(&peer_id, addr) {
            log::debug!("keepalive from unregistered peer {} at {}", peer_id, addr);
            self.send(&Message::error(proto::ERR_NOT_REGISTERED), addr)
                .await;
        }
    }

    async fn handle_bye(&self, peer_id: String, addr: SocketAddr) {
        if self.registry.get_peer_address(&peer_id) != Some(addr) {
            log::debug!("ignore bye for {} from foreign address {}", peer_id, addr);
            return;
        }

        log::debug!("bye {}", peer_id);
        self.close_sessions_of(&peer_id).await;
        self.registry.remove_peer(&peer_id);
    }

    /// Close every session `peer_id` takes part in and tell the others.
    async fn close_sessions_of(&self, peer_id: &str) {
        for s in self.registry.sessions_of(peer_id) {
            if let Some(s) = self.registry.close_session(&s.session_id) {
                log::info!("session {} closed, {} left", s.session_id, peer_id);
                self.notify_close(&s, Some(peer_id)).await;
            }
        }
    }

    async fn handle_connect_request(&self, from_peer: String, to_peer: String, addr: SocketAddr) {
        log::debug!("connect_request {} -> {}", from_peer, to_peer);

        if !self.registry.touch_peer(&from_peer, addr) {
            log::debug!("connect_request from unregistered peer {}", from_peer);
            self.send(&Message::error(proto::ERR_NOT_REGISTERED), addr)
                .await;
            return;
        }

        if from_peer == to_peer {
            self.send(&Message::error("Cannot connect to self"), addr).await;
            return;
        }

        let target_addr = match self.registry.get_peer_address(&to_peer) {
            Some(target_addr) => target_addr,
            None => {
                log::debug!("target id {} not found", to_peer);
                self.send(&Message::error("Peer not found"), addr).await;
                return;
            }
        };

        // a retransmitted request reuses the in-flight handshake
        let session_id = match self.registry.find_pending_connection(&from_peer, &to_peer) {
            Some(p) => p.session_id,
            None => {
                let session_id = proto::new_session_id();
                self.registry
                    .create_pending_connection(&session_id, &from_peer, &to_peer);
                session_id
            }
        };
        log::debug!("pending {} for {} -> {}", session_id, from_peer, to_peer);

        self.send(
            &Message::IncomingConnection {
                from_peer,
                session_id: Some(session_id),
            },
            target_addr,
        )
        .await;
    }

    /// First relay in registration order that is not an endpoint of the session.
    fn select_relay(&self, peer_a: &str, peer_b: &str) -> Option<String> {
        self.registry
            .list_available_relays()
            .into_iter()
            .find(|r| r != peer_a && r != peer_b)
    }

    async fn handle_accept(&self, from_peer: String, addr: SocketAddr) {
        let acceptor = match self.registry.get_peer_id_by_address(addr) {
            Some(id) => id,
            None => {
                log::warn!("accept_connection from unknown address {}", addr);
                return;
            }
        };
        self.registry.touch_peer(&acceptor, addr);

        let pending = match self.registry.find_pending_connection(&from_peer, &acceptor) {
            Some(p) => p,
            None => {
                log::debug!("no pending connection {} -> {}", from_peer, acceptor);
                return;
            }
        };

        let relay = match self.select_relay(&from_peer, &acceptor) {
            Some(relay) => relay,
            None => {
                log::info!("no relay for {} <-> {}", from_peer, acceptor);
                self.registry.consume_pending_connection(&pending.session_id);

                let err = Message::session_error("No relay peers available", &pending.session_id);
                self.send(&err, addr).await;
                self.send_to_peer(&err, &from_peer).await;
                return;
            }
        };

        self.registry.consume_pending_connection(&pending.session_id);
        let session =
            match self
                .registry
                .create_session(&pending.session_id, &from_peer, &acceptor, &relay)
            {
                Ok(session) => session,
                Err(e) => {
                    log::warn!("{}", e);
                    return;
                }
            };

        log::info!(
            "session {} {} <-> {} via relay {}",
            session.session_id,
            session.peer_a,
            session.peer_b,
            session.relay_peer
        );

        self.send_to_peer(
            &Message::RelaySetup {
                session_id: session.session_id,
                peer_a: session.peer_a,
                peer_b: session.peer_b,
            },
            &relay,
        )
        .await;
    }

    async fn handle_relay_ready(
        &self,
        session_id: String,
        ports: HashMap<String, u16>,
        addr: SocketAddr,
    ) {
        let session = match self.registry.get_session(&session_id) {
            Some(s) => s,
            None => {
                log::warn!("relay_ready for unknown session {}", session_id);
                return;
            }
        };

        if self.registry.get_peer_id_by_address(addr).as_deref() != Some(session.relay_peer.as_str()) {
            log::warn!("relay_ready for {} from non relay {}", session_id, addr);
            return;
        }
        self.registry.touch_peer(&session.relay_peer, addr);

        if session.status != SessionStatus::Negotiating {
            log::debug!("duplicate relay_ready for {}", session_id);
            return;
        }

        let (port_a, port_b) = match (ports.get(&session.peer_a), ports.get(&session.peer_b)) {
            (Some(a), Some(b)) => (*a, *b),
            _ => {
                log::warn!("relay_ready for {} misses a port: {:?}", session_id, ports);
                return;
            }
        };

        if self.registry.set_session_ports(&session_id, ports).is_err()
            || self
                .registry
                .set_session_status(&session_id, SessionStatus::Active)
                .is_err()
        {
            log::debug!("session {} vanished", session_id);
            return;
        }

        log::info!("session {} active", session_id);

        let relay_addr = addr.ip();
        self.send_to_peer(
            &Message::RelayInfo {
                session_id: session_id.clone(),
                relay_addr,
                port: port_a,
                remote_peer: session.peer_b.clone(),
            },
            &session.peer_a,
        )
        .await;
        self.send_to_peer(
            &Message::RelayInfo {
                session_id,
                relay_addr,
                port: port_b,
                remote_peer: session.peer_a.clone(),
            },
            &session.peer_b,
        )
        .await;
    }

    async fn handle_session_close(&self, session_id: String, addr: SocketAddr) {
        let session = match self.registry.get_session(&session_id) {
            Some(s) => s,
            None => {
                log::debug!("session_close for unknown session {}", session_id);
                return;
            }
        };

        let sender = match self.registry.get_peer_id_by_address(addr) {
            Some(id) if session.involves(&id) => id,
            _ => {
                log::warn!("session_close for {} from outsider {}", session_id, addr);
                return;
            }
        };

        if let Some(session) = self.registry.close_session(&session_id) {
            log::info!("session {} closed by {}", session_id, sender);
            self.notify_close(&session, Some(sender.as_str())).await;
        }
    }

    /// Tell every participant but `except` that a session is gone.
    async fn notify_close(&self, session: &Session, except: Option<&str>) {
        let msg = Message::SessionClose {
            session_id: session.session_id.clone(),
        };

        for p in [&session.peer_a, &session.peer_b, &session.relay_peer] {
            if Some(p.as_str()) != except {
                self.send_to_peer(&msg, p).await;
            }
        }
    }

    async fn gc(&self) {
        for p in self.registry.expire_pending(self.config.accept_timeout) {
            log::debug!("pending {} expired", p.session_id);
            self.send_to_peer(
                &Message::session_error("Connection request timed out", &p.session_id),
                &p.from_peer,
            )
            .await;
        }

        for s in self
            .registry
            .expire_negotiating(self.config.relay_ready_timeout)
        {
            log::debug!("session {} relay {} did not respond", s.session_id, s.relay_peer);

            let err = Message::session_error("Relay did not respond", &s.session_id);
            self.send_to_peer(&err, &s.peer_a).await;
            self.send_to_peer(&err, &s.peer_b).await;
            self.send_to_peer(
                &Message::SessionClose {
                    session_id: s.session_id.clone(),
                },
                &s.relay_peer,
            )
            .await;
        }

        if let Some(ttl) = self.config.peer_ttl {
            for id in self.registry.expire_peers(ttl) {
                log::info!("peer {} expired", id);
            }
        }

        // sessions whose relay or endpoint was evicted without a bye
        for s in self.registry.close_orphaned_sessions() {
            log::info!("session {} lost a participant", s.session_id);
            if s.ports.is_empty() {
                // still negotiating, endpoints wait on relay_info
                let err = Message::session_error("Session participant left", &s.session_id);
                self.send_to_peer(&err, &s.peer_a).await;
                self.send_to_peer(&err, &s.peer_b).await;
            }
            self.notify_close(&s, None).await;
        }
    }
}
