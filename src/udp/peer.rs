use super::{any_addr, bind_socket, relay::RelayEngine};
use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::proto::{self, Message, RelayAction, MAX_DATAGRAM_SIZE};
use std::collections::HashMap;
use std::future::pending;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio::{select, task::spawn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Unregistered,
    Registered,
    AwaitingRelayInfo,
    Connected,
}

/// Where this peer reaches the relay for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub session_id: String,
    pub remote_peer: String,
    pub addr: SocketAddr,
}

/// Everything the agent surfaces to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Another peer asked for a session; it is accepted automatically.
    IncomingConnection { from_peer: String },
    /// A relay endpoint was assigned and the pinhole `init` sent.
    Connected(RelayEndpoint),
    /// The relay forwarded the remote side's `init`: traffic flows both ways.
    PinholeOpen { session_id: String },
    Message { session_id: String, data: String },
    SessionClosed { session_id: String },
    /// This peer started relaying a session for others.
    RelayStarted {
        session_id: String,
        ports: HashMap<String, u16>,
    },
    /// An `error` from the server nobody was waiting for.
    Error { message: String },
}

struct State {
    status: PeerStatus,
    sessions: HashMap<String, RelayEndpoint>,
    current: Option<String>,
    last_register: Option<Instant>,
    keepalive_started: bool,
    register_tx: Option<oneshot::Sender<()>>,
    // handshakes this peer accepted and awaits relay_info for
    accepted: HashMap<String, Instant>,
    connect: Option<(String, oneshot::Sender<Result<RelayEndpoint>>)>,
}

impl State {
    fn settle(&mut self) {
        self.status = if self.current.is_some() {
            PeerStatus::Connected
        } else if self.status == PeerStatus::Unregistered {
            PeerStatus::Unregistered
        } else {
            PeerStatus::Registered
        };
    }
}

struct Shared {
    socket: UdpSocket,
    server_addr: SocketAddr,
    id: String,
    is_relay: bool,
    config: PeerConfig,
    state: Mutex<State>,
    relay: Option<RelayEngine>,
    events: mpsc::UnboundedSender<PeerEvent>,
    exit: watch::Sender<bool>,
}

/// Peer agent
///
/// Registers with the rendezvous server, asks it for sessions with other
/// peers and exchanges `relay_data` with them through the relay the server
/// picked. A peer created with `is_relay` also forwards sessions for others.
///
/// # example
/// ```no_run
/// # async fn demo() -> rndz_relay::error::Result<()> {
/// use rndz_relay::udp::Peer;
///
/// let p = Peer::new("rndz_server:8888", "aaaa1111", false).await?;
/// p.register().await?;
/// p.connect_to_peer("bbbb2222").await?;
/// p.send_message("hello").await?;
/// # Ok(())
/// # }
/// ```
pub struct Peer {
    shared: Arc<Shared>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<PeerEvent>>,
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Peer {
    pub async fn new(server_addr: &str, id: &str, is_relay: bool) -> Result<Self> {
        Self::with_config(server_addr, id, is_relay, PeerConfig::default()).await
    }

    /// Bind a fresh socket, on `config.local_addr` if set.
    pub async fn with_config(
        server_addr: &str,
        id: &str,
        is_relay: bool,
        config: PeerConfig,
    ) -> Result<Self> {
        let server_addr = lookup_host(server_addr)
            .await?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no addr"))?;

        let local_addr = config.local_addr.unwrap_or_else(|| any_addr(&server_addr));
        let socket = bind_socket(local_addr)?;

        Self::with_socket(socket, server_addr, id, is_relay, config)
    }

    /// `socket` is used for the server and every relay; it must not be read elsewhere.
    pub fn with_socket(
        socket: UdpSocket,
        server_addr: SocketAddr,
        id: &str,
        is_relay: bool,
        config: PeerConfig,
    ) -> Result<Self> {
        let (relay, closed_rx) = if is_relay {
            let (engine, closed_rx) =
                RelayEngine::new(socket.local_addr()?, config.relay_idle_timeout);
            (Some(engine), Some(closed_rx))
        } else {
            (None, None)
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exit, exit_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            socket,
            server_addr,
            id: id.to_string(),
            is_relay,
            config,
            state: Mutex::new(State {
                status: PeerStatus::Unregistered,
                sessions: HashMap::new(),
                current: None,
                last_register: None,
                keepalive_started: false,
                register_tx: None,
                accepted: HashMap::new(),
                connect: None,
            }),
            relay,
            events: events_tx,
            exit,
        });

        spawn(Shared::recv_loop(shared.clone(), exit_rx, closed_rx));

        Ok(Self {
            shared,
            events: tokio::sync::Mutex::new(events_rx),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    pub fn status(&self) -> PeerStatus {
        self.shared.state().status
    }

    /// last successful registration
    pub fn last_register(&self) -> Option<Instant> {
        self.shared.state().last_register
    }

    pub fn current_session(&self) -> Option<RelayEndpoint> {
        let st = self.shared.state();
        let ep = st.current.as_ref().and_then(|id| st.sessions.get(id)).cloned();
        ep
    }

    /// Sessions this peer is relaying for others.
    pub fn relayed_sessions(&self) -> Vec<String> {
        self.shared
            .relay
            .as_ref()
            .map(|r| r.sessions())
            .unwrap_or_default()
    }

    /// Send `register` until the server answers, then keep the NAT binding
    /// to the server alive.
    pub async fn register(&self) -> Result<()> {
        let s = &self.shared;
        let msg = Message::Register {
            peer_id: s.id.clone(),
            is_relay: s.is_relay,
        };

        for attempt in 1..=s.config.register_retries {
            let (tx, rx) = oneshot::channel();
            s.state().register_tx = Some(tx);
            s.send(&msg, s.server_addr).await?;

            match timeout(s.config.request_timeout, rx).await {
                Ok(Ok(())) => {
                    log::info!("{} registered", s.id);
                    self.start_keepalive();
                    return Ok(());
                }
                Ok(Err(_)) => return Err(Error::Closed),
                Err(_) => log::debug!("register attempt {} timed out", attempt),
            }
        }

        s.state().register_tx = None;
        Err(Error::Timeout("register_response"))
    }

    fn start_keepalive(&self) {
        {
            let mut st = self.shared.state();
            if st.keepalive_started {
                return;
            }
            st.keepalive_started = true;
        }

        spawn(Shared::keepalive_loop(
            self.shared.clone(),
            self.shared.exit.subscribe(),
        ));
    }

    /// Ask the server for a relayed session with `target_id`.
    ///
    /// Resolves once the relay endpoint is known; a server `error` or no
    /// answer within `connect_timeout` fails it. Only one request may be in flight.
    pub async fn connect_to_peer(&self, target_id: &str) -> Result<RelayEndpoint> {
        let s = &self.shared;

        let rx = {
            let mut st = s.state();
            if st.status == PeerStatus::Unregistered {
                return Err(Error::NotRegistered);
            }
            if st.connect.is_some() {
                return Err(Error::Busy);
            }

            let (tx, rx) = oneshot::channel();
            st.connect = Some((target_id.to_string(), tx));
            st.status = PeerStatus::AwaitingRelayInfo;
            rx
        };

        log::info!("{} connecting to {}", s.id, target_id);

        let msg = Message::ConnectRequest {
            from_peer: s.id.clone(),
            to_peer: target_id.to_string(),
        };
        if let Err(e) = s.send(&msg, s.server_addr).await {
            s.abandon_connect();
            return Err(e);
        }

        match timeout(s.config.connect_timeout, rx).await {
            Ok(Ok(r)) => r,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                s.abandon_connect();
                Err(Error::Timeout("relay_info"))
            }
        }
    }

    /// Send `text` to the remote peer of the current session.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let ep = self.current_session().ok_or(Error::NotConnected)?;
        self.shared
            .send(&Message::relay_text(&ep.session_id, text), ep.addr)
            .await
    }

    /// Tear down the current session.
    pub async fn close_session(&self) -> Result<()> {
        let session_id = {
            let mut st = self.shared.state();
            let id = st.current.take().ok_or(Error::NotConnected)?;
            st.sessions.remove(&id);
            st.settle();
            id
        };

        log::info!("{} closing session {}", self.shared.id, session_id);
        self.shared
            .send(&Message::SessionClose { session_id }, self.shared.server_addr)
            .await
    }

    /// Next event, `None` once the agent has shut down.
    pub async fn next_event(&self) -> Option<PeerEvent> {
        self.events.lock().await.recv().await
    }

    /// Say bye to the server and stop every background task.
    pub fn shutdown(&self) {
        let s = &self.shared;
        if *s.exit.borrow() {
            return;
        }

        if s.state().status != PeerStatus::Unregistered {
            if let Ok(buf) = proto::encode(&Message::Bye {
                peer_id: s.id.clone(),
            }) {
                let _ = s.socket.try_send_to(&buf, s.server_addr);
            }
        }

        if let Some(relay) = &s.relay {
            relay.close_all();
        }
        let _ = s.exit.send(true);
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn send(&self, msg: &Message, addr: SocketAddr) -> Result<()> {
        let buf = proto::encode(msg)?;
        self.socket.send_to(&buf, addr).await?;
        Ok(())
    }

    /// Best effort send from the receive loop.
    async fn notify(&self, msg: &Message, addr: SocketAddr) {
        if let Err(e) = self.send(msg, addr).await {
            log::warn!("send {} to {} failed: {}", msg.tag(), addr, e);
        }
    }

    fn emit(&self, ev: PeerEvent) {
        let _ = self.events.send(ev);
    }

    fn abandon_connect(&self) {
        let mut st = self.state();
        st.connect = None;
        st.settle();
    }

    async fn keepalive_loop(self: Arc<Self>, mut exit: watch::Receiver<bool>) {
        let ka = proto::encode(&Message::Keepalive {
            peer_id: self.id.clone(),
        });
        let ka = match ka {
            Ok(ka) => ka,
            Err(e) => {
                log::warn!("keepalive encode: {}", e);
                return;
            }
        };

        let mut tick = interval(self.config.keepalive_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the register just refreshed the binding
        tick.tick().await;

        loop {
            select! {
                _ = exit.changed() => break,
                _ = tick.tick() => {
                    log::trace!("keepalive {}", self.id);
                    if let Err(e) = self.socket.send_to(&ka, self.server_addr).await {
                        log::debug!("keepalive failed: {}", e);
                    }
                }
            }
        }
    }

    async fn recv_loop(
        self: Arc<Self>,
        mut exit: watch::Receiver<bool>,
        mut relay_closed: Option<mpsc::UnboundedReceiver<String>>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            select! {
                _ = exit.changed() => break,
                Some(session_id) = next_closed(&mut relay_closed) => {
                    self.notify(&Message::SessionClose { session_id }, self.server_addr).await;
                }
                r = self.socket.recv_from(&mut buf) => {
                    let (n, addr) = match r {
                        Ok(r) => r,
                        Err(e) => {
                            log::debug!("recv error {}", e);
                            continue;
                        }
                    };

                    match proto::decode(&buf[..n]) {
                        Ok(msg) if addr == self.server_addr => self.handle_server(msg).await,
                        Ok(msg) => self.handle_relay(msg, addr),
                        Err(e) => log::warn!("drop malformed datagram from {}: {}", addr, e),
                    }
                }
            }
        }

        log::debug!("{} receive loop exit", self.id);
    }

    async fn handle_server(&self, msg: Message) {
        log::trace!("{} from server", msg.tag());

        match msg {
            Message::RegisterResponse { .. } => {
                let mut st = self.state();
                st.last_register = Some(Instant::now());
                if st.status == PeerStatus::Unregistered {
                    st.status = PeerStatus::Registered;
                }
                if let Some(tx) = st.register_tx.take() {
                    let _ = tx.send(());
                }
            }
            Message::IncomingConnection {
                from_peer,
                session_id,
            } => {
                log::info!("{} incoming connection from {}", self.id, from_peer);
                if let Some(session_id) = session_id {
                    let mut st = self.state();
                    let ttl = self.config.connect_timeout;
                    st.accepted.retain(|_, at| at.elapsed() < ttl);
                    st.accepted.insert(session_id, Instant::now());
                }
                self.emit(PeerEvent::IncomingConnection {
                    from_peer: from_peer.clone(),
                });
                self.notify(&Message::AcceptConnection { from_peer }, self.server_addr)
                    .await;
            }
            Message::RelaySetup {
                session_id,
                peer_a,
                peer_b,
            } => self.handle_relay_setup(session_id, peer_a, peer_b).await,
            Message::RelayInfo {
                session_id,
                relay_addr,
                port,
                remote_peer,
            } => {
                let ep = RelayEndpoint {
                    session_id,
                    remote_peer,
                    addr: SocketAddr::new(relay_addr, port),
                };
                self.handle_relay_info(ep).await;
            }
            Message::SessionClose { session_id } => self.handle_session_close(session_id),
            Message::Error {
                message,
                session_id,
            } => {
                if session_id.is_none() && message == proto::ERR_NOT_REGISTERED {
                    self.reregister().await;
                }

                let waiting = {
                    let mut st = self.state();
                    let accepted = match &session_id {
                        Some(id) => st.accepted.remove(id).is_some(),
                        None => false,
                    };
                    // errors about a handshake we accepted are not about our own request
                    if accepted {
                        None
                    } else {
                        let waiting = st.connect.take();
                        st.settle();
                        waiting
                    }
                };

                match waiting {
                    Some((target, tx)) => {
                        log::info!("connect to {} failed: {}", target, message);
                        let _ = tx.send(Err(Error::Remote(message)));
                    }
                    None => {
                        log::info!("server error: {}", message);
                        self.emit(PeerEvent::Error { message });
                    }
                }
            }
            msg => log::warn!("unexpected {} from server", msg.tag()),
        }
    }

    /// The server forgot us, typically after missed keepalives.
    async fn reregister(&self) {
        if self.state().status == PeerStatus::Unregistered {
            return;
        }

        log::info!("{} unknown to server, registering again", self.id);
        self.notify(
            &Message::Register {
                peer_id: self.id.clone(),
                is_relay: self.is_relay,
            },
            self.server_addr,
        )
        .await;
    }

    async fn handle_relay_setup(&self, session_id: String, peer_a: String, peer_b: String) {
        let relay = match &self.relay {
            Some(relay) => relay,
            None => {
                log::warn!("relay_setup {} but not relay capable", session_id);
                return;
            }
        };

        match relay.setup(&session_id, &peer_a, &peer_b) {
            Ok(ports) => {
                log::info!("relaying {} for {} <-> {}", session_id, peer_a, peer_b);
                self.notify(
                    &Message::RelayReady {
                        session_id: session_id.clone(),
                        ports: ports.clone(),
                    },
                    self.server_addr,
                )
                .await;
                self.emit(PeerEvent::RelayStarted { session_id, ports });
            }
            Err(e) => log::warn!("relay setup {} failed: {}", session_id, e),
        }
    }

    async fn handle_relay_info(&self, ep: RelayEndpoint) {
        log::info!(
            "{} session {} with {} via {}",
            self.id,
            ep.session_id,
            ep.remote_peer,
            ep.addr
        );

        let waiting = {
            let mut st = self.state();
            st.accepted.remove(&ep.session_id);
            st.sessions.insert(ep.session_id.clone(), ep.clone());
            st.current = Some(ep.session_id.clone());
            st.status = PeerStatus::Connected;

            match st.connect.take() {
                Some((target, tx)) if target == ep.remote_peer => Some(tx),
                other => {
                    st.connect = other;
                    None
                }
            }
        };

        // opens our pinhole and teaches the relay our address
        self.notify(&Message::relay_init(&ep.session_id), ep.addr)
            .await;

        self.emit(PeerEvent::Connected(ep.clone()));
        if let Some(tx) = waiting {
            let _ = tx.send(Ok(ep));
        }
    }

    fn handle_session_close(&self, session_id: String) {
        if let Some(relay) = &self.relay {
            relay.close(&session_id);
        }

        let known = {
            let mut st = self.state();
            let known = st.sessions.remove(&session_id).is_some();
            if st.current.as_deref() == Some(session_id.as_str()) {
                st.current = None;
            }
            st.settle();
            known
        };

        if known {
            log::info!("{} session {} closed", self.id, session_id);
            self.emit(PeerEvent::SessionClosed { session_id });
        }
    }

    fn handle_relay(&self, msg: Message, addr: SocketAddr) {
        let (session_id, action, data) = match msg {
            Message::RelayData {
                session_id,
                action,
                data,
            } => (session_id, action, data),
            msg => {
                log::warn!("unexpected {} from {}", msg.tag(), addr);
                return;
            }
        };

        if !self.state().sessions.contains_key(&session_id) {
            log::debug!("relay_data for unknown session {} from {}", session_id, addr);
            return;
        }

        match (action, data) {
            (Some(RelayAction::Init), _) => {
                log::info!("{} nat pinhole established for {}", self.id, session_id);
                self.emit(PeerEvent::PinholeOpen { session_id });
            }
            (None, Some(data)) => self.emit(PeerEvent::Message { session_id, data }),
            (None, None) => log::debug!("empty relay_data from {}", addr),
        }
    }
}

async fn next_closed(rx: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}
