//! Relay forwarding engine.
//!
//! For each session the relay binds two fresh udp sockets, one per endpoint.
//! Neither endpoint's address is known up front: each is learned from the
//! first datagram arriving on its socket (normally the `init` datagram that
//! also opens the endpoint's NAT pinhole). A datagram is forwarded, byte for
//! byte, out of the other socket once the other endpoint has been learned,
//! and dropped otherwise.

use super::{any_addr, bind_socket};
use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio::{select, task::spawn};

/// Forwarding buffer, large enough that no udp payload is ever truncated.
const FORWARD_BUF_SIZE: usize = 65536;

struct SlotState {
    learned: [Option<SocketAddr>; 2],
    last_activity: Instant,
}

/// Where an inbound datagram goes.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Forward(SocketAddr),
    /// Counterpart not learned yet.
    Unknown,
    /// Sender is not the address learned for this socket.
    Foreign,
}

struct Slot {
    session_id: String,
    peers: [String; 2],
    sockets: [UdpSocket; 2],
    state: Mutex<SlotState>,
}

impl Slot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observe(&self, side: usize, from: SocketAddr) -> Route {
        let mut st = self.state();

        match st.learned[side] {
            None => {
                log::debug!(
                    "relay {} learned {} at {}",
                    self.session_id,
                    self.peers[side],
                    from
                );
                st.learned[side] = Some(from);
            }
            Some(addr) if addr != from => return Route::Foreign,
            _ => {}
        }

        st.last_activity = Instant::now();

        match st.learned[1 - side] {
            Some(dst) => Route::Forward(dst),
            None => Route::Unknown,
        }
    }

    fn last_activity(&self) -> Instant {
        self.state().last_activity
    }
}

struct SlotHandle {
    ports: HashMap<String, u16>,
    close: watch::Sender<bool>,
}

type Slots = Arc<Mutex<HashMap<String, SlotHandle>>>;

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<String, SlotHandle>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Relay side of every session this peer forwards for.
///
/// Slots that close on their own (idle, socket failure) are reported on the
/// receiver returned by [`RelayEngine::new`], so the owner can tell the
/// rendezvous server.
pub struct RelayEngine {
    bind_addr: SocketAddr,
    idle_timeout: Duration,
    slots: Slots,
    closed_tx: mpsc::UnboundedSender<String>,
}

impl Drop for RelayEngine {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl RelayEngine {
    /// Slot sockets bind the unspecified address of `local_addr`'s family.
    pub fn new(
        local_addr: SocketAddr,
        idle_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let engine = Self {
            bind_addr: any_addr(&local_addr),
            idle_timeout,
            slots: Default::default(),
            closed_tx,
        };

        (engine, closed_rx)
    }

    /// Allocate a slot for `session_id` and start forwarding.
    ///
    /// Returns the port allocated for each endpoint. A repeated setup for a
    /// live session returns the existing ports.
    pub fn setup(
        &self,
        session_id: &str,
        peer_a: &str,
        peer_b: &str,
    ) -> Result<HashMap<String, u16>> {
        if peer_a == peer_b {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "relay endpoints must differ",
            ));
        }

        let mut slots = lock(&self.slots);
        if let Some(h) = slots.get(session_id) {
            return Ok(h.ports.clone());
        }

        let sock_a = bind_socket(self.bind_addr)?;
        let sock_b = bind_socket(self.bind_addr)?;

        let mut ports = HashMap::new();
        ports.insert(peer_a.to_string(), sock_a.local_addr()?.port());
        ports.insert(peer_b.to_string(), sock_b.local_addr()?.port());

        let slot = Arc::new(Slot {
            session_id: session_id.to_string(),
            peers: [peer_a.to_string(), peer_b.to_string()],
            sockets: [sock_a, sock_b],
            state: Mutex::new(SlotState {
                learned: [None, None],
                last_activity: Instant::now(),
            }),
        });

        let (close, close_rx) = watch::channel(false);

        for side in 0..2 {
            spawn(Self::forward(
                slot.clone(),
                side,
                close_rx.clone(),
                self.slots.clone(),
                self.closed_tx.clone(),
            ));
        }
        spawn(Self::watchdog(
            slot,
            self.idle_timeout,
            close_rx,
            self.slots.clone(),
            self.closed_tx.clone(),
        ));

        log::info!("relay slot {} ports {:?}", session_id, ports);
        slots.insert(
            session_id.to_string(),
            SlotHandle {
                ports: ports.clone(),
                close,
            },
        );

        Ok(ports)
    }

    /// Stop forwarding for a session. Returns false if it was not relayed here.
    pub fn close(&self, session_id: &str) -> bool {
        match lock(&self.slots).remove(session_id) {
            Some(h) => {
                log::info!("relay slot {} closed", session_id);
                let _ = h.close.send(true);
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        for (_, h) in lock(&self.slots).drain() {
            let _ = h.close.send(true);
        }
    }

    pub fn sessions(&self) -> Vec<String> {
        lock(&self.slots).keys().cloned().collect()
    }

    pub fn ports(&self, session_id: &str) -> Option<HashMap<String, u16>> {
        lock(&self.slots).get(session_id).map(|h| h.ports.clone())
    }

    /// Close a slot from inside and report it.
    fn expire(slots: &Slots, closed_tx: &mpsc::UnboundedSender<String>, session_id: &str) {
        if let Some(h) = lock(slots).remove(session_id) {
            let _ = h.close.send(true);
            let _ = closed_tx.send(session_id.to_string());
        }
    }

    async fn forward(
        slot: Arc<Slot>,
        side: usize,
        mut close_rx: watch::Receiver<bool>,
        slots: Slots,
        closed_tx: mpsc::UnboundedSender<String>,
    ) {
        let mut buf = vec![0u8; FORWARD_BUF_SIZE];
        let (rx, tx) = (&slot.sockets[side], &slot.sockets[1 - side]);

        loop {
            let (n, from) = select! {
                _ = close_rx.changed() => break,
                r = rx.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(e) if is_transient(&e) => {
                        log::debug!("relay {} recv: {}", slot.session_id, e);
                        continue;
                    }
                    Err(e) => {
                        log::warn!("relay {} recv failed: {}", slot.session_id, e);
                        Self::expire(&slots, &closed_tx, &slot.session_id);
                        break;
                    }
                },
            };

            match slot.observe(side, from) {
                Route::Forward(dst) => {
                    log::trace!(
                        "relay {} {} bytes {} -> {}",
                        slot.session_id,
                        n,
                        slot.peers[side],
                        slot.peers[1 - side]
                    );
                    if let Err(e) = tx.send_to(&buf[..n], dst).await {
                        log::warn!("relay {} send to {} failed: {}", slot.session_id, dst, e);
                    }
                }
                Route::Unknown => log::trace!(
                    "relay {} drop {} bytes from {}, {} not learned yet",
                    slot.session_id,
                    n,
                    slot.peers[side],
                    slot.peers[1 - side]
                ),
                Route::Foreign => log::debug!(
                    "relay {} drop {} bytes from foreign {}",
                    slot.session_id,
                    n,
                    from
                ),
            }
        }
    }

    async fn watchdog(
        slot: Arc<Slot>,
        idle_timeout: Duration,
        mut close_rx: watch::Receiver<bool>,
        slots: Slots,
        closed_tx: mpsc::UnboundedSender<String>,
    ) {
        loop {
            let deadline = slot.last_activity() + idle_timeout;
            select! {
                _ = close_rx.changed() => return,
                _ = sleep_until(deadline) => {},
            }

            if slot.last_activity() + idle_timeout <= Instant::now() {
                break;
            }
        }

        log::info!("relay slot {} idle, closing", slot.session_id);
        Self::expire(&slots, &closed_tx, &slot.session_id);
    }
}

fn is_transient(e: &Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}
