//! Server side bookkeeping: peers, in-flight connection requests and relay sessions.
//!
//! No I/O happens here. Every operation takes the registry lock for its own
//! duration only, so callers must never hold results across a send expecting
//! them to still be current.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} already exists")]
    SessionExists(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: String,
    /// Source address of the last datagram seen from this peer.
    pub address: SocketAddr,
    pub is_relay: bool,
    pub last_seen: Instant,
}

/// A `connect_request` the target has not accepted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConnection {
    pub session_id: String,
    pub from_peer: String,
    pub to_peer: String,
    pub created_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Negotiating,
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub peer_a: String,
    pub peer_b: String,
    pub relay_peer: String,
    pub status: SessionStatus,
    /// Relay port allocated for each endpoint, keyed by peer id.
    pub ports: HashMap<String, u16>,
    pub created_at: Instant,
}

impl Session {
    pub fn involves(&self, peer_id: &str) -> bool {
        self.peer_a == peer_id || self.peer_b == peer_id || self.relay_peer == peer_id
    }
}

#[derive(Default)]
struct Inner {
    peers: HashMap<String, PeerRecord>,
    // one owner per source address, the latest to register or send from it
    by_address: HashMap<SocketAddr, String>,
    // relay capable peers in registration order
    relays: Vec<String>,
    pending: HashMap<String, PendingConnection>,
    sessions: HashMap<String, Session>,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite a peer. Re-registering keeps a relay's position in
    /// the selection order.
    ///
    /// A different peer still recorded at `address` is evicted and its id returned.
    pub fn register_peer(
        &self,
        peer_id: &str,
        address: SocketAddr,
        is_relay: bool,
    ) -> Option<String> {
        let mut inner = self.lock();

        let displaced = Self::bind_address(&mut inner, peer_id, address);
        inner.peers.insert(
            peer_id.to_string(),
            PeerRecord {
                peer_id: peer_id.to_string(),
                address,
                is_relay,
                last_seen: Instant::now(),
            },
        );

        let listed = inner.relays.iter().any(|r| r == peer_id);
        if is_relay && !listed {
            inner.relays.push(peer_id.to_string());
        } else if !is_relay && listed {
            inner.relays.retain(|r| r != peer_id);
        }

        displaced
    }

    /// Refresh address and liveness of a known peer. Returns false if unknown.
    ///
    /// Like `register_peer`, taking over an address evicts its previous owner.
    pub fn touch_peer(&self, peer_id: &str, address: SocketAddr) -> bool {
        let mut inner = self.lock();
        if !inner.peers.contains_key(peer_id) {
            return false;
        }

        if let Some(other) = Self::bind_address(&mut inner, peer_id, address) {
            log::debug!("{} evicted, {} now sends from {}", other, peer_id, address);
        }
        if let Some(p) = inner.peers.get_mut(peer_id) {
            p.address = address;
            p.last_seen = Instant::now();
        }
        true
    }

    /// Point `address` at `peer_id`, dropping the peer's previous index entry
    /// and evicting whoever owned `address` before.
    fn bind_address(inner: &mut Inner, peer_id: &str, address: SocketAddr) -> Option<String> {
        if let Some(old) = inner.peers.get(peer_id).map(|p| p.address) {
            if old != address && inner.by_address.get(&old).map(String::as_str) == Some(peer_id) {
                inner.by_address.remove(&old);
            }
        }

        match inner.by_address.insert(address, peer_id.to_string()) {
            Some(other) if other != peer_id => {
                inner.peers.remove(&other);
                Self::forget(inner, &other);
                Some(other)
            }
            _ => None,
        }
    }

    pub fn get_peer(&self, peer_id: &str) -> Option<PeerRecord> {
        self.lock().peers.get(peer_id).cloned()
    }

    pub fn get_peer_address(&self, peer_id: &str) -> Option<SocketAddr> {
        self.lock().peers.get(peer_id).map(|p| p.address)
    }

    pub fn is_relay(&self, peer_id: &str) -> bool {
        self.lock()
            .peers
            .get(peer_id)
            .map(|p| p.is_relay)
            .unwrap_or(false)
    }

    pub fn get_peer_id_by_address(&self, address: SocketAddr) -> Option<String> {
        self.lock().by_address.get(&address).cloned()
    }

    pub fn list_available_relays(&self) -> Vec<String> {
        self.lock().relays.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    /// Forget a peer and every pending connection it takes part in.
    pub fn remove_peer(&self, peer_id: &str) -> Option<PeerRecord> {
        let mut inner = self.lock();
        let removed = inner.peers.remove(peer_id)?;
        Self::unbind_address(&mut inner, &removed);
        Self::forget(&mut inner, peer_id);
        Some(removed)
    }

    /// Evict peers not seen within `ttl`, returning their ids.
    pub fn expire_peers(&self, ttl: Duration) -> Vec<String> {
        let mut inner = self.lock();
        let now = Instant::now();

        let expired: Vec<String> = inner
            .peers
            .values()
            .filter(|p| now.duration_since(p.last_seen) > ttl)
            .map(|p| p.peer_id.clone())
            .collect();

        for id in &expired {
            if let Some(p) = inner.peers.remove(id) {
                Self::unbind_address(&mut inner, &p);
            }
            Self::forget(&mut inner, id);
        }

        expired
    }

    fn unbind_address(inner: &mut Inner, record: &PeerRecord) {
        if inner.by_address.get(&record.address) == Some(&record.peer_id) {
            inner.by_address.remove(&record.address);
        }
    }

    fn forget(inner: &mut Inner, peer_id: &str) {
        inner.relays.retain(|r| r != peer_id);
        inner
            .pending
            .retain(|_, p| p.from_peer != peer_id && p.to_peer != peer_id);
    }

    pub fn create_pending_connection(&self, session_id: &str, from: &str, to: &str) {
        self.lock().pending.insert(
            session_id.to_string(),
            PendingConnection {
                session_id: session_id.to_string(),
                from_peer: from.to_string(),
                to_peer: to.to_string(),
                created_at: Instant::now(),
            },
        );
    }

    pub fn find_pending_connection(&self, from: &str, to: &str) -> Option<PendingConnection> {
        self.lock()
            .pending
            .values()
            .find(|p| p.from_peer == from && p.to_peer == to)
            .cloned()
    }

    pub fn consume_pending_connection(&self, session_id: &str) -> Option<PendingConnection> {
        self.lock().pending.remove(session_id)
    }

    /// Drop pending connections older than `ttl` and return them.
    pub fn expire_pending(&self, ttl: Duration) -> Vec<PendingConnection> {
        let mut inner = self.lock();
        let now = Instant::now();

        let expired: Vec<String> = inner
            .pending
            .values()
            .filter(|p| now.duration_since(p.created_at) > ttl)
            .map(|p| p.session_id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| inner.pending.remove(id))
            .collect()
    }

    pub fn create_session(
        &self,
        session_id: &str,
        peer_a: &str,
        peer_b: &str,
        relay: &str,
    ) -> Result<Session, RegistryError> {
        let mut inner = self.lock();

        if inner.sessions.contains_key(session_id) || inner.pending.contains_key(session_id) {
            return Err(RegistryError::SessionExists(session_id.to_string()));
        }

        let session = Session {
            session_id: session_id.to_string(),
            peer_a: peer_a.to_string(),
            peer_b: peer_b.to_string(),
            relay_peer: relay.to_string(),
            status: SessionStatus::Negotiating,
            ports: HashMap::new(),
            created_at: Instant::now(),
        };
        inner
            .sessions
            .insert(session_id.to_string(), session.clone());

        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.lock().sessions.get(session_id).cloned()
    }

    pub fn set_session_ports(
        &self,
        session_id: &str,
        ports: HashMap<String, u16>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let s = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        s.ports = ports;
        Ok(())
    }

    pub fn set_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let s = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        s.status = status;
        Ok(())
    }

    /// Remove a session, returning it marked closed.
    pub fn close_session(&self, session_id: &str) -> Option<Session> {
        let mut s = self.lock().sessions.remove(session_id)?;
        s.status = SessionStatus::Closed;
        Some(s)
    }

    /// Close sessions still negotiating after `ttl`.
    pub fn expire_negotiating(&self, ttl: Duration) -> Vec<Session> {
        let mut inner = self.lock();
        let now = Instant::now();

        let expired: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| {
                s.status == SessionStatus::Negotiating && now.duration_since(s.created_at) > ttl
            })
            .map(|s| s.session_id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| inner.sessions.remove(id))
            .map(|mut s| {
                s.status = SessionStatus::Closed;
                s
            })
            .collect()
    }

    /// Close sessions with a participant that is no longer registered.
    pub fn close_orphaned_sessions(&self) -> Vec<Session> {
        let mut inner = self.lock();

        let orphaned: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| {
                [&s.peer_a, &s.peer_b, &s.relay_peer]
                    .iter()
                    .any(|p| !inner.peers.contains_key(p.as_str()))
            })
            .map(|s| s.session_id.clone())
            .collect();

        orphaned
            .iter()
            .filter_map(|id| inner.sessions.remove(id))
            .map(|mut s| {
                s.status = SessionStatus::Closed;
                s
            })
            .collect()
    }

    pub fn sessions_of(&self, peer_id: &str) -> Vec<Session> {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.involves(peer_id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn addr(port: u16) -> SocketAddr {
        ([10, 0, 0, 1], port).into()
    }

    #[test]
    fn test_register_last_write_wins() {
        let r = Registry::new();
        r.register_peer("aaaa1111", addr(1000), false);
        r.register_peer("aaaa1111", addr(2000), false);

        assert_eq!(r.peer_count(), 1);
        assert_eq!(r.get_peer_address("aaaa1111"), Some(addr(2000)));
        assert_eq!(r.get_peer_id_by_address(addr(2000)).as_deref(), Some("aaaa1111"));
        assert_eq!(r.get_peer_id_by_address(addr(1000)), None);
        assert_eq!(r.get_peer_address("nobody"), None);
    }

    #[test]
    fn test_relay_order() {
        let r = Registry::new();
        r.register_peer("r1", addr(1), true);
        r.register_peer("p1", addr(2), false);
        r.register_peer("r2", addr(3), true);
        r.register_peer("r1", addr(4), true);

        assert_eq!(r.list_available_relays(), vec!["r1", "r2"]);
        assert!(r.is_relay("r2"));
        assert!(!r.is_relay("p1"));
        assert!(!r.is_relay("unknown"));

        r.register_peer("r1", addr(4), false);
        assert_eq!(r.list_available_relays(), vec!["r2"]);
    }

    #[test]
    fn test_pending_lifecycle() {
        let r = Registry::new();
        r.create_pending_connection("s1", "a", "b");

        assert_eq!(r.find_pending_connection("a", "b").unwrap().session_id, "s1");
        assert!(r.find_pending_connection("b", "a").is_none());

        // pending and session never share an id
        assert_eq!(
            r.create_session("s1", "a", "b", "r"),
            Err(RegistryError::SessionExists("s1".into()))
        );

        assert!(r.consume_pending_connection("s1").is_some());
        assert!(r.consume_pending_connection("s1").is_none());
        assert!(r.find_pending_connection("a", "b").is_none());
    }

    #[test]
    fn test_session_lifecycle() {
        let r = Registry::new();
        let s = r.create_session("s1", "a", "b", "r").unwrap();
        assert_eq!(s.status, SessionStatus::Negotiating);
        assert!(r.create_session("s1", "a", "b", "r").is_err());

        let ports: HashMap<String, u16> = [("a".to_string(), 41001), ("b".to_string(), 41002)]
            .into_iter()
            .collect();
        r.set_session_ports("s1", ports.clone()).unwrap();
        r.set_session_status("s1", SessionStatus::Active).unwrap();

        let s = r.get_session("s1").unwrap();
        assert_eq!(s.ports, ports);
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(r.sessions_of("r").len(), 1);
        assert!(r.sessions_of("c").is_empty());

        assert_eq!(
            r.set_session_ports("nope", HashMap::new()),
            Err(RegistryError::SessionNotFound("nope".into()))
        );

        let closed = r.close_session("s1").unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(r.get_session("s1").is_none());
    }

    #[test]
    fn test_expiry() {
        let r = Registry::new();
        r.register_peer("a", addr(1), false);
        r.register_peer("r", addr(2), true);
        r.create_pending_connection("s1", "a", "b");
        r.create_session("s2", "a", "b", "r").unwrap();

        assert!(r.expire_peers(Duration::from_secs(60)).is_empty());
        assert!(r.expire_pending(Duration::from_secs(60)).is_empty());
        assert!(r.expire_negotiating(Duration::from_secs(60)).is_empty());

        thread::sleep(Duration::from_millis(20));

        let s = r.expire_negotiating(Duration::from_millis(1));
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].status, SessionStatus::Closed);

        let mut gone = r.expire_peers(Duration::from_millis(1));
        gone.sort();
        assert_eq!(gone, vec!["a", "r"]);
        assert!(r.list_available_relays().is_empty());
        // pending connections of evicted peers go with them
        assert!(r.expire_pending(Duration::from_millis(1)).is_empty());
    }

    #[test]
    fn test_address_has_one_owner() {
        let r = Registry::new();
        r.register_peer("oldid000", addr(1), true);
        r.create_pending_connection("s1", "oldid000", "cccc3333");

        assert_eq!(
            r.register_peer("bbbb2222", addr(1), false).as_deref(),
            Some("oldid000")
        );
        for _ in 0..100 {
            assert_eq!(r.get_peer_id_by_address(addr(1)).as_deref(), Some("bbbb2222"));
        }
        assert!(r.get_peer("oldid000").is_none());
        assert!(r.list_available_relays().is_empty());
        assert!(r.find_pending_connection("oldid000", "cccc3333").is_none());

        // a keepalive from a new address moves the index along
        r.register_peer("aaaa1111", addr(2), false);
        assert!(r.touch_peer("aaaa1111", addr(3)));
        assert_eq!(r.get_peer_id_by_address(addr(2)), None);
        assert_eq!(r.get_peer_id_by_address(addr(3)).as_deref(), Some("aaaa1111"));

        // and evicts whoever held it
        assert!(r.touch_peer("aaaa1111", addr(1)));
        assert!(r.get_peer("bbbb2222").is_none());
        assert_eq!(r.get_peer_id_by_address(addr(1)).as_deref(), Some("aaaa1111"));
        assert_eq!(r.peer_count(), 1);

        r.remove_peer("aaaa1111");
        assert_eq!(r.get_peer_id_by_address(addr(1)), None);
    }

    #[test]
    fn test_orphaned_sessions() {
        let r = Registry::new();
        r.register_peer("a", addr(1), false);
        r.register_peer("b", addr(2), false);
        r.register_peer("r", addr(3), true);
        r.create_session("s1", "a", "b", "r").unwrap();
        r.set_session_status("s1", SessionStatus::Active).unwrap();

        assert!(r.close_orphaned_sessions().is_empty());

        r.remove_peer("r");
        let closed = r.close_orphaned_sessions();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].session_id, "s1");
        assert_eq!(closed[0].status, SessionStatus::Closed);
        assert!(r.get_session("s1").is_none());
    }

    #[test]
    fn test_remove_peer() {
        let r = Registry::new();
        r.register_peer("a", addr(1), true);
        r.create_pending_connection("s1", "b", "a");

        assert!(r.remove_peer("a").is_some());
        assert!(r.remove_peer("a").is_none());
        assert!(r.list_available_relays().is_empty());
        assert!(r.find_pending_connection("b", "a").is_none());
    }

    #[test]
    fn test_concurrent_register() {
        let r = std::sync::Arc::new(Registry::new());
        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let r = r.clone();
                thread::spawn(move || {
                    for j in 0..50u16 {
                        r.register_peer(&format!("p{}", i), addr(i * 100 + j), i % 2 == 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(r.peer_count(), 8);
        assert_eq!(r.list_available_relays().len(), 4);
    }
}
