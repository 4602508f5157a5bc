//!A rendezvous and relay protocol over plain UDP, to connect peers that both sit behind NAT.
//!
//!When neither side of a connection accepts inbound traffic, they can't reach each other
//!directly. A third peer that volunteers as relay can: both sides send to the relay first,
//!which opens their NAT pinholes, and the relay forwards between them.
//!
//!## How it works
//!A public rendezvous server observes every peer's address. Each peer has a unique identity
//!and registers with the server, optionally advertising that it is willing to relay.
//!
//!1. A sends `connect_request` naming B. The server tells B with `incoming_connection`.
//!2. B answers `accept_connection`. The server picks the first registered relay that is
//!   neither A nor B and sends it `relay_setup`.
//!3. The relay binds two fresh UDP sockets, one per endpoint, and answers `relay_ready`
//!   with their ports. The server sends each endpoint its own port in `relay_info`.
//!4. A and B each send an `init` datagram to their port. The relay learns each side's
//!   NAT-mapped address from it and from then on forwards datagrams unchanged between them.
//!
//!Peers keep pinging the server so their NAT binding to it stays open. Any participant can
//!end a session with `session_close`; an idle relay slot closes itself.
//!
//!Every datagram is one JSON object tagged by `type`, see [`proto`].
//!
//!## Feature flags
//!The crate includes both roles by default. Set features to `peer` or `server` to get one.
//!
//!```toml
//!rndz-relay = { version = "0.1", default-features=false, features=["peer"]}
//!```
//!
//!- `peer`: peer agent and relay forwarding engine
//!- `server`: rendezvous server and its registry

pub mod config;
pub mod error;
pub mod proto;
#[cfg(feature = "server")]
pub mod registry;
pub mod udp;
