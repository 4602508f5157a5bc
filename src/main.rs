use rndz_relay::config::{PeerConfig, ServerConfig};
use rndz_relay::proto::new_peer_id;
use rndz_relay::udp::{Peer, PeerEvent, Server};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};

#[derive(StructOpt, Debug)]
#[structopt(name = "rndz-relay")]
enum Opt {
    Server(ServerOpt),
    Peer(PeerOpt),
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:8888")]
    listen_addr: SocketAddr,

    /// seconds a connect request waits for the target to accept
    #[structopt(long = "accept-timeout", default_value = "30")]
    accept_timeout: u64,

    /// seconds a relay gets to answer relay_setup
    #[structopt(long = "relay-ready-timeout", default_value = "10")]
    relay_ready_timeout: u64,

    /// seconds without keepalive before a peer is forgotten, 0 keeps peers forever
    #[structopt(long = "peer-ttl", default_value = "60")]
    peer_ttl: u64,
}

#[derive(StructOpt, Debug)]
struct PeerOpt {
    /// defaults to 8 random hex chars
    #[structopt(long = "id")]
    id: Option<String>,

    #[structopt(long = "server-addr")]
    server_addr: String,

    /// volunteer as relay for other peers
    #[structopt(long = "relay")]
    relay: bool,

    #[structopt(long = "remote-peer")]
    remote_peer: Option<String>,

    #[structopt(long = "local-addr")]
    local_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt: Opt = StructOpt::from_args();

    match opt {
        Opt::Server(opt) => run_server(opt).await,
        Opt::Peer(opt) => run_peer(opt).await,
    }
}

async fn run_server(opt: ServerOpt) -> Result<(), Box<dyn Error>> {
    let config = ServerConfig {
        accept_timeout: Duration::from_secs(opt.accept_timeout),
        relay_ready_timeout: Duration::from_secs(opt.relay_ready_timeout),
        peer_ttl: match opt.peer_ttl {
            0 => None,
            s => Some(Duration::from_secs(s)),
        },
        ..Default::default()
    };

    let s = Server::with_config(opt.listen_addr, config).await?;
    s.run().await?;
    Ok(())
}

async fn run_peer(opt: PeerOpt) -> Result<(), Box<dyn Error>> {
    let id = opt.id.unwrap_or_else(new_peer_id);
    let config = PeerConfig {
        local_addr: opt.local_addr,
        ..Default::default()
    };

    let peer = Arc::new(Peer::with_config(&opt.server_addr, &id, opt.relay, config).await?);
    peer.register().await?;
    println!("registered as {}", id);

    {
        let peer = peer.clone();
        tokio::spawn(async move {
            while let Some(ev) = peer.next_event().await {
                print_event(ev);
            }
        });
    }

    if let Some(remote) = opt.remote_peer {
        connect(&peer, &remote).await;
    }

    let mut lines = BufReader::new(stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));

        match (cmd, arg.trim()) {
            ("", _) => {}
            ("connect", target) if !target.is_empty() => connect(&peer, target).await,
            ("send", text) if !text.is_empty() => {
                if let Err(e) = peer.send_message(text).await {
                    println!("send failed: {}", e);
                }
            }
            ("close", _) => {
                if let Err(e) = peer.close_session().await {
                    println!("close failed: {}", e);
                }
            }
            ("quit", _) => break,
            _ => println!("commands: connect <peer_id> | send <message> | close | quit"),
        }
    }

    peer.shutdown();
    Ok(())
}

async fn connect(peer: &Peer, target: &str) {
    match peer.connect_to_peer(target).await {
        Ok(ep) => println!("connected to {} via relay {}", ep.remote_peer, ep.addr),
        Err(e) => println!("connect failed: {}", e),
    }
}

fn print_event(ev: PeerEvent) {
    match ev {
        PeerEvent::IncomingConnection { from_peer } => println!("{} is connecting", from_peer),
        PeerEvent::Connected(ep) => println!("session {} with {}", ep.session_id, ep.remote_peer),
        PeerEvent::PinholeOpen { session_id } => println!("session {} open", session_id),
        PeerEvent::Message { data, .. } => println!("> {}", data),
        PeerEvent::SessionClosed { session_id } => println!("session {} closed", session_id),
        PeerEvent::RelayStarted { session_id, ports } => {
            println!("relaying session {} on {:?}", session_id, ports)
        }
        PeerEvent::Error { message } => println!("error: {}", message),
    }
}
