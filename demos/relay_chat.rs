use rndz_relay::udp::{Peer, PeerEvent, Server};
use std::error::Error;
use std::time::Duration;
use tokio::{task::spawn, time::sleep};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let server_addr = "127.0.0.1:8888";

    {
        let s = Server::new(server_addr).await?;
        spawn(async move { s.run().await });
    }

    let relay = Peer::new(server_addr, "cccc3333", true).await?;
    relay.register().await?;

    let c1 = Peer::new(server_addr, "c1", false).await?;
    c1.register().await?;

    let t = spawn(async move {
        loop {
            match c1.next_event().await {
                Some(PeerEvent::Message { data, .. }) => {
                    assert_eq!(data, "hello");
                    break;
                }
                Some(ev) => println!("c1: {:?}", ev),
                None => break,
            }
        }
    });

    let c2 = Peer::new(server_addr, "c2", false).await?;
    c2.register().await?;
    let ep = c2.connect_to_peer("c1").await?;
    println!("c2 connected to {} via {}", ep.remote_peer, ep.addr);

    // the relay drops everything until both inits arrived
    loop {
        c2.send_message("hello").await?;
        if t.is_finished() {
            break;
        }
        sleep(Duration::from_millis(200)).await;
    }

    t.await?;

    Ok(())
}
