//! BOB client against a scripted bridge

mod common;

use common::{pipe, Router};
use i2pbridge_client::allocator::default_nickname;
use i2pbridge_client::{BobClient, BridgeConfig, I2pAddress, TunnelOptions};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const BANNER: &str = "BOB 00.00.10\nOK\n";

fn options(port: u16) -> TunnelOptions {
    TunnelOptions {
        nickname: Some("spam".to_string()),
        host: Some("127.0.0.1".to_string()),
        port: Some(port),
    }
}

fn listing(nickname: &str, port: u16) -> String {
    format!(
        "DATA NICKNAME: {} STARTING: false RUNNING: true STOPPING: false KEYS: true QUIET: false \
         INPORT: {} INHOST: 127.0.0.1 OUTPORT: 0 OUTHOST: 127.0.0.1\nOK Listing done\n",
        nickname, port
    )
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Play BOB through creating a fresh tunnel
async fn serve_new_tunnel(bob: &mut Router, nickname: &str, direction: &str, port: u16) {
    bob.send(BANNER).await;
    bob.exchange("list\n", "OK Listing done\n").await;
    bob.exchange(&format!("setnick {}\n", nickname), "OK Nickname set\n")
        .await;
    bob.exchange("newkeys\n", "OK pubdest\n").await;
    bob.exchange("getkeys\n", "OK keypair~\n").await;
    bob.exchange(&format!("{}host 127.0.0.1\n", direction), "OK host set\n")
        .await;
    bob.exchange(&format!("{}port {}\n", direction, port), "OK port set\n")
        .await;
    bob.exchange("start\n", "OK tunnel starting\n").await;
    bob.exchange("quit\n", "OK Bye!\n").await;
}

/// Play BOB through tearing down the tunnel again
async fn serve_removal(bob: &mut Router, nickname: &str, port: u16) {
    bob.send(BANNER).await;
    bob.exchange("list\n", &listing(nickname, port)).await;
    bob.exchange(&format!("getnick {}\n", nickname), "OK Nickname set\n")
        .await;
    bob.exchange("stop\n", "OK tunnel stopping\n").await;
    bob.exchange("clear\n", "OK cleared\n").await;
    bob.exchange("quit\n", "OK Bye!\n").await;
}

#[tokio::test]
async fn test_connect_through_new_tunnel() {
    let tunnel = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = tunnel.local_addr().unwrap().port();

    let (connector, mut routers) = pipe();
    let client = BobClient::new(connector, &BridgeConfig::default());

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect("eggs.i2p", options(port)).await }
    });
    let mut bob = routers.next().await;
    serve_new_tunnel(&mut bob, "spam", "in", port).await;

    let (socket, _) = tunnel.accept().await.unwrap();
    let mut socket = BufReader::new(socket);
    let mut line = String::new();
    socket.read_line(&mut line).await.unwrap();
    assert_eq!(line, "eggs.i2p\n");

    let mut stream = connecting.await.unwrap().unwrap();
    assert_eq!(stream.local_addr(), &I2pAddress::new("pubdest", None));
    assert_eq!(stream.peer_addr().host(), "eggs.i2p");
    assert!(!stream.is_session_stream());

    socket.get_mut().write_all(b"spam").await.unwrap();
    let mut payload = [0u8; 4];
    stream.read_exact(&mut payload).await.unwrap();
    assert_eq!(&payload, b"spam");

    // the tunnel goes away with the last stream riding on it
    drop(stream);
    let mut bob = routers.next().await;
    serve_removal(&mut bob, "spam", port).await;
}

#[tokio::test]
async fn test_reused_tunnel_outlives_stream() {
    let tunnel = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = tunnel.local_addr().unwrap().port();

    let (connector, mut routers) = pipe();
    let client = BobClient::new(connector.clone(), &BridgeConfig::default());

    let connecting = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .connect(
                    "eggsdest",
                    TunnelOptions {
                        port: None,
                        ..options(0)
                    },
                )
                .await
        }
    });
    let mut bob = routers.next().await;
    bob.send(BANNER).await;
    bob.exchange("list\n", &listing("spam", port)).await;
    bob.exchange("getnick spam\n", "OK Nickname set to spam\n").await;
    bob.exchange("stop\n", "OK tunnel stopping\n").await;
    bob.exchange("getdest\n", "OK pubdest\n").await;
    bob.exchange("getkeys\n", "OK keypair~\n").await;
    bob.exchange("inhost 127.0.0.1\n", "OK inhost set\n").await;
    bob.exchange(&format!("inport {}\n", port), "OK inbound port set\n")
        .await;
    bob.exchange("start\n", "OK tunnel starting\n").await;
    bob.exchange("quit\n", "OK Bye!\n").await;

    let (mut socket, _) = tunnel.accept().await.unwrap();
    let stream = connecting.await.unwrap().unwrap();
    assert_eq!(stream.peer_addr(), &I2pAddress::new("eggsdest", None));

    let mut line = [0u8; 9];
    socket.read_exact(&mut line).await.unwrap();
    assert_eq!(&line, b"eggsdest\n");

    drop(stream);
    tokio::task::yield_now().await;
    assert!(routers.is_idle());
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_listen_persists_generated_keys() {
    let dir = TempDir::new().unwrap();
    let keyfile = dir.path().join("spam.key");
    let port = free_port().await;

    let (connector, mut routers) = pipe();
    let client = BobClient::new(connector, &BridgeConfig::default());

    let listening = tokio::spawn({
        let client = client.clone();
        let keyfile = keyfile.clone();
        async move { client.listen(&keyfile, options(port)).await }
    });
    let mut bob = routers.next().await;
    serve_new_tunnel(&mut bob, "spam", "out", port).await;

    let listener = listening.await.unwrap().unwrap();
    assert_eq!(listener.local_addr(), &I2pAddress::new("pubdest", None));
    assert_eq!(listener.nickname(), "spam");
    assert!(listener.owns_tunnel());
    assert_eq!(std::fs::read_to_string(&keyfile).unwrap(), "keypair~");

    // BOB connects out and announces the peer first
    let mut inbound = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    inbound.write_all(b"peerdest\nhello").await.unwrap();

    let mut stream = listener.accept().await.unwrap();
    assert_eq!(stream.peer_addr(), &I2pAddress::new("peerdest", None));
    let mut payload = [0u8; 5];
    stream.read_exact(&mut payload).await.unwrap();
    assert_eq!(&payload, b"hello");

    listener.close();
    let mut bob = routers.next().await;
    serve_removal(&mut bob, "spam", port).await;
}

#[tokio::test]
async fn test_listen_uses_stored_keys() {
    let dir = TempDir::new().unwrap();
    let keyfile = dir.path().join("spam.key");
    std::fs::write(&keyfile, "stored~keys\n").unwrap();
    let port = free_port().await;

    let (connector, mut routers) = pipe();
    let client = BobClient::new(connector, &BridgeConfig::default());

    let listening = tokio::spawn({
        let client = client.clone();
        let keyfile = keyfile.clone();
        async move { client.listen(&keyfile, options(port)).await }
    });
    let mut bob = routers.next().await;
    bob.send(BANNER).await;
    bob.exchange("list\n", "OK Listing done\n").await;
    bob.exchange("setnick spam\n", "OK Nickname set to spam\n").await;
    bob.exchange("setkeys stored~keys\n", "OK pubdest\n").await;
    bob.exchange("getdest\n", "OK pubdest\n").await;
    bob.exchange("outhost 127.0.0.1\n", "OK outhost set\n").await;
    bob.exchange(&format!("outport {}\n", port), "OK outbound port set\n")
        .await;
    bob.exchange("start\n", "OK tunnel starting\n").await;
    bob.exchange("quit\n", "OK Bye!\n").await;

    let listener = listening.await.unwrap().unwrap();
    assert_eq!(listener.local_addr().destination(), "pubdest");
    assert_eq!(std::fs::read_to_string(&keyfile).unwrap(), "stored~keys\n");
}

#[tokio::test]
async fn test_probe_and_remove() {
    let (connector, mut routers) = pipe();
    let client = BobClient::new(connector, &BridgeConfig::default());

    let probing = tokio::spawn({
        let client = client.clone();
        async move { client.probe().await }
    });
    let mut bob = routers.next().await;
    bob.send(BANNER).await;
    bob.exchange("quit\n", "OK Bye!\n").await;
    assert_eq!(probing.await.unwrap().unwrap(), "00.00.10");

    let removing = tokio::spawn({
        let client = client.clone();
        async move { client.remove_tunnel("eggs").await }
    });
    let mut bob = routers.next().await;
    bob.send(BANNER).await;
    bob.exchange("list\n", &listing("spam", 9000)).await;
    bob.expect("quit\n").await;
    assert!(!removing.await.unwrap().unwrap());
}

#[tokio::test]
async fn test_default_tunnel_removed_with_last_stream() {
    let tunnel = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = tunnel.local_addr().unwrap().port();
    let nickname = default_nickname("i2pbridge");
    let nickless = TunnelOptions {
        nickname: None,
        ..options(port)
    };

    let (connector, mut routers) = pipe();
    let client = BobClient::new(connector, &BridgeConfig::default());

    let connecting = tokio::spawn({
        let client = client.clone();
        let options = nickless.clone();
        async move { client.connect("eggsdest", options).await }
    });
    let mut bob = routers.next().await;
    serve_new_tunnel(&mut bob, &nickname, "in", port).await;
    let (_first_socket, _) = tunnel.accept().await.unwrap();
    let first = connecting.await.unwrap().unwrap();

    // a second nickless connect finds the default tunnel and reuses it
    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect("spamdest", nickless).await }
    });
    let mut bob = routers.next().await;
    bob.send(BANNER).await;
    bob.exchange("list\n", &listing(&nickname, port)).await;
    bob.exchange(&format!("getnick {}\n", nickname), "OK Nickname set\n")
        .await;
    bob.exchange("stop\n", "OK tunnel stopping\n").await;
    bob.exchange("getdest\n", "OK pubdest\n").await;
    bob.exchange("getkeys\n", "OK keypair~\n").await;
    bob.exchange("inhost 127.0.0.1\n", "OK inhost set\n").await;
    bob.exchange(&format!("inport {}\n", port), "OK inbound port set\n")
        .await;
    bob.exchange("start\n", "OK tunnel starting\n").await;
    bob.exchange("quit\n", "OK Bye!\n").await;
    let (_second_socket, _) = tunnel.accept().await.unwrap();
    let second = connecting.await.unwrap().unwrap();
    assert_eq!(client.tunnel_users(&nickname), 2);

    drop(first);
    tokio::task::yield_now().await;
    assert!(routers.is_idle());
    assert_eq!(client.tunnel_users(&nickname), 1);

    drop(second);
    assert_eq!(client.tunnel_users(&nickname), 0);
    let mut bob = routers.next().await;
    serve_removal(&mut bob, &nickname, port).await;
}
