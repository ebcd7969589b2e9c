//! Integration tests for the connection server

use std::net::SocketAddr;
use std::time::Duration;

use connserver::config::{ServerConfig, ServerMode};
use connserver::connection::{ServerStats, StatsSnapshot};
use connserver::message::MessageReceiver;
use connserver::{Message, Server, ServerError, ShutdownCoordinator};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        shutdown_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

struct Running {
    addr: SocketAddr,
    shutdown: ShutdownCoordinator,
    stats: std::sync::Arc<ServerStats>,
    handle: JoinHandle<Result<(), ServerError>>,
}

async fn start_routing(config: ServerConfig) -> (Running, MessageReceiver) {
    let shutdown = ShutdownCoordinator::new(config.shutdown_timeout);
    let (mut server, rx) = Server::with_router(config, shutdown.clone());
    let addr = server.bind().await.expect("bind ephemeral port");
    let stats = server.stats();
    let handle = tokio::spawn(server.start());
    (
        Running {
            addr,
            shutdown,
            stats,
            handle,
        },
        rx,
    )
}

async fn wait_for<F>(stats: &ServerStats, condition: F) -> StatsSnapshot
where
    F: Fn(&StatsSnapshot) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = stats.snapshot();
            if condition(&snapshot) {
                return snapshot;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

async fn read_ack(stream: &mut TcpStream, expected: &str) {
    let mut buf = vec![0u8; expected.len()];
    timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .expect("acknowledgement timed out")
        .expect("read acknowledgement");
    assert_eq!(String::from_utf8(buf).unwrap(), expected);
}

#[tokio::test]
async fn test_hello_is_routed_and_acknowledged() {
    let (running, mut rx) = start_routing(test_config()).await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let client_addr = client.local_addr().unwrap();
    client.write_all(b"hello").await.unwrap();

    let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(msg.source(), client_addr);
    assert_eq!(&msg.payload()[..], b"hello");
    assert_eq!(
        msg.to_string(),
        format!("New Message from {}: hello", client_addr)
    );

    read_ack(&mut client, &format!("Received, {}!\n", client_addr)).await;

    running.shutdown.trigger();
    drop(client);
    running.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrent_connections_deliver_exactly_once() {
    let (running, mut rx) = start_routing(test_config()).await;
    let num_clients = 10;

    let mut clients = Vec::new();
    for i in 0..num_clients {
        let addr = running.addr;
        clients.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let local = stream.local_addr().unwrap();
            stream.write_all(format!("client {}", i).as_bytes()).await.unwrap();
            read_ack(&mut stream, &format!("Received, {}!\n", local)).await;
            (local, format!("client {}", i))
        }));
    }

    let mut received: Vec<Message> = Vec::new();
    for _ in 0..num_clients {
        received.push(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap());
    }

    let mut expected = Vec::new();
    for client in clients {
        expected.push(client.await.unwrap());
    }

    let mut got: Vec<(SocketAddr, String)> = received
        .iter()
        .map(|m| (m.source(), String::from_utf8(m.payload().to_vec()).unwrap()))
        .collect();
    got.sort();
    expected.sort();
    assert_eq!(got, expected);

    // Nothing else is in flight.
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    assert_eq!(running.stats.snapshot().messages_routed, num_clients as u64);

    running.shutdown.trigger();
    running.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bind_fails_when_address_in_use() {
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = occupied.local_addr().unwrap();

    let config = ServerConfig {
        bind_addr: addr.to_string(),
        ..test_config()
    };
    let shutdown = ShutdownCoordinator::new(config.shutdown_timeout);
    let (server, _rx) = Server::with_router(config, shutdown);

    let result = timeout(Duration::from_secs(2), server.start()).await.unwrap();
    assert!(matches!(result, Err(ServerError::Bind { .. })));
}

#[tokio::test]
async fn test_bind_fails_on_malformed_address() {
    let config = ServerConfig {
        bind_addr: "definitely not an address".to_string(),
        ..test_config()
    };
    let shutdown = ShutdownCoordinator::new(config.shutdown_timeout);
    let (server, mut rx) = Server::with_router(config, shutdown);
    let stats = server.stats();

    let result = timeout(Duration::from_secs(2), server.start()).await.unwrap();
    assert!(matches!(result, Err(ServerError::Bind { .. })));
    assert_eq!(stats.snapshot(), StatsSnapshot::default());
    // The failed server dropped its sender, so the consumer sees the close.
    assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_bind_is_idempotent() {
    let shutdown = ShutdownCoordinator::new(Duration::from_secs(1));
    let mut server = Server::new(test_config(), shutdown);

    let first = server.bind().await.unwrap();
    let second = server.bind().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(server.local_addr(), Some(first));
}

#[tokio::test]
async fn test_peer_disconnect_releases_read_task() {
    let (running, mut rx) = start_routing(test_config()).await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    client.write_all(b"bye").await.unwrap();
    timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();

    wait_for(&running.stats, |s| s.active == 1).await;
    drop(client);

    let snapshot = wait_for(&running.stats, |s| s.active == 0).await;
    assert_eq!(snapshot.accepted, 1);
    assert_eq!(snapshot.closed, 1);

    running.shutdown.trigger();
    running.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_large_payload_is_split_into_bounded_messages() {
    let (running, mut rx) = start_routing(test_config()).await;

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let mut client = TcpStream::connect(running.addr).await.unwrap();
    client.write_all(&payload).await.unwrap();

    let mut reassembled = Vec::new();
    while reassembled.len() < payload.len() {
        let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(!msg.payload().is_empty());
        assert!(msg.payload().len() <= 2048);
        reassembled.extend_from_slice(msg.payload());
    }
    assert_eq!(reassembled, payload);

    running.shutdown.trigger();
    drop(client);
    running.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_channel_and_connections() {
    let (running, mut rx) = start_routing(test_config()).await;

    let mut idle = TcpStream::connect(running.addr).await.unwrap();
    wait_for(&running.stats, |s| s.active == 1).await;

    running.shutdown.trigger();
    timeout(Duration::from_secs(3), running.handle)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
    assert_eq!(running.stats.active_connections(), 0);

    // The server side of the idle connection has been released.
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(1), idle.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    // And the listener is gone.
    assert!(TcpStream::connect(running.addr).await.is_err());
}

#[tokio::test]
async fn test_slow_consumer_applies_backpressure() {
    let (running, mut rx) = start_routing(test_config()).await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let client_addr = client.local_addr().unwrap();
    client.write_all(b"waiting").await.unwrap();

    // No one has received yet, so no acknowledgement can have been written.
    let mut buf = [0u8; 64];
    assert!(timeout(Duration::from_millis(200), client.read(&mut buf)).await.is_err());

    let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(&msg.payload()[..], b"waiting");
    read_ack(&mut client, &format!("Received, {}!\n", client_addr)).await;

    running.shutdown.trigger();
    running.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_log_only_mode_sends_no_reply() {
    let config = ServerConfig {
        mode: ServerMode::LogOnly,
        ..test_config()
    };
    let shutdown = ShutdownCoordinator::new(config.shutdown_timeout);
    let (mut server, rx) = Server::from_config(config, shutdown.clone());
    assert!(rx.is_none());

    let addr = server.bind().await.unwrap();
    let stats = server.stats();
    let handle = tokio::spawn(server.start());

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"just log me").await.unwrap();

    let snapshot = wait_for(&stats, |s| s.bytes_read == 11).await;
    assert_eq!(snapshot.messages_routed, 0);

    let mut buf = [0u8; 16];
    assert!(timeout(Duration::from_millis(200), client.read(&mut buf)).await.is_err());

    shutdown.trigger();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_port_shorthand_binds_all_interfaces() {
    let config = ServerConfig {
        bind_addr: ":0".to_string(),
        ..test_config()
    };
    let shutdown = ShutdownCoordinator::new(config.shutdown_timeout);
    let mut server = Server::new(config, shutdown);

    let addr = server.bind().await.unwrap();
    assert!(addr.ip().is_unspecified());
    assert_ne!(addr.port(), 0);
}
