//! Registry lifecycle tests over real sockets.

use std::sync::Arc;
use std::time::Duration;

use portlink_config::{BackendConfig, BalanceMode, LinkConfig, ProtocolFamily, TlsMode};
use portlink_registry::{LinkRegistry, LinkState, LinkStore, MemoryStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_echo_backend() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// Reserve an ephemeral port and release it for the caller to bind.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn link_config(port: u16, backend_addr: String) -> LinkConfig {
    LinkConfig {
        bind_address: "127.0.0.1".to_string(),
        bind_port: port,
        protocol: ProtocolFamily::Tcp,
        tls: TlsMode::Null,
        mode: BalanceMode::RoundRobin,
        backends: vec![BackendConfig {
            address: backend_addr,
            protocol: ProtocolFamily::Tcp,
            tls: TlsMode::Null,
            dial_timeout_secs: 1,
            weight: 1,
            standby: false,
        }],
    }
}

async fn connect_and_prime(port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(b"x").await.unwrap();
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte).await.unwrap();
    stream
}

#[tokio::test]
async fn test_add_find_and_snapshot() {
    let echo = spawn_echo_backend().await;
    let registry = LinkRegistry::new(Arc::new(MemoryStore::new()));

    let port = free_port().await;
    let config = link_config(port, echo.to_string());
    registry.add_link(config.clone()).await.unwrap();

    let found = registry.find_link(&config.bind()).await.unwrap();
    assert_eq!(found, config);
    assert!(registry.find_link("10.9.8.7:1").await.is_none());

    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].bind, config.bind());
    assert_eq!(snapshot[0].mode, "RoundRobin");
    assert_eq!(snapshot[0].state, LinkState::Linked);
    assert_eq!(snapshot[0].channels, 0);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_bind_rejected() {
    let echo = spawn_echo_backend().await;
    let registry = LinkRegistry::new(Arc::new(MemoryStore::new()));

    let port = free_port().await;
    registry
        .add_link(link_config(port, echo.to_string()))
        .await
        .unwrap();

    let result = registry.add_link(link_config(port, echo.to_string())).await;
    assert!(matches!(
        result,
        Err(portlink_registry::RegistryError::DuplicateBind(_))
    ));
    assert_eq!(registry.snapshot().await.len(), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_bind_in_use_leaves_registry_unchanged() {
    let echo = spawn_echo_backend().await;
    let registry = LinkRegistry::new(Arc::new(MemoryStore::new()));

    // Another process (here: another listener) already owns the port.
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let result = registry.add_link(link_config(port, echo.to_string())).await;
    assert!(result.is_err());
    assert!(registry.snapshot().await.is_empty());

    registry.shutdown().await;
}

#[tokio::test]
async fn test_remove_force_closes_active_connections() {
    let echo = spawn_echo_backend().await;
    let registry = LinkRegistry::new(Arc::new(MemoryStore::new()));

    let port = free_port().await;
    let config = link_config(port, echo.to_string());
    registry.add_link(config.clone()).await.unwrap();

    let mut streams = Vec::new();
    for _ in 0..5 {
        streams.push(connect_and_prime(port).await);
    }
    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot[0].channels, 5);

    registry.remove_links(&[config.bind()]).await;
    assert!(registry.snapshot().await.is_empty());

    // remove_links returns only after every proxied socket is closed.
    for mut stream in streams {
        let n = stream.read(&mut [0u8; 8]).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    registry.shutdown().await;
}

#[tokio::test]
async fn test_remove_unknown_bind_is_skipped() {
    let registry = LinkRegistry::new(Arc::new(MemoryStore::new()));
    registry.remove_links(&["127.0.0.1:1".to_string()]).await;
    assert!(registry.snapshot().await.is_empty());
    registry.shutdown().await;
}

#[tokio::test]
async fn test_stop_and_start_toggle_instance_only() {
    let echo = spawn_echo_backend().await;
    let registry = LinkRegistry::new(Arc::new(MemoryStore::new()));

    let port = free_port().await;
    let config = link_config(port, echo.to_string());
    let bind = config.bind();
    registry.add_link(config.clone()).await.unwrap();

    registry.stop_links(std::slice::from_ref(&bind)).await;
    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot[0].state, LinkState::Unlinked);
    assert_eq!(snapshot[0].channels, 0);
    // Configuration survives the stop.
    assert_eq!(registry.find_link(&bind).await.unwrap(), config);
    // The port is released.
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    // Stopping again is a no-op.
    registry.stop_links(std::slice::from_ref(&bind)).await;

    registry.start_links(std::slice::from_ref(&bind)).await;
    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot[0].state, LinkState::Linked);
    let _stream = connect_and_prime(port).await;

    // Starting again is a no-op.
    registry.start_links(std::slice::from_ref(&bind)).await;
    assert_eq!(registry.snapshot().await.len(), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_throughput_is_a_delta() {
    let echo = spawn_echo_backend().await;
    let registry = LinkRegistry::new(Arc::new(MemoryStore::new()));

    let port = free_port().await;
    registry
        .add_link(link_config(port, echo.to_string()))
        .await
        .unwrap();

    let _stream = connect_and_prime(port).await;

    // Let the relay counters settle; the echoed byte is already read but
    // the counter update races the snapshot by a hair.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // One byte echoed: one byte up, one byte down.
    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot[0].throughput, 2);

    // No traffic since the last observation.
    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot[0].throughput, 0);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_persistence_and_reload() {
    let echo = spawn_echo_backend().await;
    let store = Arc::new(MemoryStore::new());

    // Reserve two distinct ports before releasing either.
    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port_a = listener_a.local_addr().unwrap().port();
    let port_b = listener_b.local_addr().unwrap().port();
    drop(listener_a);
    drop(listener_b);

    {
        let registry = LinkRegistry::new(store.clone());
        registry
            .add_link(link_config(port_a, echo.to_string()))
            .await
            .unwrap();
        registry
            .add_link(link_config(port_b, echo.to_string()))
            .await
            .unwrap();
        registry.shutdown().await;
    }
    assert_eq!(store.load().unwrap().len(), 2);

    // Occupy one stored port: that link must be dropped at reload, the
    // other reconstructed.
    let _taken = TcpListener::bind(("127.0.0.1", port_a)).await.unwrap();

    let registry = LinkRegistry::new(store.clone());
    registry.load_from_store().await;

    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].bind, format!("127.0.0.1:{port_b}"));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_monitor_publishes_snapshots() {
    let echo = spawn_echo_backend().await;
    let registry = Arc::new(LinkRegistry::new(Arc::new(MemoryStore::new())));

    let port = free_port().await;
    registry
        .add_link(link_config(port, echo.to_string()))
        .await
        .unwrap();

    let mut rx = registry.subscribe();
    registry.start_monitor(Duration::from_millis(20));

    rx.changed().await.unwrap();
    let snapshot = rx.borrow_and_update().clone();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].state, LinkState::Linked);

    registry.shutdown().await;
}
