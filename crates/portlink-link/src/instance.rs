//! Runtime state machine for one configured link.
//!
//! A link instance owns a bound listener and an accept loop. Each
//! accepted connection gets its own handler task: pick a backend, dial
//! it, wrap either hop in TLS when configured, then relay both
//! directions until the flow ends. Active flows are registered in a
//! channel map so the registry can observe them and `close` can force
//! them down.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portlink_balance::LoadBalancer;
use portlink_cert::ClientTls;
use portlink_config::{BackendConfig, BalanceMode, LinkConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::relay::{relay_direction, Channel, ChannelMap};
use crate::LinkError;

/// Any byte stream a proxied hop can run over (plain TCP or TLS).
trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

type BoxedStream = Box<dyn LinkStream>;

/// State shared between the instance handle and its spawned tasks.
struct LinkShared {
    bind: String,
    local_addr: SocketAddr,
    config: LinkConfig,
    balancer: LoadBalancer,
    /// Client-facing TLS termination, when the link mode enables it.
    acceptor: Option<TlsAcceptor>,
    /// Backend-facing TLS origination, per backend.
    client_tls: Vec<Option<ClientTls>>,
    /// Cumulative bytes relayed in either direction across all channels.
    flow: Arc<AtomicU64>,
    channels: ChannelMap,
    shutdown: CancellationToken,
}

/// A running link: listener bound, accept loop live. Dropped or closed,
/// every task it spawned is joined before `close` returns.
pub struct LinkInstance {
    shared: Arc<LinkShared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl LinkInstance {
    /// Bind the listener and start the accept loop. Any failure
    /// (validation, balancer construction, certificate provisioning,
    /// bind) is returned and no instance exists afterwards.
    pub async fn start(config: LinkConfig) -> Result<LinkInstance, LinkError> {
        config.validate()?;

        let balancer = LoadBalancer::new(config.mode, &config.backends)?;

        let acceptor = if config.tls.is_enabled() {
            let server = portlink_cert::server_config(&config.bind_address, config.tls)?;
            Some(TlsAcceptor::from(server))
        } else {
            None
        };

        let client_tls = config
            .backends
            .iter()
            .map(|backend| {
                if backend.tls.is_enabled() {
                    portlink_cert::client_config(backend.host(), &config.bind_address, backend.tls)
                        .map(Some)
                } else {
                    Ok(None)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let bind = config.bind();
        let listener = bind_listener(&config).await?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(LinkShared {
            bind,
            local_addr,
            config,
            balancer,
            acceptor,
            client_tls,
            flow: Arc::new(AtomicU64::new(0)),
            channels: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        });

        let accept_task = tokio::spawn(accept_loop(shared.clone(), listener));

        Ok(LinkInstance {
            shared,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// The `address:port` string this link is configured to bind.
    pub fn bind(&self) -> &str {
        &self.shared.bind
    }

    /// The address actually bound (resolves port 0 binds).
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    /// Number of currently active proxied connections.
    pub fn channel_count(&self) -> usize {
        self.shared.channels.lock().unwrap().len()
    }

    /// Cumulative bytes relayed since the instance started.
    pub fn total_flow(&self) -> u64 {
        self.shared.flow.load(Ordering::Relaxed)
    }

    /// Stop accepting, force every in-flight channel down, and wait until
    /// the accept loop and every handler task have returned. Idempotent.
    pub async fn close(&self) {
        self.shared.shutdown.cancel();

        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            if task.await.is_err() {
                warn!(bind = %self.shared.bind, "accept loop panicked");
            }
            info!(bind = %self.shared.bind, "link instance closed");
        }
    }
}

/// Resolve the configured bind endpoint within its address family and
/// bind a listener to the first matching address.
async fn bind_listener(config: &LinkConfig) -> Result<TcpListener, LinkError> {
    let bind = config.bind();
    let candidate = tokio::net::lookup_host(bind.as_str())
        .await
        .map_err(|err| LinkError::Bind {
            address: bind.clone(),
            reason: err.to_string(),
        })?
        .find(|addr| config.protocol.matches(addr));

    let Some(addr) = candidate else {
        return Err(LinkError::Bind {
            address: bind,
            reason: "no address in the configured family".to_string(),
        });
    };

    TcpListener::bind(addr).await.map_err(|err| LinkError::Bind {
        address: bind,
        reason: err.to_string(),
    })
}

async fn accept_loop(shared: Arc<LinkShared>, listener: TcpListener) {
    info!(bind = %shared.bind, "link instance started");

    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            biased;

            _ = shared.shutdown.cancelled() => break,

            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let shared = shared.clone();
                    handlers.spawn(handle_connection(shared, stream, peer));
                }
                Err(err) => {
                    warn!(bind = %shared.bind, error = %err, "accept failed");
                }
            },

            // Reap finished handlers so the set does not grow unbounded.
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }

    drop(listener);
    while handlers.join_next().await.is_some() {}

    info!(bind = %shared.bind, "link instance shut down");
}

async fn handle_connection(shared: Arc<LinkShared>, client: TcpStream, peer: SocketAddr) {
    let key = peer.to_string();

    // Backend dial and TLS handshakes race the close signal; a closing
    // instance abandons half-set-up connections instead of finishing them.
    let shutdown = shared.shutdown.clone();
    let streams = tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        streams = establish(&shared, client, &key) => streams,
    };
    let Some((client, remote)) = streams else {
        return;
    };

    debug!(bind = %shared.bind, peer = %key, "new channel");

    let channel = Channel::new(key.clone());
    shared
        .channels
        .lock()
        .unwrap()
        .insert(key.clone(), channel.clone());

    let cancel = shared.shutdown.child_token();
    let (client_read, client_write) = tokio::io::split(client);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let upstream = tokio::spawn(relay_direction(
        client_read,
        remote_write,
        channel.bytes_received.clone(),
        shared.flow.clone(),
        cancel.clone(),
    ));
    let downstream = tokio::spawn(relay_direction(
        remote_read,
        client_write,
        channel.bytes_sent.clone(),
        shared.flow.clone(),
        cancel,
    ));
    let _ = tokio::join!(upstream, downstream);

    shared.channels.lock().unwrap().remove(&channel.peer);

    debug!(
        bind = %shared.bind,
        peer = %key,
        received = channel.bytes_received.load(Ordering::Relaxed),
        sent = channel.bytes_sent.load(Ordering::Relaxed),
        "channel closed"
    );
}

/// Pick a backend, dial it, and wrap both hops as configured. Returns
/// the client-facing and backend-facing streams, or `None` when this
/// connection cannot be established (logged, never fatal to the link).
async fn establish(
    shared: &LinkShared,
    client: TcpStream,
    key: &str,
) -> Option<(BoxedStream, BoxedStream)> {
    let (index, remote) = connect_backend(shared, key).await?;

    let remote: BoxedStream = match &shared.client_tls[index] {
        Some(tls) => {
            let connector = TlsConnector::from(tls.config.clone());
            match connector.connect(tls.server_name.clone(), remote).await {
                Ok(stream) => Box::new(stream),
                Err(err) => {
                    warn!(bind = %shared.bind, backend = %shared.config.backends[index].address,
                          error = %err, "backend TLS handshake failed");
                    return None;
                }
            }
        }
        None => Box::new(remote),
    };

    let client: BoxedStream = match &shared.acceptor {
        Some(acceptor) => match acceptor.accept(client).await {
            Ok(stream) => Box::new(stream),
            Err(err) => {
                warn!(bind = %shared.bind, peer = %key, error = %err,
                      "client TLS handshake failed");
                return None;
            }
        },
        None => Box::new(client),
    };

    Some((client, remote))
}

/// Ask the balancer for a backend and dial it. Dial failure ends the
/// connection, except in main/standby mode: there the standby backends
/// are tried in configured order until one answers.
async fn connect_backend(shared: &LinkShared, key: &str) -> Option<(usize, TcpStream)> {
    let primary = shared.balancer.next(key);
    let backend = &shared.config.backends[primary];

    match dial(backend).await {
        Ok(stream) => return Some((primary, stream)),
        Err(err) => {
            warn!(bind = %shared.bind, backend = %backend.address, error = %err, "dial failed");
        }
    }

    if shared.config.mode != BalanceMode::MainStandby {
        return None;
    }

    for (index, backend) in shared.config.backends.iter().enumerate() {
        if index == primary || !backend.standby {
            continue;
        }
        match dial(backend).await {
            Ok(stream) => {
                info!(bind = %shared.bind, backend = %backend.address, "failover to standby");
                return Some((index, stream));
            }
            Err(err) => {
                warn!(bind = %shared.bind, backend = %backend.address, error = %err,
                      "standby dial failed");
            }
        }
    }
    None
}

/// Dial one backend within its address family, honoring its configured
/// timeout (0 blocks until the connect resolves).
async fn dial(backend: &BackendConfig) -> io::Result<TcpStream> {
    let connect = async {
        let mut last_err = None;
        for addr in tokio::net::lookup_host(backend.address.as_str()).await? {
            if !backend.protocol.matches(&addr) {
                continue;
            }
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no address in the configured family",
            )
        }))
    };

    if backend.dial_timeout_secs == 0 {
        connect.await
    } else {
        tokio::time::timeout(Duration::from_secs(backend.dial_timeout_secs), connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))?
    }
}
