// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-channel TCP server.
//!
//! One listener is shared by every run. A run registers the container's IP
//! with [`ControlServer::expect_connection`] and receives the connection that
//! arrives from that address. A connection from an address nobody is
//! waiting for is closed at once, so the container side retries until its
//! run has registered.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::ControlHandler;

/// Errors from the control server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControlError {
    /// The listener could not be bound.
    #[error("Failed to bind control channel on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error on the listener.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for control server operations.
pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    waiters: HashMap<IpAddr, (u64, oneshot::Sender<TcpStream>)>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

type Shared = Arc<Mutex<Registry>>;

fn lock(registry: &Shared) -> std::sync::MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared control-channel listener.
pub struct ControlServer {
    local_addr: SocketAddr,
    registry: Shared,
    shutdown_tx: watch::Sender<bool>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl ControlServer {
    /// Bind `addr` and start accepting.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ControlError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let registry: Shared = Arc::new(Mutex::new(Registry::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(accept_loop(listener, registry.clone(), shutdown_rx));
        info!(addr = %local_addr, "Control channel listening");

        Ok(Self {
            local_addr,
            registry,
            shutdown_tx,
            accept_handle: Mutex::new(Some(handle)),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port, advertised to containers as `HOST_PORT`.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Number of addresses currently awaited.
    pub fn pending_count(&self) -> usize {
        lock(&self.registry).waiters.len()
    }

    /// Await a connection from `ip`.
    ///
    /// Only connections accepted after this call are handed over. A later
    /// registration for the same address supersedes this one.
    pub fn expect_connection(&self, ip: IpAddr) -> PendingConnection {
        let ip = ip.to_canonical();
        let (tx, rx) = oneshot::channel();
        let mut registry = lock(&self.registry);
        let id = registry.next_id();

        if registry.waiters.insert(ip, (id, tx)).is_some() {
            warn!(ip = %ip, "Replacing existing control-channel registration");
        }
        debug!(ip = %ip, "Awaiting control-channel connection");

        PendingConnection {
            ip,
            id,
            rx,
            registry: self.registry.clone(),
        }
    }

    /// Stop accepting. Pending registrations resolve to `None`.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self
            .accept_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        lock(&self.registry).waiters.clear();
        info!(addr = %self.local_addr, "Control channel closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Shared,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => route(stream, peer, &registry),
                    Err(e) => warn!(error = %e, "Control channel accept failed"),
                }
            }
        }
    }
}

fn route(stream: TcpStream, peer: SocketAddr, registry: &Shared) {
    let ip = peer.ip().to_canonical();
    let waiter = lock(registry).waiters.remove(&ip);

    match waiter {
        Some((_, tx)) => {
            debug!(peer = %peer, "Control-channel connection matched");
            if tx.send(stream).is_err() {
                debug!(peer = %peer, "Run stopped waiting, closing connection");
            }
        }
        None => {
            // Dropping the stream discards anything it already sent.
            warn!(peer = %peer, "Unexpected control-channel connection, closing");
        }
    }
}

/// Registration for a connection from one address.
///
/// Dropping it withdraws the registration.
pub struct PendingConnection {
    ip: IpAddr,
    id: u64,
    rx: oneshot::Receiver<TcpStream>,
    registry: Shared,
}

impl PendingConnection {
    /// Address the connection is expected from.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Resolve once the container connects. `None` if the registration was
    /// superseded or the server shut down.
    pub async fn connected(&mut self) -> Option<TcpStream> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        let mut registry = lock(&self.registry);
        if registry
            .waiters
            .get(&self.ip)
            .is_some_and(|(id, _)| *id == self.id)
        {
            registry.waiters.remove(&self.ip);
        }
    }
}

/// A run's conversation with its container.
///
/// Waits for the connection in the background, then answers each line
/// through the handler until EOF or [`close`](ControlSession::close).
pub struct ControlSession {
    close_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ControlSession {
    /// Serve `pending` with `handler` in a background task.
    pub fn spawn(mut pending: PendingConnection, handler: Arc<dyn ControlHandler>) -> Self {
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let stream = tokio::select! {
                stream = pending.connected() => stream,
                _ = &mut close_rx => None,
            };
            let Some(stream) = stream else {
                debug!(ip = %pending.ip(), "Control session closed before the container connected");
                return;
            };
            drop(pending);

            if let Err(e) = serve(stream, handler, &mut close_rx).await {
                debug!(error = %e, "Control session ended with error");
            }
        });

        Self {
            close_tx: Some(close_tx),
            handle: Some(handle),
        }
    }

    /// Close the connection (or stop waiting for it) and wait for the task.
    pub async fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn serve(
    stream: TcpStream,
    handler: Arc<dyn ControlHandler>,
    close_rx: &mut oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut *close_rx => break,
        };
        let Some(line) = line else {
            break;
        };

        let reply = handler.handle_line(&line).await;
        write.write_all(reply.as_bytes()).await?;
        write.write_all(b"\n").await?;
        write.flush().await?;
    }

    let _ = write.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl ControlHandler for Echo {
        async fn handle_line(&self, line: &str) -> String {
            format!("ECHO {}", line)
        }
    }

    async fn server() -> ControlServer {
        ControlServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_session_answers_lines() {
        let server = server().await;
        let pending = server.expect_connection("127.0.0.1".parse().unwrap());
        let mut session = ControlSession::spawn(pending, Arc::new(Echo));

        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"one\ntwo\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "ECHO one");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "ECHO two");

        session.close().await;
        assert_eq!(lines.next_line().await.unwrap(), None);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unexpected_peer_is_closed() {
        let server = server().await;

        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let _ = write.write_all(b"NET ALLOW http://example.com\n").await;

        let next = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap();
        assert!(matches!(next, Ok(None) | Err(_)));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_connection_never_reaches_later_registration() {
        use crate::control::protocol::FirewallHandler;
        use crate::network::{ContainerFirewall, MacAddress, MockFirewallController, Protocol, Verdict};

        let server = server().await;

        // A leftover connection delivers a request and hangs up before any
        // run is waiting for its address.
        let mut stale = TcpStream::connect(server.local_addr()).await.unwrap();
        stale
            .write_all(b"NET ALLOW http://evil.example:4444\n")
            .await
            .unwrap();
        let _ = stale.shutdown().await;
        drop(stale);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ctrl = Arc::new(MockFirewallController::new());
        let mac = MacAddress::from_octets([0x42, 0xac, 0x11, 0x00, 0x09]);
        let firewall = Arc::new(ContainerFirewall::new(mac.clone(), ctrl.clone()));
        firewall.init().await.unwrap();

        let mut pending = server.expect_connection("127.0.0.1".parse().unwrap());
        assert!(
            tokio::time::timeout(Duration::from_millis(200), pending.connected())
                .await
                .is_err()
        );
        let mut session = ControlSession::spawn(
            pending,
            Arc::new(FirewallHandler::new(firewall.clone())),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            ctrl.evaluate(&mac, "evil.example", Protocol::Tcp, 4444),
            Verdict::Drop
        );
        session.close().await;
        assert!(firewall.rules().await.is_empty());
        firewall.delete().await.unwrap();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_registration_is_withdrawn() {
        let server = server().await;
        let pending = server.expect_connection("10.0.0.9".parse().unwrap());
        assert_eq!(server.pending_count(), 1);
        drop(pending);
        assert_eq!(server.pending_count(), 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_superseded_registration_keeps_newer() {
        let server = server().await;
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        let mut first = server.expect_connection(ip);
        let second = server.expect_connection(ip);

        assert!(first.connected().await.is_none());
        drop(first);
        assert_eq!(server.pending_count(), 1);
        drop(second);
        assert_eq!(server.pending_count(), 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let server = server().await;
        let pending = server.expect_connection("10.0.0.7".parse().unwrap());
        let mut session = ControlSession::spawn(pending, Arc::new(Echo));

        tokio::time::timeout(Duration::from_secs(2), session.close())
            .await
            .unwrap();
        assert_eq!(server.pending_count(), 0);
        server.shutdown().await;
    }

    #[test]
    fn test_ipv4_mapped_addresses_are_normalized() {
        let mapped: IpAddr = "::ffff:10.0.0.1".parse().unwrap();
        assert_eq!(mapped.to_canonical(), "10.0.0.1".parse::<IpAddr>().unwrap());
    }
}
