//! Listener runtime: owns up to two bound sockets (v4, v6) for
//! one listener config and accepts clients into new connection tasks.
//!
//! A subtlety in handing each accepted client to a new connection task:
//! "the current snapshot" means *current*, not *the snapshot this
//! listener was created from*. A listener's own config can itself change
//! shape across a reload (different routes, different timeouts) while its
//! bound socket stays untouched, so every accept re-resolves this runtime's
//! listener config from whatever [`crate::config::Current`] holds right
//! now, keyed by [`BindKey`], not from a config captured at listener
//! startup.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::{Current, ListenerConfig};
use crate::error::BindError;
use crate::resolver::Resolver;

/// The three fields the socket-equivalence rule compares. Bind
/// address family enablement is folded into `bind_v4`/`bind_v6` each being
/// `Some`/`None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindKey {
    pub bind_v4: Option<IpAddr>,
    pub bind_v6: Option<IpAddr>,
    pub bind_port: u16,
}

impl BindKey {
    pub fn of(listener: &ListenerConfig) -> Self {
        BindKey {
            bind_v4: listener.bind_v4,
            bind_v6: listener.bind_v6,
            bind_port: listener.bind_port,
        }
    }
}

/// A bound, running listener. Dropping the accept task (via the shutdown
/// channel) closes its sockets; that is the only way a socket in this
/// program ever closes, which avoids any port-reuse race: an fd is owned
/// by exactly one runtime's task until that task exits.
pub struct ListenerRuntime {
    pub bind_key: BindKey,
    local_v4: Option<SocketAddr>,
    local_v6: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ListenerRuntime {
    /// Binds `listener`'s sockets and spawns its accept loop. The loop
    /// looks up `bind_key` afresh in `current` on every accept, so it keeps
    /// working unmodified across any number of reloads that preserve a
    /// socket-equivalent listener at this bind key.
    pub fn spawn(
        listener: &ListenerConfig,
        current: Arc<Current>,
        resolver: Arc<dyn Resolver>,
        connections: Arc<Mutex<JoinSet<()>>>,
    ) -> Result<Self, BindError> {
        let bind_key = BindKey::of(listener);

        let v4 = match bind_key.bind_v4 {
            Some(addr) => Some(bind_blocking(SocketAddr::new(addr, bind_key.bind_port))?),
            None => None,
        };
        let v6 = match bind_key.bind_v6 {
            Some(addr) => Some(bind_blocking(SocketAddr::new(addr, bind_key.bind_port))?),
            None => None,
        };

        let local_v4 = v4.as_ref().and_then(|l| l.local_addr().ok());
        let local_v6 = v6.as_ref().and_then(|l| l.local_addr().ok());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let key_for_task = bind_key.clone();
        let task = tokio::spawn(accept_loop(
            key_for_task,
            v4,
            v6,
            current,
            resolver,
            connections,
            shutdown_rx,
        ));

        Ok(ListenerRuntime {
            bind_key,
            local_v4,
            local_v6,
            shutdown_tx,
            task,
        })
    }

    /// The socket address actually bound for the v4 (or v6) side, including
    /// the OS-assigned port when the configured `bind_port` was 0. Useful
    /// for tests that bind an ephemeral port and then need to connect back.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_v4.or(self.local_v6)
    }

    /// Signals the accept loop to stop and waits for it to exit, closing
    /// its sockets.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

fn bind_blocking(addr: SocketAddr) -> Result<std::net::TcpListener, BindError> {
    let std_listener = std::net::TcpListener::bind(addr).map_err(|source| BindError::Bind { addr, source })?;
    std_listener
        .set_nonblocking(true)
        .map_err(|source| BindError::Bind { addr, source })?;
    Ok(std_listener)
}

async fn accept_loop(
    bind_key: BindKey,
    v4: Option<std::net::TcpListener>,
    v6: Option<std::net::TcpListener>,
    current: Arc<Current>,
    resolver: Arc<dyn Resolver>,
    connections: Arc<Mutex<JoinSet<()>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let v4 = v4.map(|l| TcpListener::from_std(l).expect("converting a just-bound std listener"));
    let v6 = v6.map(|l| TcpListener::from_std(l).expect("converting a just-bound std listener"));

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            result = accept_either(&v4, &v6) => result,
        };

        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!("accept failed on listener {bind_key:?}: {err}");
                continue;
            }
        };

        let snapshot = current.load();
        let Some(listener_config) = find_listener(&snapshot, &bind_key) else {
            // This bind key no longer exists in the current snapshot but
            // our own shutdown signal hasn't arrived yet; drop the
            // connection rather than serve it with stale config.
            continue;
        };

        info!("accepted connection from {peer_addr} on {bind_key:?}");
        connections.lock().unwrap().spawn(crate::connection::run(
            stream,
            peer_addr,
            snapshot,
            listener_config,
            resolver.clone(),
        ));
    }
}

async fn accept_either(
    v4: &Option<TcpListener>,
    v6: &Option<TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match (v4, v6) {
        (Some(v4), Some(v6)) => {
            tokio::select! {
                result = v4.accept() => result,
                result = v6.accept() => result,
            }
        }
        (Some(v4), None) => v4.accept().await,
        (None, Some(v6)) => v6.accept().await,
        (None, None) => std::future::pending().await,
    }
}

fn find_listener(snapshot: &crate::config::ConfigSnapshot, bind_key: &BindKey) -> Option<Arc<ListenerConfig>> {
    snapshot
        .listeners
        .iter()
        .find(|l| &BindKey::of(l) == bind_key)
        .cloned()
        .map(Arc::new)
}
