//! Listener set orchestration across config reloads and graceful shutdown.
//!
//! A naive migration scheme would transfer a bound fd from the old listener
//! struct to the new one on every reload. An async Rust accept loop doesn't
//! need the transfer at all: [`crate::listener::ListenerRuntime`]'s accept
//! loop re-resolves its own listener config from whatever snapshot is
//! current on every accept (keyed by [`BindKey`]), so a socket-equivalent
//! listener across a reload just keeps running, unmodified, through the
//! same task; the socket was never not-owned-by-exactly-one-runtime in
//! the first place. This supervisor's job shrinks to: bind sockets for
//! genuinely new bind keys, and shut down sockets for bind keys that
//! disappeared.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use tokio::task::JoinSet;

use crate::config::{ConfigData, Current};
use crate::error::BindError;
use crate::listener::{BindKey, ListenerRuntime};
use crate::resolver::Resolver;

pub struct Supervisor {
    current: Arc<Current>,
    resolver: Arc<dyn Resolver>,
    runtimes: HashMap<BindKey, ListenerRuntime>,
    /// Every connection task any accept loop has spawned, regardless of
    /// which listener accepted it. Shared so `shutdown` can wait for
    /// them to drain instead of only waiting for accept loops to exit.
    connections: Arc<Mutex<JoinSet<()>>>,
}

impl Supervisor {
    /// Binds every listener in `initial` and returns the running
    /// supervisor along with the `Current` it installed `initial` into.
    pub fn start(initial: ConfigData, resolver: Arc<dyn Resolver>) -> Result<Self, BindError> {
        let current = Arc::new(Current::new(initial));
        let mut supervisor = Supervisor {
            current,
            resolver,
            runtimes: HashMap::new(),
            connections: Arc::new(Mutex::new(JoinSet::new())),
        };
        let snapshot = supervisor.current.load();
        for listener in &snapshot.listeners {
            supervisor.add_runtime(listener)?;
        }
        Ok(supervisor)
    }

    pub fn current(&self) -> Arc<Current> {
        self.current.clone()
    }

    /// Installs `new_data` as current and reconciles the listener set:
    /// bind fresh sockets for bind keys not already running,
    /// stop and close sockets for bind keys no longer present. Bind keys
    /// present in both the old and new snapshot keep their already-running
    /// accept loop untouched; see the module doc for why that is
    /// sufficient to satisfy the migration invariant.
    pub async fn reconcile(&mut self, new_data: ConfigData) {
        let new_keys: Vec<BindKey> = new_data.listeners.iter().map(BindKey::of).collect();

        self.current.store(new_data);

        let stale: Vec<BindKey> = self
            .runtimes
            .keys()
            .filter(|key| !new_keys.contains(key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(runtime) = self.runtimes.remove(&key) {
                info!("reload: closing listener {key:?}, no longer configured");
                runtime.shutdown().await;
            }
        }

        let snapshot = self.current.load();
        for listener in &snapshot.listeners {
            let key = BindKey::of(listener);
            if !self.runtimes.contains_key(&key) {
                if let Err(err) = self.add_runtime(listener) {
                    warn!("reload: failed to bind new listener {key:?}: {err}");
                }
            }
        }
    }

    fn add_runtime(&mut self, listener: &crate::config::ListenerConfig) -> Result<(), BindError> {
        let key = BindKey::of(listener);
        let runtime = ListenerRuntime::spawn(
            listener,
            self.current.clone(),
            self.resolver.clone(),
            self.connections.clone(),
        )?;
        info!("listening on {key:?}");
        self.runtimes.insert(key, runtime);
        Ok(())
    }

    /// Number of currently-running listener accept loops. Test/introspection
    /// only.
    pub fn listener_count(&self) -> usize {
        self.runtimes.len()
    }

    /// The actual bound address of a running listener matching `key`,
    /// including the OS-assigned port if it was configured as 0.
    /// Test/introspection only.
    pub fn local_addr(&self, key: &BindKey) -> Option<std::net::SocketAddr> {
        self.runtimes.get(key).and_then(|runtime| runtime.local_addr())
    }

    /// Stops every listener's accept loop so no new connection arrives,
    /// then waits up to `timeout` total for every already-accepted
    /// connection to finish on its own. Connections still running when
    /// `timeout` elapses are aborted: dropping the `JoinSet` that still
    /// holds them cancels whatever they were doing.
    pub async fn shutdown(mut self, timeout: Duration) {
        let runtimes: Vec<_> = self.runtimes.drain().collect();
        let deadline = tokio::time::Instant::now() + timeout;

        let stop_accepting = async {
            for (_, runtime) in runtimes {
                runtime.shutdown().await;
            }
        };
        if tokio::time::timeout_at(deadline, stop_accepting).await.is_err() {
            warn!("accept loop shutdown did not complete within {timeout:?}");
        }

        let mut connections = std::mem::replace(&mut *self.connections.lock().unwrap(), JoinSet::new());
        let remaining = connections.len();
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if remaining > 0 && tokio::time::timeout_at(deadline, drain).await.is_err() {
            warn!("{remaining} connection(s) still in flight after {timeout:?}, aborting");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{ListenerConfig, Route, SlotRoutes};
    use crate::resolver::MockResolver;

    fn listener_on_port(port: u16) -> ListenerConfig {
        ListenerConfig {
            bind_v4: Some("127.0.0.1".parse().unwrap()),
            bind_v6: None,
            bind_port: port,
            routes: vec![],
            slots: SlotRoutes {
                default_route: Some(Route::hangup()),
                ..SlotRoutes::default()
            },
            hello_timeout_secs: 2,
            connect_timeout_secs: 2,
            idle_timeout_secs: 2,
        }
    }

    fn data_with(listeners: Vec<ListenerConfig>) -> ConfigData {
        ConfigData {
            listeners,
            global_slots: SlotRoutes::default(),
            user: None,
            group: None,
            disable_ipv4: false,
            disable_ipv6: false,
        }
    }

    #[tokio::test]
    async fn reload_with_same_bind_key_keeps_one_running_listener() {
        let listener = listener_on_port(0); // port 0: OS assigns an ephemeral port
        let resolver: Arc<dyn Resolver> = Arc::new(MockResolver::new());
        let mut supervisor = Supervisor::start(data_with(vec![listener.clone()]), resolver).unwrap();
        assert_eq!(supervisor.listener_count(), 1);

        // Same bind key (bind_port 0 is part of the key as configured, not
        // the OS-assigned ephemeral port), different route table: this
        // must not close and rebind the listener.
        let mut reloaded = listener.clone();
        reloaded.routes.push(Route {
            action: crate::config::Action::Hangup,
            sni_pattern: crate::config::SniPattern::parse("example.com"),
        });
        supervisor.reconcile(data_with(vec![reloaded])).await;
        assert_eq!(supervisor.listener_count(), 1);

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn reload_removing_a_listener_stops_it() {
        let listener = listener_on_port(0);
        let resolver: Arc<dyn Resolver> = Arc::new(MockResolver::new());
        let mut supervisor = Supervisor::start(data_with(vec![listener]), resolver).unwrap();
        assert_eq!(supervisor.listener_count(), 1);

        supervisor.reconcile(data_with(vec![])).await;
        assert_eq!(supervisor.listener_count(), 0);

        supervisor.shutdown(Duration::from_secs(1)).await;
    }
}
