//! Per-connection state machine.
//!
//! One [`run`] call drives one accepted client socket from `ReadingHello`
//! through to `Closed`. There's no separate `Phase` type kept around as
//! data; the phases correspond to sections of this function and the
//! `match` on the matched [`Action`]; the phase is explicit in the control
//! flow and log lines rather than stored anywhere, since nothing outside
//! the driving task ever needs to query it. Every `.await` here is a
//! suspension point. The client socket is threaded through by value rather
//! than `&mut`, since the Splicing phase (`splice::splice`) needs to take
//! ownership of it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::model::SlotRoutes;
use crate::config::{Action, AlertSubtype, ConfigSnapshot, ListenerConfig, Route};
use crate::resolver::Resolver;
use crate::splice;
use crate::tls::{render_alert, ClientHelloError, ClientHelloParser, ParseOutcome};

/// Largest total ReadingHello buffer: if the ClientHello hasn't
/// finished arriving by this many bytes, it never will.
const MAX_HELLO_BYTES: usize = 18 * 1024;

/// Drives one accepted connection to completion. `snapshot` is the config
/// snapshot pinned at accept time; `listener` is this connection's
/// listener's config within that snapshot (both are `Arc`-backed clones,
/// cheap to hold for the connection's whole life).
pub async fn run(
    client: TcpStream,
    peer_addr: SocketAddr,
    snapshot: ConfigSnapshot,
    listener: Arc<ListenerConfig>,
    resolver: Arc<dyn Resolver>,
) {
    let hello_timeout = Duration::from_secs(listener.hello_timeout_secs);

    let (client, outcome, prefix, record_version) =
        match read_client_hello(client, hello_timeout).await {
            Ok(result) => result,
            Err(HelloReadError::Eof) | Err(HelloReadError::Io(_)) => {
                debug!("{peer_addr}: client closed before sending a ClientHello");
                return;
            }
            Err(HelloReadError::Timeout(mut client)) => {
                let route = snapshot.resolve_slot(&listener, |s| &s.tls_error_route);
                let action = force_alert_subtype(route.action, AlertSubtype::InternalError);
                emit(&mut client, &action, (3, 3)).await;
                return;
            }
        };

    let route = match &outcome {
        ParseOutcome::Done(sni) => {
            crate::config::match_route(&snapshot, &listener, sni.as_deref()).route
        }
        ParseOutcome::NotTls { looks_like_http: true } => {
            snapshot.resolve_slot(&listener, |s| &s.http_fallback_route)
        }
        ParseOutcome::NotTls { looks_like_http: false } => {
            snapshot.resolve_slot(&listener, |s| &s.tls_error_route)
        }
        ParseOutcome::Error(kind) => {
            debug!("{peer_addr}: ClientHello parse error: {kind:?}");
            snapshot.resolve_slot(&listener, |s| &s.tls_error_route)
        }
        ParseOutcome::NeedMore => unreachable!("read_client_hello only returns a terminal outcome"),
    };

    let was_tls_looking = !matches!(outcome, ParseOutcome::NotTls { .. });

    dispatch(
        client,
        route,
        prefix,
        record_version,
        was_tls_looking,
        &snapshot,
        &listener,
        resolver,
    )
    .await;
}

/// If `action` is `TlsAlert`, replaces its subtype with `subtype`; leaves
/// every other action untouched. Used by the hello-timeout path, which
/// always reports `InternalError` regardless of what the configured
/// `tls_error_route`'s alert subtype would otherwise have been.
fn force_alert_subtype(action: Action, subtype: AlertSubtype) -> Action {
    match action {
        Action::TlsAlert(_) => Action::TlsAlert(subtype),
        other => other,
    }
}

enum HelloReadError {
    Eof,
    Io(io::Error),
    /// Carries the client socket back so the timeout path can still write
    /// an alert to it.
    Timeout(TcpStream),
}

/// Reads from `client` until the parser reaches a terminal outcome, the
/// client closes, an I/O error occurs, or `hello_timeout` expires. Returns
/// the socket back (ownership round-trips through here), the terminal
/// outcome, every byte read so far (the ClientHello prefix that must be
/// replayed to the upstream on a successful Proxy connect), and the record
/// version seen, if any.
async fn read_client_hello(
    mut client: TcpStream,
    hello_timeout: Duration,
) -> Result<(TcpStream, ParseOutcome, Vec<u8>, (u8, u8)), HelloReadError> {
    let mut parser = ClientHelloParser::new();
    let mut prefix = Vec::new();
    let mut buf = [0u8; 4096];

    let body = async {
        loop {
            let n = client.read(&mut buf).await.map_err(HelloReadError::Io)?;
            if n == 0 {
                return Err(HelloReadError::Eof);
            }
            prefix.extend_from_slice(&buf[..n]);
            if prefix.len() > MAX_HELLO_BYTES {
                return Ok(ParseOutcome::Error(ClientHelloError::RecordTooLarge));
            }

            let outcome = parser.feed(&buf[..n]);
            if outcome != ParseOutcome::NeedMore {
                return Ok(outcome);
            }
        }
    };

    match tokio::time::timeout(hello_timeout, body).await {
        Ok(Ok(outcome)) => {
            let version = parser.record_version().unwrap_or((3, 3));
            Ok((client, outcome, prefix, version))
        }
        Ok(Err(err)) => Err(err),
        Err(_) => Err(HelloReadError::Timeout(client)),
    }
}

/// Acts on the matched route.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    client: TcpStream,
    route: Route,
    prefix: Vec<u8>,
    record_version: (u8, u8),
    was_tls_looking: bool,
    snapshot: &ConfigSnapshot,
    listener: &ListenerConfig,
    resolver: Arc<dyn Resolver>,
) {
    // A TlsAlert route only makes sense once the client has actually shown
    // us a syntactically-plausible TLS prefix: otherwise it degrades to a
    // plain Hangup.
    let action = if was_tls_looking {
        route.action
    } else {
        match route.action {
            Action::TlsAlert(_) => Action::Hangup,
            other => other,
        }
    };

    match action {
        Action::Proxy {
            dest_hostname,
            dest_port,
        } => {
            connect_and_splice(
                client,
                &dest_hostname,
                dest_port,
                prefix,
                record_version,
                snapshot,
                listener,
                resolver,
            )
            .await;
        }
        other => {
            let mut client = client;
            emit(&mut client, &other, record_version).await;
        }
    }
}

/// Resolves and connects to a `Proxy` destination, then either splices or
/// falls through to `proxy_connect_failure_route`.
#[allow(clippy::too_many_arguments)]
async fn connect_and_splice(
    mut client: TcpStream,
    dest_hostname: &str,
    dest_port: u16,
    prefix: Vec<u8>,
    record_version: (u8, u8),
    snapshot: &ConfigSnapshot,
    listener: &ListenerConfig,
    resolver: Arc<dyn Resolver>,
) {
    let connect_timeout = Duration::from_secs(listener.connect_timeout_secs);

    let addrs = match resolver.resolve(dest_hostname).await {
        Ok(addrs) => addrs,
        Err(err) => {
            warn!("failed to resolve proxy destination {dest_hostname}: {err}");
            return fail_proxy_connect(&mut client, record_version, snapshot, listener).await;
        }
    };

    let mut upstream = None;
    for addr in addrs {
        let target = SocketAddr::new(addr, dest_port);
        match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                upstream = Some(stream);
                break;
            }
            Ok(Err(err)) => debug!("connect to {target} failed: {err}"),
            Err(_) => debug!("connect to {target} timed out"),
        }
    }

    let Some(mut upstream) = upstream else {
        return fail_proxy_connect(&mut client, record_version, snapshot, listener).await;
    };

    if let Err(err) = upstream.write_all(&prefix).await {
        debug!("failed to replay ClientHello prefix to upstream: {err}");
        return;
    }

    let idle_timeout = Duration::from_secs(listener.idle_timeout_secs);
    let result = splice::splice(client, upstream, idle_timeout).await;
    info!(
        "proxy splice to {dest_hostname}:{dest_port} ended: {} bytes up, {} bytes down, idle_timeout={}",
        result.client_to_upstream_bytes, result.upstream_to_client_bytes, result.idle_timed_out
    );
}

/// All-addresses-failed or resolver error path: dispatch
/// `proxy_connect_failure_route` as a non-Proxy action; a `Proxy` route
/// configured there is itself an error, degrading to `Hangup`.
async fn fail_proxy_connect(
    client: &mut TcpStream,
    record_version: (u8, u8),
    snapshot: &ConfigSnapshot,
    listener: &ListenerConfig,
) {
    let route = snapshot.resolve_slot(listener, |s| &s.proxy_connect_failure_route);
    let action = match route.action {
        Action::Proxy { .. } => Action::Hangup,
        other => other,
    };
    emit(client, &action, record_version).await;
}

/// Emits one non-Proxy action to the client, then shuts it down. Covers
/// `Hangup`, `SendText`, `SendFile`, and `TlsAlert`.
async fn emit(client: &mut TcpStream, action: &Action, record_version: (u8, u8)) {
    match action {
        Action::Hangup => {}
        Action::SendText(text) => {
            let _ = client.write_all(text.as_bytes()).await;
        }
        Action::SendFile(path) => match tokio::fs::read(path).await {
            Ok(contents) => {
                let _ = client.write_all(&contents).await;
            }
            Err(err) => {
                warn!("send_file {path:?} failed, falling back to hangup: {err}");
            }
        },
        Action::TlsAlert(subtype) => {
            let record = render_alert(record_version, *subtype);
            let _ = client.write_all(&record).await;
        }
        Action::Proxy { .. } => {
            unreachable!("Proxy actions are handled by connect_and_splice, not emit")
        }
    }
    let _ = client.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{ConfigData, SniPattern};
    use crate::resolver::MockResolver;
    use tokio::net::TcpListener;

    fn listener_config(slots: SlotRoutes, routes: Vec<Route>) -> ListenerConfig {
        ListenerConfig {
            bind_v4: None,
            bind_v6: None,
            bind_port: 443,
            routes,
            slots,
            hello_timeout_secs: 2,
            connect_timeout_secs: 2,
            idle_timeout_secs: 2,
        }
    }

    fn snapshot_with(listener: ListenerConfig) -> (ConfigSnapshot, Arc<ListenerConfig>) {
        let data = ConfigData {
            listeners: vec![listener.clone()],
            global_slots: SlotRoutes::default(),
            user: None,
            group: None,
            disable_ipv4: false,
            disable_ipv6: false,
        };
        (ConfigSnapshot::new(data), Arc::new(listener))
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (connect, accept) = tokio::join!(connect, accept);
        (connect.unwrap(), accept.unwrap().0)
    }

    fn build_minimal_client_hello(sni: &str) -> Vec<u8> {
        let mut sni_ext = Vec::new();
        sni_ext.push(0x00);
        sni_ext.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(sni.as_bytes());
        let mut server_name_list = Vec::new();
        server_name_list.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        server_name_list.extend_from_slice(&sni_ext);
        let mut extensions = Vec::new();
        extensions.extend_from_slice(&0x0000u16.to_be_bytes());
        extensions.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&server_name_list);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1);
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(0x01);
        let len = body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(0x16);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[tokio::test]
    async fn hangup_route_closes_without_writing() {
        let mut slots = SlotRoutes::default();
        slots.default_route = Some(Route::hangup());
        let (snapshot, listener) = snapshot_with(listener_config(slots, vec![]));
        let resolver: Arc<dyn Resolver> = Arc::new(MockResolver::new());

        let (client_side, test_peer) = connected_pair().await;
        let peer_addr = client_side.peer_addr().unwrap();

        let handle = tokio::spawn(run(client_side, peer_addr, snapshot, listener, resolver));
        drop(test_peer);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn send_text_fallback_writes_payload() {
        let mut slots = SlotRoutes::default();
        slots.tls_error_route = Some(Route {
            action: Action::SendText("not tls here".into()),
            sni_pattern: None,
        });
        let (snapshot, listener) = snapshot_with(listener_config(slots, vec![]));
        let resolver: Arc<dyn Resolver> = Arc::new(MockResolver::new());

        let (client_side, mut test_peer) = connected_pair().await;
        let peer_addr = client_side.peer_addr().unwrap();

        let handle = tokio::spawn(run(client_side, peer_addr, snapshot, listener, resolver));
        test_peer.write_all(&[0x00, 0x01, 0x02]).await.unwrap();
        test_peer.shutdown().await.unwrap();

        handle.await.unwrap();

        let mut received = Vec::new();
        test_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"not tls here");
    }

    #[tokio::test]
    async fn no_sni_gets_unrecognized_name_alert() {
        let mut slots = SlotRoutes::default();
        slots.no_sni_route = Some(Route {
            action: Action::TlsAlert(AlertSubtype::UnrecognizedName),
            sni_pattern: None,
        });
        let (snapshot, listener) = snapshot_with(listener_config(slots, vec![]));
        let resolver: Arc<dyn Resolver> = Arc::new(MockResolver::new());

        let (client_side, mut test_peer) = connected_pair().await;
        let peer_addr = client_side.peer_addr().unwrap();

        let handle = tokio::spawn(run(client_side, peer_addr, snapshot, listener, resolver));
        let hello = build_minimal_client_hello_without_sni();
        test_peer.write_all(&hello).await.unwrap();

        handle.await.unwrap();

        let mut received = Vec::new();
        test_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, [0x15, 0x03, 0x01, 0x00, 0x02, 0x02, 0x70]);
    }

    fn build_minimal_client_hello_without_sni() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1);
        body.push(0);

        let mut handshake = Vec::new();
        handshake.push(0x01);
        let len = body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(0x16);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[tokio::test]
    async fn proxy_route_replays_prefix_and_splices() {
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream_listener.local_addr().unwrap().port();

        let resolver = MockResolver::new();
        resolver.insert("backend.test", vec!["127.0.0.1".parse().unwrap()]);
        let resolver: Arc<dyn Resolver> = Arc::new(resolver);

        let (snapshot, listener) = snapshot_with(listener_config(
            SlotRoutes::default(),
            vec![Route {
                action: Action::Proxy {
                    dest_hostname: "backend.test".into(),
                    dest_port: upstream_port,
                },
                sni_pattern: SniPattern::parse("example.com"),
            }],
        ));

        let (client_side, mut test_client) = connected_pair().await;
        let peer_addr = client_side.peer_addr().unwrap();

        let handle = tokio::spawn(run(client_side, peer_addr, snapshot, listener, resolver));

        let hello = build_minimal_client_hello("example.com");
        test_client.write_all(&hello).await.unwrap();

        let (mut upstream_side, _) = upstream_listener.accept().await.unwrap();
        let mut replayed = vec![0u8; hello.len()];
        upstream_side.read_exact(&mut replayed).await.unwrap();
        assert_eq!(replayed, hello);

        drop(test_client);
        drop(upstream_side);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn failed_proxy_connect_falls_through_to_failure_route() {
        let mut slots = SlotRoutes::default();
        slots.proxy_connect_failure_route = Some(Route {
            action: Action::SendText("backend unreachable".into()),
            sni_pattern: None,
        });
        let resolver: Arc<dyn Resolver> = Arc::new(MockResolver::new()); // resolves nothing

        let (snapshot, listener) = snapshot_with(listener_config(
            slots,
            vec![Route {
                action: Action::Proxy {
                    dest_hostname: "nowhere.invalid".into(),
                    dest_port: 443,
                },
                sni_pattern: SniPattern::parse("example.com"),
            }],
        ));

        let (client_side, mut test_client) = connected_pair().await;
        let peer_addr = client_side.peer_addr().unwrap();

        let handle = tokio::spawn(run(client_side, peer_addr, snapshot, listener, resolver));

        let hello = build_minimal_client_hello("example.com");
        test_client.write_all(&hello).await.unwrap();
        handle.await.unwrap();

        let mut received = Vec::new();
        test_client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"backend unreachable");
    }
}
