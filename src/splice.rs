//! Bidirectional byte splicing between the client and the chosen upstream.
//!
//! Each direction is a simple read-then-write loop that calls `shutdown()`
//! on the write half once the read side reaches EOF, so the peer sees a
//! clean half-close rather than a hung connection. Both directions run
//! concurrently via `tokio::select!` rather than `tokio::join!`, since we
//! additionally need to detect idle timeout and stop both directions the
//! instant it fires instead of waiting for both copies to finish on their
//! own.
//!
//! The two directions are independent: either one may finish (client FIN,
//! or upstream FIN) while the other keeps carrying bytes, and each reports
//! its own half-close. Only the fully-shared idle timer ties them
//! together.

use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Instant;

const BUFFER_SIZE: usize = 16 * 1024;

/// Outcome of a finished splice. `idle_timed_out` is set if the connection
/// was torn down by the idle timer rather than by either side closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceResult {
    pub client_to_upstream_bytes: u64,
    pub upstream_to_client_bytes: u64,
    pub idle_timed_out: bool,
}

struct Activity {
    last: Mutex<Instant>,
    idle: Notify,
}

impl Activity {
    fn new() -> Self {
        Activity {
            last: Mutex::new(Instant::now()),
            idle: Notify::new(),
        }
    }

    fn touch(&self) {
        *self.last.lock().unwrap() = Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.last.lock().unwrap().elapsed()
    }
}

/// Splices `client` and `upstream` until both directions have closed or the
/// connection has been idle (no bytes in either direction) for
/// `idle_timeout`.
pub async fn splice(client: TcpStream, upstream: TcpStream, idle_timeout: Duration) -> SpliceResult {
    let (mut client_r, mut client_w) = client.into_split();
    let (mut upstream_r, mut upstream_w) = upstream.into_split();

    let activity = Activity::new();

    let c2u = pump(&mut client_r, &mut upstream_w, &activity);
    let u2c = pump(&mut upstream_r, &mut client_w, &activity);
    let watchdog = watch_idle(&activity, idle_timeout);

    tokio::pin!(c2u);
    tokio::pin!(u2c);
    tokio::pin!(watchdog);

    let mut c2u_bytes: Option<u64> = None;
    let mut u2c_bytes: Option<u64> = None;
    let mut idle_timed_out = false;

    loop {
        tokio::select! {
            n = &mut c2u, if c2u_bytes.is_none() => c2u_bytes = Some(n),
            n = &mut u2c, if u2c_bytes.is_none() => u2c_bytes = Some(n),
            _ = &mut watchdog, if !idle_timed_out => idle_timed_out = true,
        }
        if c2u_bytes.is_some() && u2c_bytes.is_some() {
            break;
        }
    }

    SpliceResult {
        client_to_upstream_bytes: c2u_bytes.unwrap(),
        upstream_to_client_bytes: u2c_bytes.unwrap(),
        idle_timed_out,
    }
}

/// Sleeps until `activity` has seen no progress for `idle_timeout`, then
/// notifies whoever is waiting (the two `pump` loops, each blocked on a
/// read) so they unwind instead of waiting on I/O that may never arrive.
async fn watch_idle(activity: &Activity, idle_timeout: Duration) {
    loop {
        let elapsed = activity.elapsed();
        if elapsed >= idle_timeout {
            activity.idle.notify_waiters();
            return;
        }
        tokio::time::sleep(idle_timeout - elapsed).await;
    }
}

/// Copies from `reader` to `writer` until EOF, an error, or `activity`
/// reports an idle timeout or a peer-side error. `touch`es `activity` on
/// every successful read so the watchdog's clock resets with real traffic.
/// A read or write error here notifies `activity.idle` the same way the
/// watchdog does, so the peer pump (blocked on its own read or on that
/// same notification) unwinds too instead of continuing to run a half of
/// the connection whose other half just died.
async fn pump<R, W>(reader: &mut R, writer: &mut W, activity: &Activity) -> u64
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut buf = [0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Err(_) => {
                        activity.idle.notify_waiters();
                        break;
                    }
                    Ok(n) => {
                        activity.touch();
                        if writer.write_all(&buf[..n]).await.is_err() {
                            activity.idle.notify_waiters();
                            break;
                        }
                        total += n as u64;
                    }
                }
            }
            _ = activity.idle.notified() => break,
        }
    }
    let _ = writer.shutdown().await;
    total
}
