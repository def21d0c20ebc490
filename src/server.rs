//! HTTP server lifecycle.
//!
//! ```text
//! Created ──start──▶ Listening ──stop──▶ ShuttingDown ──drained / deadline──▶ Stopped
//! ```
//!
//! `start` compiles the configuration, binds the listener and serves until
//! `stop` is called. A configuration or bind failure returns from `start`
//! without ever reaching `Listening`.
//!
//! On `stop` the server:
//! 1. Immediately stops `listener.accept()`, so no new connections are made.
//! 2. Asks every open connection to finish its current request and close.
//! 3. Waits for the connections up to the drain deadline, then aborts the
//!    rest. Aborting a connection drops its in-flight upstream request.
//!
//! Each connection enforces the four [`ServerOptions`] timeouts: headers
//! must arrive within the read-header timeout, the body within the read
//! timeout, the whole response, body included, within the write timeout, and a
//! keep-alive connection with no request in flight is closed after the idle
//! timeout.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use hyper::body::{Body as HttpBody, Frame, Incoming, SizeHint};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use thiserror::Error as ThisError;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};

use crate::body::BoxError;
use crate::compile::compile;
use crate::context::KeyValue;
use crate::error::Error;
use crate::forward::Forwarder;
use crate::options::ServerOptions;
use crate::pool::{BufferPool, BytePool};
use crate::request::Request;
use crate::router::Router;

/// Text buffers: 1000 idle buffers of 128 bytes.
const TEXT_POOL: (usize, usize) = (1000, 128);
/// Proxy copy buffers: 1000 idle buffers of 4 KiB.
const BYTE_POOL: (usize, usize) = (1000, 4 * 1024);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Created,
    Listening,
    ShuttingDown,
    Stopped,
}

/// The reverse-proxy server.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use revproxy::{DEFAULT_CONFIG_TEMPLATE, KeyValue, Server, ServerOptions};
///
/// # async fn run() -> Result<(), revproxy::Error> {
/// let server = std::sync::Arc::new(Server::new(ServerOptions::new().listen_addr("127.0.0.1:8080")));
///
/// let stopper = server.clone();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     stopper.stop(Duration::from_secs(10)).await;
/// });
///
/// server.start(DEFAULT_CONFIG_TEMPLATE, KeyValue::new()).await
/// # }
/// ```
pub struct Server {
    opts: ServerOptions,
    started: AtomicBool,
    state: watch::Sender<State>,
    /// Set once by `stop`, carrying the drain deadline.
    shutdown: watch::Sender<Option<Duration>>,
    local_addr: OnceLock<SocketAddr>,
    buffers: BufferPool,
    bytes: BytePool,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        Self {
            opts: opts.normalized(),
            started: AtomicBool::new(false),
            state: watch::Sender::new(State::Created),
            shutdown: watch::Sender::new(None),
            local_addr: OnceLock::new(),
            buffers: BufferPool::new(TEXT_POOL.0, TEXT_POOL.1),
            bytes: BytePool::new(BYTE_POOL.0, BYTE_POOL.1),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.opts
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// The bound address, once the listener exists.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Waits until startup either succeeded or failed. Returns the bound
    /// address on success.
    pub async fn ready(&self) -> Option<SocketAddr> {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s != State::Created).await;
        match *rx.borrow() {
            State::Listening | State::ShuttingDown => self.local_addr(),
            _ => None,
        }
    }

    /// Compiles `template`, binds the listener and serves until [`stop`](Server::stop).
    ///
    /// Returns once the server reaches `Stopped`.
    pub async fn start(&self, template: &str, kv: KeyValue) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        let result = self.run(template, kv).await;
        if let Err(e) = &result {
            error!("server failed to start: {e}");
        }
        self.state.send_replace(State::Stopped);
        result
    }

    /// Stops accepting, drains open connections for at most `deadline`, then
    /// waits for `Stopped`.
    pub async fn stop(&self, deadline: Duration) {
        if !self.started.load(Ordering::SeqCst) {
            self.state.send_if_modified(|s| {
                let idle = *s == State::Created;
                if idle {
                    *s = State::Stopped;
                }
                idle
            });
        }
        self.shutdown.send_if_modified(|d| {
            let first = d.is_none();
            if first {
                *d = Some(deadline);
            }
            first
        });

        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == State::Stopped).await;
    }

    async fn run(&self, template: &str, kv: KeyValue) -> Result<(), Error> {
        let forwarder = Arc::new(Forwarder::new(&self.opts.allow_headers, self.bytes.clone()));
        let compiled = compile(template, kv, forwarder, self.buffers.clone())?;
        let router = Arc::new(compiled.router);

        let listener = TcpListener::bind(self.opts.listen_addr.as_str()).await?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);

        let listening = self.state.send_if_modified(|s| {
            let fresh = *s == State::Created;
            if fresh {
                *s = State::Listening;
            }
            fresh
        });
        if !listening {
            info!("stopped before listening");
            return Ok(());
        }
        info!(addr = %addr, routes = router.len(), "revproxy listening");

        let mut builder = ConnBuilder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.opts.read_header_timeout);
        let limits = Limits {
            read: self.opts.read_timeout,
            write: self.opts.write_timeout,
            idle: self.opts.idle_timeout,
        };

        let mut tasks = JoinSet::new();
        let mut shutdown = self.shutdown.subscribe();

        let deadline = loop {
            tokio::select! {
                biased;

                deadline = stop_requested(&mut shutdown) => break deadline,

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    tasks.spawn(serve_connection(
                        builder.clone(),
                        TokioIo::new(stream),
                        peer,
                        Arc::clone(&router),
                        limits,
                        self.shutdown.subscribe(),
                    ));
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        };

        self.state.send_replace(State::ShuttingDown);
        drop(listener);
        info!(in_flight = tasks.len(), ?deadline, "shutting down, draining connections");

        let drained = tokio::time::timeout(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "drain deadline exceeded, aborting connections");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        info!("revproxy stopped");
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct Limits {
    read: Duration,
    write: Duration,
    idle: Duration,
}

async fn serve_connection(
    builder: ConnBuilder<TokioExecutor>,
    io: TokioIo<tokio::net::TcpStream>,
    peer: SocketAddr,
    router: Arc<Router>,
    limits: Limits,
    mut shutdown: watch::Receiver<Option<Duration>>,
) {
    let activity = Arc::new(Activity::default());

    let svc = {
        let activity = Arc::clone(&activity);
        service_fn(move |req: http::Request<Incoming>| {
            let router = Arc::clone(&router);
            let in_flight = activity.enter();
            async move {
                let _in_flight = in_flight;
                let now = Instant::now();
                let write_by = now + limits.write;
                let req = req.map(|body| Deadline::new(body, now + limits.read, Timeout::Read(limits.read)));
                match tokio::time::timeout_at(write_by, router.dispatch(Request::from_http(req))).await {
                    Ok(res) => Ok(res
                        .into_inner()
                        .map(|body| Deadline::new(body, write_by, Timeout::Write(limits.write)))),
                    Err(_) => {
                        warn!(peer = %peer, "response not produced within write timeout, closing connection");
                        Err(Timeout::Write(limits.write))
                    }
                }
            }
        })
    };

    // Boxed as a trait object so the spawned future's `Send` proof happens
    // here, where the body's error lifetime is concrete.
    let mut conn: Pin<Box<dyn GracefulConnection + Send + '_>> = Box::pin(builder.serve_connection(io, svc));

    let mut closing = false;
    loop {
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!(peer = %peer, "connection error: {e}");
                }
                break;
            }
            _ = stop_requested(&mut shutdown), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
            () = activity.idle_for(limits.idle), if !closing => {
                debug!(peer = %peer, "idle timeout, closing connection");
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// A connection future that can be asked to shut down gracefully.
trait GracefulConnection: Future<Output = Result<(), BoxError>> {
    fn graceful_shutdown(self: Pin<&mut Self>);
}

impl<I, S, E, B> GracefulConnection for hyper_util::server::conn::auto::Connection<'_, I, S, E>
where
    Self: Future<Output = Result<(), BoxError>>,
    S: hyper::service::HttpService<Incoming, ResBody = B>,
    S::Error: Into<BoxError>,
    I: hyper::rt::Read + hyper::rt::Write + Unpin,
    B: HttpBody + 'static,
    B::Error: Into<BoxError>,
    E: hyper_util::server::conn::auto::HttpServerConnExec<S::Future, B>,
{
    fn graceful_shutdown(self: Pin<&mut Self>) {
        hyper_util::server::conn::auto::Connection::graceful_shutdown(self)
    }
}

/// Resolves with the drain deadline once `stop` has been called.
async fn stop_requested(rx: &mut watch::Receiver<Option<Duration>>) -> Duration {
    match rx.wait_for(Option::is_some).await {
        Ok(deadline) => (*deadline).unwrap_or_default(),
        Err(_) => Duration::ZERO,
    }
}

#[derive(Clone, Copy, Debug, ThisError)]
enum Timeout {
    #[error("response not written within {0:?}")]
    Write(Duration),
    #[error("request body not received within {0:?}")]
    Read(Duration),
}

// ── Idle tracking ─────────────────────────────────────────────────────────────

/// Requests in flight on one connection.
#[derive(Default)]
struct Activity {
    in_flight: AtomicUsize,
    changed: Notify,
}

struct InFlight(Arc<Activity>);

impl Activity {
    fn enter(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
        InFlight(Arc::clone(self))
    }

    /// Resolves once no request has been in flight for `window`.
    async fn idle_for(&self, window: Duration) {
        loop {
            let changed = self.changed.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                if tokio::time::timeout(window, changed).await.is_err() {
                    return;
                }
            } else {
                changed.await;
            }
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.changed.notify_waiters();
    }
}

// ── Deadlines ───────────────────────────────────────────────────────────────

/// Fails a body once its deadline has passed.
///
/// Wraps the inbound body with the read deadline and the relayed response
/// body with whatever is left of the write deadline.
struct Deadline<B> {
    inner: B,
    sleep: Pin<Box<Sleep>>,
    expired: Timeout,
}

impl<B> Deadline<B> {
    fn new(inner: B, at: Instant, expired: Timeout) -> Self {
        Self { inner, sleep: Box::pin(tokio::time::sleep_until(at)), expired }
    }
}

impl<B> HttpBody for Deadline<B>
where
    B: HttpBody<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        if this.sleep.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(this.expired.into())));
        }
        Pin::new(&mut this.inner)
            .poll_frame(cx)
            .map(|frame| frame.map(|f| f.map_err(Into::into)))
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_before_start_settles_immediately() {
        let server = Server::new(ServerOptions::new());
        assert_eq!(server.state(), State::Created);
        server.stop(Duration::from_millis(10)).await;
        assert_eq!(server.state(), State::Stopped);
        assert_eq!(server.ready().await, None);
    }

    #[tokio::test]
    async fn broken_config_never_listens() {
        let server = Server::new(ServerOptions::new().listen_addr("127.0.0.1:0"));
        let err = server.start("{{ Missing }}", KeyValue::new()).await.unwrap_err();
        assert!(matches!(err, Error::Template(_)));
        assert_eq!(server.state(), State::Stopped);
        assert_eq!(server.local_addr(), None);
        assert!(matches!(server.start("", KeyValue::new()).await, Err(Error::AlreadyStarted)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_for_waits_out_the_window_with_nothing_in_flight() {
        let activity = Arc::new(Activity::default());
        let guard = activity.enter();

        let idle = activity.idle_for(Duration::from_secs(5));
        tokio::pin!(idle);
        assert!(tokio::time::timeout(Duration::from_secs(30), idle.as_mut()).await.is_err());

        drop(guard);
        let start = tokio::time::Instant::now();
        idle.await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
