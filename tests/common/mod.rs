//! Loopback backends, a gateway launcher and a small client.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use revproxy::{Server, ServerOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Starts a backend that answers every request with
/// `<name> <uri> allowed=<x-allowed> secret=<x-secret>` after `delay`.
pub async fn backend(name: &'static str, delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let svc = service_fn(move |req: http::Request<Incoming>| async move {
                    tokio::time::sleep(delay).await;
                    let header = |n: &str| {
                        req.headers()
                            .get(n)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-")
                            .to_owned()
                    };
                    let body = format!(
                        "{name} {} allowed={} secret={}",
                        req.uri(),
                        header("x-allowed"),
                        header("x-secret"),
                    );
                    Ok::<_, Infallible>(http::Response::new(Full::new(Bytes::from(body))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });
    addr
}

/// Starts a backend that reads the whole request body and answers
/// `got <n> bytes`.
pub async fn body_backend() -> SocketAddr {
    serve(|req: http::Request<Incoming>| async move {
        let body = req.into_body().collect().await?.to_bytes();
        Ok::<_, hyper::Error>(http::Response::new(Full::new(Bytes::from(format!("got {} bytes", body.len())))))
    })
    .await
}

/// Starts a backend that sends its headers at once and then `frames` body
/// chunks of `hello`, one every `gap`.
pub async fn trickle_backend(frames: usize, gap: Duration) -> SocketAddr {
    serve(move |_req: http::Request<Incoming>| async move {
        Ok::<_, Infallible>(http::Response::new(Trickle::new(frames, gap)))
    })
    .await
}

async fn serve<F, Fut, B, E>(handle: F) -> SocketAddr
where
    F: Fn(http::Request<Incoming>) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = Result<http::Response<B>, E>> + Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
    E: Into<BoxError>,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handle = handle.clone();
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(handle))
                    .await;
            });
        }
    });
    addr
}

struct Trickle {
    left: usize,
    gap: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl Trickle {
    fn new(frames: usize, gap: Duration) -> Self {
        Self { left: frames, gap, sleep: Box::pin(tokio::time::sleep(gap)) }
    }
}

impl Body for Trickle {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        if self.left == 0 {
            return Poll::Ready(None);
        }
        if self.sleep.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }
        self.left -= 1;
        let next = Instant::now() + self.gap;
        self.sleep.as_mut().reset(next);
        Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(b"hello")))))
    }
}

/// A listener that counts accepted connections and closes each one at once.
pub async fn counting_listener() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });
    (addr, accepted)
}

/// Writes `bytes` on a fresh connection and reads until the server closes
/// it, giving up after `limit`. Returns what was read and how long it took.
pub async fn raw_exchange(addr: SocketAddr, bytes: &[u8], limit: Duration) -> Option<(String, Duration)> {
    let started = Instant::now();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(bytes).await.unwrap();

    let mut read = Vec::new();
    match tokio::time::timeout(limit, stream.read_to_end(&mut read)).await {
        Ok(_) => Some((String::from_utf8_lossy(&read).into_owned(), started.elapsed())),
        Err(_) => None,
    }
}

/// An address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub struct Gateway {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    pub task: JoinHandle<Result<(), revproxy::Error>>,
}

impl Gateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

/// Starts a gateway on an ephemeral loopback port and waits until it listens.
pub async fn gateway(template: &str, kv: &[(&str, &str)], opts: ServerOptions) -> Gateway {
    let server = Arc::new(Server::new(opts.listen_addr("127.0.0.1:0")));
    let kv: HashMap<String, String> = kv.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();

    let task = tokio::spawn({
        let server = Arc::clone(&server);
        let template = template.to_owned();
        async move { server.start(&template, kv).await }
    });
    let addr = server.ready().await.expect("gateway failed to start");
    Gateway { server, addr, task }
}

/// Fails when the request fails or the body is cut off.
pub type Reply = Result<(StatusCode, String), BoxError>;

pub async fn get(url: &str, headers: &[(&str, &str)]) -> Reply {
    let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
    let mut req = http::Request::get(url);
    for (name, value) in headers {
        req = req.header(*name, *value);
    }
    let res = client.request(req.body(Full::new(Bytes::new())).unwrap()).await?;
    let status = res.status();
    let body = res.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8(body.to_vec())?))
}
