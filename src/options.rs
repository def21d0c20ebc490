//! Server options.
//!
//! ```rust
//! use std::time::Duration;
//! use revproxy::ServerOptions;
//!
//! let opts = ServerOptions::new()
//!     .listen_addr("127.0.0.1:9000")
//!     .allow_headers(["x-request-id", "authorization"])
//!     .write_timeout(Duration::from_secs(5));
//! assert_eq!(opts.read_header_timeout, Duration::from_secs(10));
//! ```

use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener address, forwarded headers and connection timeouts.
///
/// A zero timeout means "use the default" for that timeout alone.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub listen_addr: String,
    /// Inbound headers copied onto proxied requests.
    pub allow_headers: Vec<String>,
    /// Deadline for receiving a request body.
    pub read_timeout: Duration,
    /// Deadline for producing a response.
    pub write_timeout: Duration,
    /// How long a keep-alive connection may sit without a request.
    pub idle_timeout: Duration,
    /// Deadline for receiving request headers.
    pub read_header_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_owned(),
            allow_headers: Vec::new(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            read_header_timeout: DEFAULT_READ_HEADER_TIMEOUT,
        }
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn allow_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    pub fn read_timeout(mut self, d: Duration) -> Self {
        self.read_timeout = or_default(d, DEFAULT_READ_TIMEOUT);
        self
    }

    pub fn write_timeout(mut self, d: Duration) -> Self {
        self.write_timeout = or_default(d, DEFAULT_WRITE_TIMEOUT);
        self
    }

    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = or_default(d, DEFAULT_IDLE_TIMEOUT);
        self
    }

    pub fn read_header_timeout(mut self, d: Duration) -> Self {
        self.read_header_timeout = or_default(d, DEFAULT_READ_HEADER_TIMEOUT);
        self
    }

    /// Replaces zero durations and an empty address with their defaults.
    /// Applied by the server, so options built by struct literal behave the
    /// same as ones built with the setters.
    pub(crate) fn normalized(mut self) -> Self {
        if self.listen_addr.trim().is_empty() {
            self.listen_addr = DEFAULT_LISTEN_ADDR.to_owned();
        }
        self.read_timeout = or_default(self.read_timeout, DEFAULT_READ_TIMEOUT);
        self.write_timeout = or_default(self.write_timeout, DEFAULT_WRITE_TIMEOUT);
        self.idle_timeout = or_default(self.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        self.read_header_timeout = or_default(self.read_header_timeout, DEFAULT_READ_HEADER_TIMEOUT);
        self
    }
}

fn or_default(d: Duration, default: Duration) -> Duration {
    if d.is_zero() { default } else { d }
}
