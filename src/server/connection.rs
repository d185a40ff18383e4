use crate::{
    errors::ErrorKind,
    http::{
        body::{Body, CallbackResult},
        request::{Parser, Request},
        response::Response,
        types::Version,
    },
    limits::{AuthLimits, ConnLimits, Http09Limits, PostLimits, ReqLimits, RespLimits, ServerLimits},
    server::server_impl::{AllLimits, Handler},
    Handled,
};
use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    net::TcpStream,
    sync::Notify,
    time::sleep,
};

pub(crate) struct HttpConnection<H: Handler<S>, S: ConnectionData> {
    handler: Arc<H>,
    connection_data: S,

    connection: Connection,
    pub(crate) parser: Parser,
    pub(crate) request: Request,
    pub(crate) response: Response,

    pub(crate) server_limits: ServerLimits,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) http_09_limits: Option<Http09Limits>,
    pub(crate) req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
    pub(crate) post_limits: PostLimits,
    pub(crate) auth_limits: AuthLimits,
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) fn new(handler: Arc<H>, limits: AllLimits) -> Self {
        Self {
            handler,
            connection_data: S::new(),

            connection: Connection::new(),
            parser: Parser::new(&limits.3),
            request: Request::new(&limits.3),
            response: Response::new(&limits.4),

            server_limits: limits.0,
            conn_limits: limits.1,
            http_09_limits: limits.2,
            req_limits: limits.3,
            resp_limits: limits.4,
            post_limits: limits.5,
            auth_limits: limits.6,
        }
    }

    #[inline]
    fn reset_request_response(&mut self) {
        self.parser.reset();
        self.request.reset();
        self.response.reset(&self.resp_limits);
    }
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) async fn run(
        &mut self,
        stream: &mut TcpStream,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
    ) -> Result<(), io::Error> {
        use tracing::Instrument;

        let span = tracing::debug_span!("connection", peer = %client_addr);
        self.request.set_addrs(client_addr, server_addr);

        async {
            match self.impl_run(stream).await {
                Ok(()) => Ok(()),
                Err(ErrorKind::Io(e)) => {
                    tracing::debug!(error = %e.0, "connection closed with I/O error");
                    Err(e.0)
                }
                Err(error) => {
                    tracing::warn!(?error, "rejecting request");
                    self.conn_limits
                        .send_error(
                            stream,
                            error,
                            self.request.version(),
                            self.server_limits.json_errors,
                        )
                        .await
                }
            }
        }
        .instrument(span)
        .await
    }

    #[inline]
    pub(crate) async fn impl_run(&mut self, stream: &mut TcpStream) -> Result<(), ErrorKind> {
        self.connection.reset();
        self.connection_data.reset();
        self.request.set_suspend_handle(self.connection.suspend.clone());

        while !self.is_expired()? {
            self.reset_request_response();

            if self
                .parser
                .fill_buffer(stream, self.conn_limits.socket_read_timeout)
                .await?
                == 0
            {
                break;
            }
            self.response.version = self.parse()?;

            if let Some(body) = self.request.body() {
                let mut offset = 0;
                while offset < body.len() {
                    let consumed = self
                        .handler
                        .upload(&mut self.connection_data, &self.request, &body[offset..])
                        .await
                        .clamp(1, body.len() - offset);
                    offset += consumed;
                }
            }

            self.handler
                .handle(&mut self.connection_data, &self.request, &mut self.response)
                .await;

            if self.connection.suspend.is_suspended() {
                tracing::debug!("connection suspended, awaiting resume");
                let remaining = self
                    .conn_limits
                    .connection_lifetime
                    .saturating_sub(self.connection.created.elapsed());
                self.connection.suspend.wait(remaining).await?;
            }

            self.conn_limits
                .write_bytes(stream, self.response.buffer())
                .await?;

            if let Some((body, chunked)) = self.response.take_pending_body() {
                self.conn_limits.write_body(stream, body, chunked).await?;
            }

            if !self.response.keep_alive {
                break;
            }

            self.connection.request_count += 1;
        }

        Ok(())
    }
}

impl ConnLimits {
    #[inline]
    pub(crate) async fn send_error(
        &self,
        stream: &mut TcpStream,
        error: ErrorKind,
        version: Version,
        json_errors: bool,
    ) -> Result<(), io::Error> {
        self.write_bytes(stream, error.as_http(version, json_errors))
            .await
    }

    #[inline]
    pub(crate) async fn write_bytes(
        &self,
        stream: &mut TcpStream,
        response: &[u8],
    ) -> Result<(), io::Error> {
        tokio::select! {
            biased;

            result = stream.write_all(response) => result,
            _ = sleep(self.socket_write_timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))
            },
        }
    }

    /// Streams a deferred response body straight to the socket, bypassing
    /// the response buffer entirely.
    ///
    /// `chunked` must match what [`crate::Response::body_deferred`] decided
    /// when it wrote the headers: when set, each `Body::Callback` invocation
    /// is written as one RFC 7230 §4.1 chunk, terminated by the final
    /// zero-size chunk once the producer reports [`CallbackResult::Done`].
    pub(crate) async fn write_body(
        &self,
        stream: &mut TcpStream,
        body: Body,
        chunked: bool,
    ) -> Result<(), io::Error> {
        match body {
            Body::Fd {
                mut file,
                offset,
                length,
            } => {
                file.seek(io::SeekFrom::Start(offset)).await?;

                let mut remaining = length;
                let mut chunk = vec![0u8; 64 * 1024];
                while remaining > 0 {
                    let want = chunk.len().min(remaining as usize);
                    let n = file.read(&mut chunk[..want]).await?;
                    if n == 0 {
                        break;
                    }
                    self.write_bytes(stream, &chunk[..n]).await?;
                    remaining -= n as u64;
                }
                Ok(())
            }
            Body::Callback {
                mut producer,
                block_size,
                ..
            } => loop {
                let mut chunk = Vec::with_capacity(block_size);
                match producer(&mut chunk) {
                    CallbackResult::More => {
                        if chunked {
                            self.write_chunk(stream, &chunk).await?;
                        } else {
                            self.write_bytes(stream, &chunk).await?;
                        }
                    }
                    CallbackResult::Done => {
                        if chunked {
                            self.write_chunk(stream, &chunk).await?;
                            self.write_bytes(stream, b"0\r\n\r\n").await?;
                        } else if !chunk.is_empty() {
                            self.write_bytes(stream, &chunk).await?;
                        }
                        return Ok(());
                    }
                    CallbackResult::Err(err) => return Err(err),
                }
            },
        }
    }

    /// Writes one RFC 7230 §4.1 chunk (size line, payload, trailing CRLF).
    /// A zero-length chunk is a no-op: an empty chunk on the wire would be
    /// the stream terminator, not "no data this round".
    async fn write_chunk(&self, stream: &mut TcpStream, payload: &[u8]) -> Result<(), io::Error> {
        if payload.is_empty() {
            return Ok(());
        }
        let header = format!("{:x}\r\n", payload.len());
        self.write_bytes(stream, header.as_bytes()).await?;
        self.write_bytes(stream, payload).await?;
        self.write_bytes(stream, b"\r\n").await
    }
}

macro_rules! is_expired {
    ($self:expr, $limits:expr) => {
        Ok(!$self.response.keep_alive
            || $self.connection.request_count >= $limits.max_requests_per_connection
            || $self.connection.created.elapsed() > $limits.connection_lifetime)
    };
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    fn is_expired(&self) -> Result<bool, ErrorKind> {
        match (self.response.version, &self.http_09_limits) {
            (Version::Http09, Some(limits)) => is_expired!(self, limits),
            (Version::Http09, None) => Err(ErrorKind::UnsupportedVersion),
            _ => is_expired!(self, self.conn_limits),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Connection {
    created: Instant,
    request_count: usize,
    pub(crate) suspend: Arc<SuspendHandle>,
}

impl Connection {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            request_count: 0,
            suspend: Arc::new(SuspendHandle::default()),
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.created = Instant::now();
        self.request_count = 0;
        // A fresh handle, not just a cleared flag: a `SuspendToken` handed
        // out to this slot's previous occupant must not be able to resume
        // (or appear suspended to) whatever connection gets pooled in next.
        self.suspend = Arc::new(SuspendHandle::default());
    }
}

/// Suspend/resume state shared between a connection's run loop and whatever
/// external code eventually calls [`SuspendToken::resume`].
#[derive(Debug, Default)]
pub(crate) struct SuspendHandle {
    flag: AtomicBool,
    notify: Notify,
}

impl SuspendHandle {
    #[inline]
    pub(crate) fn suspend(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_suspended(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Waits for [`SuspendToken::resume`] or `deadline`, whichever comes
    /// first. A deadline hit surfaces as a plain I/O timeout, same as any
    /// other connection-fatal error.
    pub(crate) async fn wait(&self, deadline: std::time::Duration) -> Result<(), io::Error> {
        tokio::select! {
            biased;

            _ = self.notify.notified() => Ok(()),
            _ = sleep(deadline) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "suspend exceeded connection lifetime"))
            },
        }
    }
}

/// A handle to resume a connection suspended from within [`Handler::handle`]
/// via [`Request::suspend`](crate::Request::suspend).
///
/// Obtained from [`Request::suspend_handle`](crate::Request::suspend_handle)
/// before the handler returns, and typically stashed somewhere (a background
/// task, a channel, [`ConnectionData`]) that can call [`resume`](Self::resume)
/// once whatever the connection was waiting on completes.
#[derive(Debug, Clone)]
pub struct SuspendToken(pub(crate) Arc<SuspendHandle>);

impl SuspendToken {
    /// Wakes the connection if it's currently suspended. Idempotent; calling
    /// it on a connection that isn't suspended (or has already moved on) is
    /// a no-op.
    #[inline]
    pub fn resume(&self) {
        self.0.flag.store(false, Ordering::Release);
        self.0.notify.notify_waiters();
    }
}

//

/// Managing user session data stored between requests within a single HTTP connection.
///
/// This trait allows you to store arbitrary state (e.g., authentication data,
/// multistep form status, cache, etc.). The state is available across all requests
/// within a single HTTP keep-alive connection.
///
/// # Examples
/// ```no_run
/// use embeddable_httpd::ConnectionData;
/// use std::collections::HashMap;
///
/// struct MyConnectionData {
///     user_id: Option<i32>,
///     request_count: usize,
///     cache: HashMap<usize, [u8; 4]>,
/// }
///
/// impl ConnectionData for MyConnectionData {
///     fn new() -> Self {
///         Self {
///             user_id: None,
///             request_count: 0,
///             cache: HashMap::new(),
///         }
///     }
///
///     fn reset(&mut self) {
///         self.user_id = None;
///         self.request_count = 0;
///         self.cache.clear(); // Saving the allocated memory
///     }
/// }
/// ```
///
/// Check out a [real-world example
/// ](https://github.com/AmakeSashaDev/embeddable_httpd/blob/main/examples/request_counter.rs)
/// (well, almost)
pub trait ConnectionData: Sync + Send + 'static {
    /// Creates a new instance of user data.
    ///
    /// It is called once at server startup, which avoids runtime allocations.
    fn new() -> Self;

    /// Resets the internal state of the instance to its initial values.
    ///
    /// It is called after the connection is closed. Allows repeated
    /// use of the instance for the following connections. If implemented
    /// correctly, avoids any allocations.
    fn reset(&mut self);
}

impl ConnectionData for () {
    #[inline(always)]
    fn new() -> Self {}

    #[inline(always)]
    fn reset(&mut self) {}
}

/// A trait for filtering TCP connections before HTTP processing.
///
/// # Examples
///
/// Simple IP Blacklist:
/// ```
/// use std::{collections::HashSet, net::{SocketAddr, IpAddr}};
/// use embeddable_httpd::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// struct MyConnFilter {
///     blacklist: HashSet<IpAddr>
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(
///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
///     ) -> Result<(), Handled> {
///         if self.blacklist.contains(&client_addr.ip()) {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("Your IP is permanently banned"))
///         } else {
///             Ok(())
///         }
///     }
/// }
/// ```
/// File-based IP blacklist:
/// ```
/// use std::net::SocketAddr;
/// use embeddable_httpd::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// # struct DatabaseClient;
/// #
/// # impl DatabaseClient {
/// #     async fn execute(&self, _: &str) -> Option<Vec<&str>> {
/// #         Some(vec!["true"])
/// #     }
/// # }
/// #
/// #
/// struct MyConnFilter {
///     db: DatabaseClient
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut Response) -> Result<(), Handled> {
///         Ok(())
///     }
///
///     async fn filter_async(
///         &self,
///         client_addr: SocketAddr,
///         _: SocketAddr,
///         err_resp: &mut Response,
///     ) -> Result<(), Handled> {
///         let request = format!(
///             "SELECT EXISTS (SELECT 1 FROM ip_blacklist WHERE ip_address = '{}')",
///             client_addr.ip()
///         );
///
///         if self.db.execute(&request).await == Some(vec!["false"]) {
///             Ok(()) // IP not found in blacklist
///         } else {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("IP found in blacklist file"))
///         }
///     }
/// }
/// ```
/// Two-stage filtering with cache:
/// ```
/// use std::{collections::HashSet, sync::RwLock, net::{SocketAddr, IpAddr}};
/// use embeddable_httpd::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// # struct DatabaseClient;
/// #
/// # impl DatabaseClient {
/// #     async fn execute(&self, _: &str) -> Option<Vec<&str>> {
/// #         Some(vec!["true"])
/// #     }
/// # }
/// #
/// #
/// struct MyConnFilter {
///     cache: RwLock<HashSet<IpAddr>>,
///     db: DatabaseClient,
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(
///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
///     ) -> Result<(), Handled> {
///         let Ok(guard) = self.cache.read() else {
///             return Err(err_resp.status(StatusCode::InternalServerError)
///                 .body("Internal server error"));
///         };
///
///         if guard.contains(&client_addr.ip()) {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("Your IP is permanently banned"))
///         } else {
///             Ok(())
///         }
///     }
///
///     async fn filter_async(
///         &self,
///         client_addr: SocketAddr,
///         _: SocketAddr,
///         err_resp: &mut Response,
///     ) -> Result<(), Handled> {
///         let request = format!(
///             "SELECT EXISTS (SELECT 1 FROM ip_blacklist WHERE ip_address = '{}')",
///             client_addr.ip()
///         );
///
///         if self.db.execute(&request).await == Some(vec!["false"]) {
///             Ok(()) // IP not found in blacklist
///         } else {
///             let Ok(mut guard) = self.cache.write() else {
///                 return Err(err_resp.status(StatusCode::InternalServerError)
///                     .body("Internal server error"));
///             };
///             guard.insert(client_addr.ip());
///
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("IP found in blacklist file"))
///         }
///     }
/// }
/// ```
/// # Connection Filter Architecture
/// ```text
///                     [ QUEUE TCP_STREAM ]
///                              ||
/// /----------------------------||----------------------------------\
/// |                            || TCP_STREAM            Tokio Task |
/// |       /=====================/                                  |
/// |       \/                                                       |
/// |   [--------]   Err(Handled)   [----------------------]         |
/// |   [ filter ] ===============> [ Send `error_response`]         |
/// |   [--------]                  [----------------------]         |
/// |       ||                                 /\                    |
/// |       || Ok(())                          ||                    |
/// |       \/                Err(Handled)     ||                    |
/// |   [--------------] ========================/                   |
/// |   [ filter_async ]                             [-----------]   |
/// |   [--------------] ==========================> [  Handler  ]   |
/// |                             Ok(())             [-----------]   |
/// |                                                                |
/// \----------------------------------------------------------------/
/// ```
pub trait ConnectionFilter: Sync + Send + 'static {
    /// Synchronous connection validation.
    ///
    /// Perform fast, in-memory checks here. Expensive operations should be deferred
    /// to [`filter_async`](Self::filter_async).
    ///
    /// Use for:
    /// - IP blacklist/whitelist (in-memory cache)
    /// - Geographic IP restrictions
    /// - Rate limiting counters
    fn filter(
        &self,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        error_response: &mut Response,
    ) -> Result<(), Handled>;

    /// Asynchronous connection inspection.
    ///
    /// Called after [`filter`](Self::filter) succeeds.Executes asynchronously within
    /// the Tokio runtime.
    ///
    /// Use for:
    /// - Database lookups
    /// - External API calls
    /// - File system operations
    /// - Complex business logic
    /// - Machine learning inference
    fn filter_async(
        &self,
        #[allow(unused_variables)] client_addr: SocketAddr,
        #[allow(unused_variables)] server_addr: SocketAddr,
        #[allow(unused_variables)] error_response: &mut Response,
    ) -> impl Future<Output = Result<(), Handled>> + Send {
        async { Ok(()) }
    }
}

impl ConnectionFilter for () {
    fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut Response) -> Result<(), Handled> {
        Ok(())
    }
}

//

#[cfg(test)]
mod def_handler {
    use super::*;
    use crate::{Handled, StatusCode};

    pub(crate) struct DefHandler;

    impl Handler<()> for DefHandler {
        async fn handle(&self, _: &mut (), _: &Request, r: &mut Response) -> Handled {
            r.status(StatusCode::Ok).body("test")
        }
    }

    impl HttpConnection<DefHandler, ()> {
        #[inline]
        pub(crate) fn from_req<V: AsRef<[u8]>>(value: V) -> Self {
            let req_limits = ReqLimits::default().precalculate();
            let resp_limits = RespLimits::default();

            Self {
                handler: Arc::new(DefHandler),
                connection_data: (),

                connection: Connection::new(),
                parser: Parser::from(&req_limits, value),
                request: Request::new(&req_limits),
                response: Response::new(&resp_limits),

                server_limits: ServerLimits::default(),
                conn_limits: ConnLimits::default(),
                http_09_limits: None,
                req_limits,
                resp_limits,
                post_limits: crate::limits::PostLimits::default(),
                auth_limits: crate::limits::AuthLimits::default(),
            }
        }
    }
}
