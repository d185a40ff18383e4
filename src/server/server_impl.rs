use crate::{
    errors::ErrorKind,
    http::{
        request::Request,
        response::{Handled, Response},
    },
    limits::{
        AuthLimits, ConnLimits, Http09Limits, IpLimits, PostLimits, ReqLimits, RespLimits,
        ServerLimits, WaitStrategy,
    },
    server::{
        connection::{ConnectionData, HttpConnection},
        ip_table::IpTable,
        run_mode::RunMode,
    },
    ConnectionFilter, Version,
};
use crossbeam::queue::SegQueue;
use std::{
    future::Future,
    marker::{PhantomData, Send, Sync},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Notify, Semaphore},
    task::{yield_now, JoinSet},
    time::{sleep as tokio_sleep, timeout as tokio_timeout},
};

/// A handle for requesting graceful shutdown of a running [`Server`].
///
/// Calling [`shutdown`](Self::shutdown) stops the accept loop and all worker
/// tasks from picking up further connections; connections already in
/// progress are allowed to finish.
#[derive(Clone)]
pub struct ShutdownHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    fn new() -> Self {
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Requests shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Returns whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// A trait for handling HTTP requests and generating responses.
///
/// You can use:
/// - `&self` for shared immutable data (e.g. database connection pool, router configuration)
/// - `&mut S` for connection-specific mutable state (e.g. authentication tokens, session data)
///
/// # Examples
///
/// Basic Request Handler
/// ```
/// use embeddable_httpd::{Handler, Request, Response, Handled, StatusCode};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &mut (), req: &Request, resp: &mut Response) -> Handled {
///         // Simple echo handler
///         if req.url().target() == b"/echo" {
///             resp.status(StatusCode::Ok).body("Echo response")
///         } else {
///             resp.status(StatusCode::NotFound).body("Not found :(")
///         }
///     }
/// }
/// ```
/// Handler with [`ConnectionData`]
/// ```
/// use embeddable_httpd::{Handler, ConnectionData, Request, Response, Handled, StatusCode};
///
/// struct CountingHandler;
///
/// impl Handler<State> for CountingHandler {
///     async fn handle(&self, data: &mut State, req: &Request, resp: &mut Response) -> Handled {
///         data.request_count += 1;
///
///         resp.status(StatusCode::Ok)
///             .body(format!("Request #{}", data.request_count))
///     }
/// }
///
/// struct State {
///     request_count: usize,
/// }
///
/// impl ConnectionData for State {
///     fn new() -> Self {
///         Self { request_count: 0 }
///     }
///     
///     fn reset(&mut self) {
///         self.request_count = 0;
///     }
/// }
/// ```
pub trait Handler<S = ()>
where
    Self: Sync + Send + 'static,
    S: ConnectionData,
{
    /// Processes an HTTP request and generates a response.
    ///
    /// # Parameters
    ///
    /// - `connection_data`: Mutable reference to connection-specific state
    /// - `req`: Immutable reference to the parsed HTTP request
    /// - `resp`: Mutable response builder for constructing the response
    ///
    /// # Returns
    ///
    /// `Handled` indicating whether the request was fully processed or
    /// requires further handling by other middleware.
    ///
    /// # Errors
    ///
    /// Implementations should handle errors internally and set appropriate
    /// HTTP status codes on the response. Panics will terminate the connection.
    fn handle(
        &self,
        connection_data: &mut S,
        request: &Request,
        response: &mut Response,
    ) -> impl Future<Output = Handled> + Send;

    /// Offered successive slices of the request body before [`handle`
    /// ](Self::handle) runs, for implementations that want to process a
    /// large upload incrementally (streaming it to disk, hashing it, etc.)
    /// instead of only seeing it as one `&[u8]` via [`Request::body`].
    ///
    /// Returns how many bytes of `data` were consumed; the connection calls
    /// `upload` again with the remainder until the whole body has been
    /// offered. The default implementation consumes everything in one call,
    /// which is exactly today's behavior for handlers that don't override it.
    #[allow(unused_variables)]
    fn upload(
        &self,
        connection_data: &mut S,
        request: &Request,
        data: &[u8],
    ) -> impl Future<Output = usize> + Send {
        async move { data.len() }
    }
}

/// An HTTP server that processes incoming connections and requests.
///
/// The server uses a pre-allocated connection pool for maximum performance
/// and implements graceful connection handling with configurable limits.
///
/// # Examples
///
/// ```no_run
/// use embeddable_httpd::{Server, Handler, Request, Response, Handled, StatusCode};
/// use tokio::net::TcpListener;
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
///         resp.status(StatusCode::Ok).body("Hello world!")
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .handler(MyHandler)
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    server_limits: ServerLimits,
    shutdown: ShutdownHandle,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embeddable_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tokio::net::TcpListener;
    /// use embeddable_httpd::Server;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build();
    /// # }
    /// ```
    #[inline]
    pub fn builder<H, S>() -> ServerBuilder<H, S, ()>
    where
        H: Handler<S>,
        S: ConnectionData,
    {
        ServerBuilder {
            listener: None,
            handler: None,
            connection_filter: Arc::new(()),
            _marker: PhantomData,

            server_limits: None,
            request_limits: None,
            response_limits: None,
            connection_limits: None,
            http_09_limits: None,
            run_mode: None,
            post_limits: None,
            auth_limits: None,
            ip_limits: None,
        }
    }

    /// Returns a handle that can later be used to request graceful shutdown.
    ///
    /// Clone and store it before calling [`launch`](Self::launch), which
    /// consumes `self`.
    #[inline(always)]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Starts the server and begins accepting incoming connections.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embeddable_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use embeddable_httpd::Server;
    /// use tokio::net::TcpListener;
    ///
    /// Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build()
    ///     .launch()
    ///     .await
    /// # }
    /// ```
    ///
    /// Once shutdown is requested, the accept loop stops and `launch` waits
    /// up to [`ServerLimits::shutdown_grace`] for connections already being
    /// served to finish before returning; anything still running past the
    /// grace period is abandoned.
    #[inline]
    pub async fn launch(self) {
        tracing::info!(
            max_connections = self.server_limits.max_connections,
            "daemon starting"
        );

        loop {
            if self.shutdown.is_shutdown() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.shutdown.notify.notified() => {
                    break;
                }
                accepted = self.listener.accept() => {
                    let Ok(value) = accepted else {
                        continue;
                    };

                    match self.stream_queue.len() < self.server_limits.max_pending_connections {
                        true => self.stream_queue.push(value),
                        false => self.error_queue.push(value),
                    }
                }
            }
        }

        tracing::info!("daemon stopping, draining in-flight connections");

        let mut tasks = std::mem::replace(
            &mut *self.tasks.lock().expect("task registry mutex poisoned"),
            JoinSet::new(),
        );
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };

        match tokio_timeout(self.server_limits.shutdown_grace, drain).await {
            Ok(()) => tracing::info!("daemon stopped, all connections drained"),
            Err(_) => tracing::warn!(
                remaining = tasks.len(),
                "shutdown grace period elapsed, abandoning remaining connections"
            ),
        }
    }

    #[inline]
    async fn get_stream(
        queue: &TcpQueue,
        wait: &WaitStrategy,
        shutdown: &ShutdownHandle,
    ) -> Option<(TcpStream, SocketAddr)> {
        loop {
            if let Some(value) = queue.pop() {
                return Some(value);
            }

            if shutdown.is_shutdown() {
                return None;
            }

            match wait {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
///
/// # Protocol Support
///
/// - `HTTP/1.X` (HTTP/1.1 or HTTP/1.1): Always enabled
/// - [`HTTP/0.9+`](crate::limits::Http09Limits): Optional,
///   enabled by setting [`http_09_limits`](Self::http_09_limits)
pub struct ServerBuilder<H, S = (), F = ()>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    listener: Option<TcpListener>,
    handler: Option<Arc<H>>,
    connection_filter: Arc<F>,
    _marker: PhantomData<S>,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    connection_limits: Option<ConnLimits>,
    http_09_limits: Option<Http09Limits>,
    run_mode: Option<RunMode>,
    post_limits: Option<PostLimits>,
    auth_limits: Option<AuthLimits>,
    ip_limits: Option<IpLimits>,
}

impl<H, S, F> ServerBuilder<H, S, F>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// **This is a required component.**
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embeddable_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tokio::net::TcpListener;
    /// use embeddable_httpd::Server;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the request handler that will process incoming requests.
    ///
    /// **This is a required component.**
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use embeddable_httpd::{Server, Handler, Request, Response, Handled, StatusCode};
    /// use tokio::net::TcpListener;
    ///
    /// struct MyStruct;
    ///
    /// impl Handler for MyStruct {
    ///     async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
    ///         resp.status(StatusCode::Ok).body("Hello World!")
    ///     }
    /// }
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct)
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Installs a connection filter to check incoming TCP connections
    /// before using it.
    ///
    /// Allows early rejection of unwanted IP addresses (before the
    /// first read). Can be used for DDoS protection, geobanning, etc.
    ///
    /// For more information, see [ConnectionFilter](crate::ConnectionFilter)
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embeddable_httpd::impt_default_handler!{ MyStruct }
    /// use tokio::net::TcpListener;
    /// use std::net::SocketAddr;
    /// use embeddable_httpd::{ConnectionFilter, Server};
    ///
    /// struct MyConnFilter {
    ///     blacklist: Vec<SocketAddr>
    /// }
    ///
    /// impl ConnectionFilter for MyConnFilter {
    ///     fn filter(
    ///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
    ///     ) -> Result<(), Handled> {
    ///         if self.blacklist.contains(&client_addr) {
    ///             Err(err_resp
    ///                 .status(StatusCode::Forbidden)
    ///                 .body(b"Your IP is permanently banned"))
    ///         } else {
    ///             Ok(())
    ///         }
    ///     }
    /// }
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let filter = MyConnFilter {
    ///     blacklist: vec![
    ///         "192.0.2.1".parse().unwrap(),
    ///         "198.51.100.1".parse().unwrap(),
    ///         "203.0.113.1".parse().unwrap(),
    ///         "10.0.0.1".parse().unwrap(),
    ///     ]
    /// };
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .conn_filter(filter)
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn conn_filter<NewF>(self, filter: NewF) -> ServerBuilder<H, S, NewF>
    where
        NewF: ConnectionFilter,
    {
        ServerBuilder {
            listener: self.listener,
            handler: self.handler,
            connection_filter: Arc::new(filter),
            _marker: self._marker,
            server_limits: self.server_limits,
            request_limits: self.request_limits,
            response_limits: self.response_limits,
            connection_limits: self.connection_limits,
            http_09_limits: self.http_09_limits,
            run_mode: self.run_mode,
            post_limits: self.post_limits,
            auth_limits: self.auth_limits,
            ip_limits: self.ip_limits,
        }
    }

    /// Selects the connection scheduling model. Defaults to
    /// [`RunMode::WorkerPool`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embeddable_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use embeddable_httpd::{RunMode, Server};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .run_mode(RunMode::ThreadPerConnection)
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = Some(run_mode);
        self
    }

    /// Configures request parsing and processing limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embeddable_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use embeddable_httpd::{Server, limits::ServerLimits};
    /// use tokio::net::TcpListener;
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .server_limits(ServerLimits {
    ///         // Your changes
    ///         max_connections: 2500,
    ///         max_pending_connections: 10000,
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures request parsing and processing limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embeddable_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use embeddable_httpd::{Server, limits::ConnLimits};
    /// use tokio::net::TcpListener;
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .connection_limits(ConnLimits {
    ///         // Your changes
    ///         socket_read_timeout: Duration::from_secs(5),
    ///         socket_write_timeout: Duration::from_secs(2),
    ///         connection_lifetime: Duration::from_secs(200),
    ///         ..ConnLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Enables and configures [`HTTP/0.9+`](crate::limits::Http09Limits) protocol support.
    ///
    /// # Note
    ///
    /// Omitting this call will completely disable HTTP/0.9+ support. The server
    /// will reject any HTTP/0.9+ requests, returning an error to the client.
    ///
    /// # Examples
    ///
    /// Enabling [`Http09Limits`]:
    /// ```no_run
    /// # embeddable_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use embeddable_httpd::{Server, limits::Http09Limits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .http_09_limits(Http09Limits::default())
    ///     .build();
    /// # }
    /// ```
    /// Change [`Http09Limits`]:
    /// ```no_run
    /// # embeddable_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use embeddable_httpd::{Server, limits::Http09Limits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .http_09_limits(Http09Limits {
    ///         // Your changes
    ///         max_requests_per_connection: 1000,
    ///         ..Http09Limits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn http_09_limits(mut self, limits: Http09Limits) -> Self {
        self.http_09_limits = Some(limits);
        self
    }

    /// Configures request parsing and processing limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embeddable_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use embeddable_httpd::{Server, limits::ReqLimits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .request_limits(ReqLimits {
    ///         // Your changes
    ///         url_size: 1024,
    ///         url_query_parts: 32,
    ///         url_parts: 20,
    ///         ..ReqLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response processing limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embeddable_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use embeddable_httpd::{Server, limits::RespLimits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .response_limits(RespLimits {
    ///         // Your changes
    ///         default_capacity: 1024,
    ///         max_capacity: 4096,
    ///         ..RespLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Configures limits for decoding `POST` bodies
    /// (`application/x-www-form-urlencoded` and `multipart/form-data`).
    #[inline(always)]
    pub fn post_limits(mut self, limits: PostLimits) -> Self {
        self.post_limits = Some(limits);
        self
    }

    /// Configures limits for the built-in Basic/Digest authentication helpers,
    /// in particular the digest nonce table's size and lifetime.
    #[inline(always)]
    pub fn auth_limits(mut self, limits: AuthLimits) -> Self {
        self.auth_limits = Some(limits);
        self
    }

    /// Configures the per-source-IP connection cap enforced during admission.
    #[inline(always)]
    pub fn ip_limits(mut self, limits: IpLimits) -> Self {
        self.ip_limits = Some(limits);
        self
    }

    /// Finalizes the builder and constructs a [`Server`] instance.
    ///
    /// # Panics
    ///
    /// Error messages:
    /// - ``The `listener` method must be called to create``
    /// - ``The `handler` method must be called to create``
    ///
    /// Panics when:
    /// - The `listener` method was not called.
    /// - The `handler` method was not called.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embeddable_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tokio::net::TcpListener;
    /// use embeddable_httpd::Server;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build();
    ///
    /// // Yes, 3 identical examples, for you, in case you suddenly get lost :)
    /// #
    /// # // No, really. Documentation can be difficult for beginners.
    /// # }
    /// ```
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server {
        let (listener, handler, filter, limits, run_mode) = self.get_all_parts();

        let stream_queue = Arc::new(SegQueue::new());
        let error_queue = Arc::new(SegQueue::new());
        let shutdown = ShutdownHandle::new();
        let ip_table = Arc::new(IpTable::new());
        let tasks = Arc::new(Mutex::new(JoinSet::new()));

        match run_mode {
            RunMode::WorkerPool => {
                for _ in 0..limits.0.max_connections {
                    Self::spawn_worker(
                        &stream_queue,
                        &limits,
                        &filter,
                        &handler,
                        &shutdown,
                        &ip_table,
                        &tasks,
                    );
                }
            }
            RunMode::ThreadPerConnection => {
                let connections_cap = Arc::new(Semaphore::new(limits.0.max_connections.max(1)));
                Self::spawn_dispatcher(
                    &stream_queue,
                    &limits,
                    &filter,
                    &handler,
                    &shutdown,
                    &ip_table,
                    &tasks,
                    &connections_cap,
                );
            }
        }
        if limits.0.count_503_handlers != 0 {
            for _ in 0..limits.0.count_503_handlers {
                Self::spawn_alarmist(&error_queue, &limits, &shutdown, &tasks);
            }
        } else {
            Self::spawn_quiet_alarmist(&error_queue, &limits, &shutdown, &tasks);
        }

        Server {
            listener,
            stream_queue,
            error_queue,
            server_limits: limits.0,
            shutdown,
            tasks,
        }
    }

    /// A worker's pool slot is itself the hard connection-count limit (the
    /// pool has exactly `max_connections` of these loops); admission below
    /// only needs to check the per-IP table and then the policy callback.
    #[inline]
    fn spawn_worker(
        queue: &TcpQueue,
        limits: &AllLimits,
        filter: &Arc<F>,
        handler: &Arc<H>,
        shutdown: &ShutdownHandle,
        ip_table: &Arc<IpTable>,
        tasks: &Arc<Mutex<JoinSet<()>>>,
    ) {
        let queue = queue.clone();
        let filter = filter.clone();
        let shutdown = shutdown.clone();
        let ip_table = ip_table.clone();
        let max_per_ip = limits.7.max_per_ip;
        let mut conn = HttpConnection::new(handler.clone(), limits.clone());

        tasks.lock().expect("task registry mutex poisoned").spawn(async move {
            loop {
                let Some((mut stream, addr)) =
                    Server::get_stream(&queue, &conn.server_limits.wait_strategy, &shutdown).await
                else {
                    return;
                };

                let Ok(local_addr) = stream.local_addr() else {
                    continue;
                };

                if !ip_table.try_admit(addr.ip(), max_per_ip) {
                    tracing::warn!(peer = %addr, max_per_ip, "per-IP admission limit reached");
                    let _ = conn
                        .conn_limits
                        .send_error(
                            &mut stream,
                            ErrorKind::ServiceUnavailable,
                            Version::Http11,
                            conn.server_limits.json_errors,
                        )
                        .await;
                    continue;
                }

                if filter.filter(addr, local_addr, &mut conn.response).is_err()
                    || filter
                        .filter_async(addr, local_addr, &mut conn.response)
                        .await
                        .is_err()
                {
                    tracing::debug!(peer = %addr, "connection filter rejected");
                    let _ = conn
                        .conn_limits
                        .write_bytes(&mut stream, conn.response.buffer())
                        .await;

                    conn.response.reset(&conn.resp_limits);
                    ip_table.release(addr.ip());
                    continue;
                }

                let _ = conn.run(&mut stream, addr, local_addr).await;
                ip_table.release(addr.ip());
            }
        });
    }

    /// The [`RunMode::ThreadPerConnection`] counterpart to [`spawn_worker`](Self::spawn_worker):
    /// a single long-lived task drains the queue and spawns a fresh,
    /// short-lived task (and [`HttpConnection`]) for each connection instead
    /// of looping over one reused connection.
    ///
    /// Unlike the worker pool, nothing here structurally bounds how many of
    /// these short-lived tasks can run at once, so `connections_cap` (sized
    /// to [`ServerLimits::max_connections`](crate::limits::ServerLimits))
    /// enforces the hard connection-count limit before any other admission
    /// check runs.
    #[inline]
    fn spawn_dispatcher(
        queue: &TcpQueue,
        limits: &AllLimits,
        filter: &Arc<F>,
        handler: &Arc<H>,
        shutdown: &ShutdownHandle,
        ip_table: &Arc<IpTable>,
        tasks: &Arc<Mutex<JoinSet<()>>>,
        connections_cap: &Arc<Semaphore>,
    ) {
        let queue = queue.clone();
        let limits = limits.clone();
        let filter = filter.clone();
        let handler = handler.clone();
        let shutdown = shutdown.clone();
        let ip_table = ip_table.clone();
        let tasks = tasks.clone();
        let connections_cap = connections_cap.clone();

        let tasks_outer = tasks.clone();
        tasks_outer.lock().expect("task registry mutex poisoned").spawn(async move {
            loop {
                let Some((mut stream, addr)) =
                    Server::get_stream(&queue, &limits.0.wait_strategy, &shutdown).await
                else {
                    return;
                };

                let Ok(permit) = connections_cap.clone().try_acquire_owned() else {
                    tracing::warn!(
                        peer = %addr,
                        max_connections = limits.0.max_connections,
                        "hard connection limit reached"
                    );
                    let (server_limits, conn_limits, ..) = limits.clone();
                    let _ = conn_limits
                        .send_error(
                            &mut stream,
                            ErrorKind::ServiceUnavailable,
                            Version::Http11,
                            server_limits.json_errors,
                        )
                        .await;
                    continue;
                };

                let limits = limits.clone();
                let filter = filter.clone();
                let handler = handler.clone();
                let ip_table = ip_table.clone();

                tasks.lock().expect("task registry mutex poisoned").spawn(async move {
                    let _permit = permit;

                    let Ok(local_addr) = stream.local_addr() else {
                        return;
                    };

                    let max_per_ip = limits.7.max_per_ip;
                    let mut conn = HttpConnection::new(handler, limits);

                    if !ip_table.try_admit(addr.ip(), max_per_ip) {
                        tracing::warn!(peer = %addr, max_per_ip, "per-IP admission limit reached");
                        let _ = conn
                            .conn_limits
                            .send_error(
                                &mut stream,
                                ErrorKind::ServiceUnavailable,
                                Version::Http11,
                                conn.server_limits.json_errors,
                            )
                            .await;
                        return;
                    }

                    if filter.filter(addr, local_addr, &mut conn.response).is_err()
                        || filter
                            .filter_async(addr, local_addr, &mut conn.response)
                            .await
                            .is_err()
                    {
                        tracing::debug!(peer = %addr, "connection filter rejected");
                        let _ = conn
                            .conn_limits
                            .write_bytes(&mut stream, conn.response.buffer())
                            .await;
                        ip_table.release(addr.ip());
                        return;
                    }

                    let _ = conn.run(&mut stream, addr, local_addr).await;
                    ip_table.release(addr.ip());
                });
            }
        });
    }

    #[inline]
    fn spawn_alarmist(
        queue: &TcpQueue,
        limits: &AllLimits,
        shutdown: &ShutdownHandle,
        tasks: &Arc<Mutex<JoinSet<()>>>,
    ) {
        let queue = queue.clone();
        let (server_limits, conn_limits, ..) = limits.clone();
        let shutdown = shutdown.clone();

        tasks.lock().expect("task registry mutex poisoned").spawn(async move {
            loop {
                let Some((mut stream, _)) =
                    Server::get_stream(&queue, &server_limits.wait_strategy, &shutdown).await
                else {
                    return;
                };

                let _ = conn_limits
                    .send_error(
                        &mut stream,
                        ErrorKind::ServiceUnavailable,
                        Version::Http11,
                        server_limits.json_errors,
                    )
                    .await;
            }
        });
    }

    #[inline]
    fn spawn_quiet_alarmist(
        queue: &TcpQueue,
        limits: &AllLimits,
        shutdown: &ShutdownHandle,
        tasks: &Arc<Mutex<JoinSet<()>>>,
    ) {
        let queue = queue.clone();
        let (server_limits, ..) = limits.clone();
        let shutdown = shutdown.clone();

        tasks.lock().expect("task registry mutex poisoned").spawn(async move {
            loop {
                let Some((stream, _)) =
                    Server::get_stream(&queue, &server_limits.wait_strategy, &shutdown).await
                else {
                    return;
                };

                drop(stream);
            }
        });
    }

    #[inline]
    #[track_caller]
    fn get_all_parts(self) -> (TcpListener, Arc<H>, Arc<F>, AllLimits, RunMode) {
        (
            self.listener
                .expect("The `listener` method must be called to create"),
            self.handler
                .expect("The `handler` method must be called to create"),
            self.connection_filter,
            (
                self.server_limits.clone().unwrap_or_default(),
                self.connection_limits.clone().unwrap_or_default(),
                self.http_09_limits.clone(),
                self.request_limits
                    .clone()
                    .unwrap_or_default()
                    .precalculate(),
                self.response_limits.clone().unwrap_or_default(),
                self.post_limits.clone().unwrap_or_default(),
                self.auth_limits.clone().unwrap_or_default(),
                self.ip_limits.clone().unwrap_or_default(),
            ),
            self.run_mode.unwrap_or_default(),
        )
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;
pub(crate) type AllLimits = (
    ServerLimits,
    ConnLimits,
    Option<Http09Limits>,
    ReqLimits,
    RespLimits,
    PostLimits,
    AuthLimits,
    IpLimits,
);
