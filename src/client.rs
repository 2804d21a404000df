//! Connection builder and the public request surface.
//!
//! The [`ConnectionBuilder`] collects settings and opens the first
//! connection instance. A [`Connection`] then owns the lifecycle:
//! 1. Open a stream through the [`Connector`]
//! 2. Greeting, authentication and (optionally) the schema fetch
//! 3. Serve requests, refetching the schema when the server reports a
//!    newer one
//! 4. Reconnect in the background when the instance breaks
//!
//! # Example
//!
//! ```no_run
//! use iproto_client::{Connection, SelectOptions};
//! use rmpv::Value;
//!
//! #[tokio::main]
//! async fn main() -> iproto_client::Result<()> {
//!     let conn = Connection::builder()
//!         .username("app")
//!         .password("secret")
//!         .connect("127.0.0.1:3301")
//!         .await?;
//!
//!     conn.ping(None).await?;
//!
//!     let users = conn
//!         .select("users", vec![Value::from(1)], SelectOptions::default(), None)
//!         .await?;
//!     for user in users.tuples() {
//!         println!("{:?}", user.to_record());
//!     }
//!
//!     conn.disconnect().await;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use rmpv::Value;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{Request, Response, SqlStatement, TupleData};
use crate::error::{IprotoError, Result};
use crate::protocol::{
    Credentials, Greeting, IteratorType, Version, DEFAULT_MAX_PAYLOAD_SIZE,
};
use crate::reconnect::{ReconnectController, ReconnectPolicy, ReconnectState};
use crate::schema::{IndexRef, Schema, SchemaCache, SpaceRef};
use crate::session::{Session, SessionConfig};
use crate::transport::{BoxFuture, Connector, TcpConnector};
use crate::writer::WriterConfig;

/// Default timeout for opening a connection instance (stream + handshake).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default number of schema-mismatch retries per request.
pub const DEFAULT_SCHEMA_RETRY_LIMIT: u32 = 1;

/// Builder for configuring and opening a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    username: Option<String>,
    password: String,
    fetch_schema: bool,
    auto_refetch_schema: bool,
    request_timeout: Option<Duration>,
    connect_timeout: Duration,
    schema_retry_limit: u32,
    max_payload_size: u32,
    reconnect: ReconnectPolicy,
    writer_config: WriterConfig,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            username: None,
            password: String::new(),
            fetch_schema: true,
            auto_refetch_schema: true,
            request_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            schema_retry_limit: DEFAULT_SCHEMA_RETRY_LIMIT,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            reconnect: ReconnectPolicy::default(),
            writer_config: WriterConfig::default(),
        }
    }

    /// Authenticate as `username`. Without it the session stays `guest`.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Load the schema right after authentication.
    ///
    /// Default: true
    pub fn fetch_schema(mut self, enabled: bool) -> Self {
        self.fetch_schema = enabled;
        self
    }

    /// Refetch the schema and resend when the server reports a newer one.
    ///
    /// Default: true
    pub fn auto_refetch_schema(mut self, enabled: bool) -> Self {
        self.auto_refetch_schema = enabled;
        self
    }

    /// Deadline applied to requests that do not pass their own.
    ///
    /// Default: none
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Default: 3 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Delay between reconnect attempts.
    ///
    /// Default: 1/3 second
    pub fn reconnect_timeout(mut self, delay: Duration) -> Self {
        self.reconnect.delay = delay;
        self
    }

    /// Give up after `attempts` failed attempts per outage.
    ///
    /// Default: unlimited
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect.max_attempts = Some(attempts);
        self
    }

    /// Default: true
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect.enabled = enabled;
        self
    }

    /// How many times one request is resent after a schema mismatch.
    ///
    /// Default: 1
    pub fn schema_retry_limit(mut self, limit: u32) -> Self {
        self.schema_retry_limit = limit;
        self
    }

    /// Largest response packet accepted from the server.
    ///
    /// Default: 1 GB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Set the maximum queued request frames before senders wait.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.writer_config.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Set how long a sender waits for the write queue to drain.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.writer_config.backpressure_timeout = timeout;
        self
    }

    /// Connect over TCP to `host:port`.
    pub async fn connect(self, addr: impl Into<String>) -> Result<Connection> {
        self.connect_with(Arc::new(TcpConnector::new(addr))).await
    }

    /// Connect over a Unix domain socket.
    #[cfg(unix)]
    pub async fn connect_unix(self, path: impl AsRef<std::path::Path>) -> Result<Connection> {
        self.connect_with(Arc::new(crate::transport::UnixConnector::new(path)))
            .await
    }

    /// Connect through a custom [`Connector`].
    ///
    /// Connection attempts follow the reconnect policy; rejected credentials
    /// fail at once.
    pub async fn connect_with(self, connector: Arc<dyn Connector>) -> Result<Connection> {
        let inner = Arc::new(Inner::new(self, connector));
        inner.connect_loop(true).await?;
        Ok(Connection { inner })
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            credentials: self.username.as_ref().map(|username| Credentials {
                username: username.clone(),
                password: self.password.clone(),
            }),
            max_payload_size: self.max_payload_size,
            connect_timeout: self.connect_timeout,
            writer: self.writer_config.clone(),
        }
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Index, iterator and paging for [`Connection::select`].
#[derive(Debug, Clone, PartialEq)]
pub struct SelectOptions {
    pub index: IndexRef,
    pub iterator: IteratorType,
    pub limit: u32,
    pub offset: u32,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            index: IndexRef::default(),
            iterator: IteratorType::Eq,
            limit: u32::MAX,
            offset: 0,
        }
    }
}

impl SelectOptions {
    pub fn index(mut self, index: impl Into<IndexRef>) -> Self {
        self.index = index.into();
        self
    }

    pub fn iterator(mut self, iterator: IteratorType) -> Self {
        self.iterator = iterator;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }
}

struct Options {
    fetch_schema: bool,
    auto_refetch_schema: bool,
    request_timeout: Option<Duration>,
    schema_retry_limit: u32,
}

struct Inner {
    connector: Arc<dyn Connector>,
    session_config: SessionConfig,
    options: Options,
    /// Current connection instance, if any.
    session: RwLock<Option<Arc<Session>>>,
    schema: SchemaCache,
    controller: ReconnectController,
    /// Serializes connection attempts.
    connect_lock: Mutex<()>,
    /// Coalesces concurrent schema refetches.
    refetch_lock: Mutex<()>,
    next_session_id: AtomicU64,
}

impl Inner {
    fn new(builder: ConnectionBuilder, connector: Arc<dyn Connector>) -> Self {
        Self {
            session_config: builder.session_config(),
            connector,
            options: Options {
                fetch_schema: builder.fetch_schema,
                auto_refetch_schema: builder.auto_refetch_schema,
                request_timeout: builder.request_timeout,
                schema_retry_limit: builder.schema_retry_limit,
            },
            session: RwLock::new(None),
            schema: SchemaCache::new(),
            controller: ReconnectController::new(builder.reconnect),
            connect_lock: Mutex::new(()),
            refetch_lock: Mutex::new(()),
            next_session_id: AtomicU64::new(1),
        }
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(session)
    }

    fn take(&self) -> Option<Arc<Session>> {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Clear the slot if it still holds session `id`.
    fn clear(&self, id: u64) -> bool {
        let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|session| session.id() == id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn ready_session(&self) -> Result<Arc<Session>> {
        if !self.controller.state().accepts_requests() {
            return Err(IprotoError::NotConnected);
        }
        self.current()
            .filter(|session| session.is_ready())
            .ok_or(IprotoError::NotConnected)
    }

    fn deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        timeout
            .or(self.options.request_timeout)
            .map(|timeout| Instant::now() + timeout)
    }

    /// Run connection attempts per the reconnect policy until one succeeds.
    async fn connect_loop(self: &Arc<Self>, initial: bool) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.current().is_some_and(|session| session.is_ready()) {
            return if self.controller.advance(ReconnectState::Connected) {
                Ok(())
            } else {
                Err(IprotoError::NotConnected)
            };
        }

        let this = self;
        self.controller
            .run(initial, move |attempt| {
                debug!(attempt, peer = %this.connector.peer(), "Connecting");
                this.open_session()
            })
            .await
    }

    /// Open one connection instance and make it current.
    async fn open_session(self: &Arc<Self>) -> Result<()> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::establish(self.connector.as_ref(), &self.session_config, id).await?;

        // A schema that was in use before the outage may be stale now.
        if self.options.fetch_schema || !self.schema.snapshot().is_empty() {
            let deadline = Instant::now() + self.session_config.connect_timeout;
            match session.fetch_schema(Some(deadline)).await {
                Ok(schema) => {
                    self.schema.replace(Arc::new(schema));
                }
                Err(e) => {
                    session.close();
                    return Err(e);
                }
            }
        }

        if self.controller.state() == ReconnectState::Closed {
            session.close();
            return Err(IprotoError::NotConnected);
        }

        info!(
            session = id,
            peer = %self.connector.peer(),
            version = %session.greeting().version,
            schema_id = ?self.schema.schema_id(),
            "Connected"
        );

        if let Some(previous) = self.install(session.clone()) {
            previous.close();
        }
        // A disconnect between the check above and the install missed this session.
        if self.controller.state() == ReconnectState::Closed {
            self.clear(id);
            session.close();
            return Err(IprotoError::NotConnected);
        }
        tokio::spawn(supervise(Arc::downgrade(self), session));
        Ok(())
    }

    /// Send `request`, absorbing schema mismatches up to the retry limit.
    async fn execute(&self, request: &Request, deadline: Option<Instant>) -> Result<Response> {
        // Name resolution needs a schema.
        if request.uses_names() && self.schema.schema_id().is_none() {
            let session = self.ready_session()?;
            debug!("No schema loaded for a name-based request, fetching");
            self.refresh_schema(&session, None, deadline).await?;
        }

        let mut retries = 0;
        loop {
            let session = self.ready_session()?;
            let schema = self.schema.snapshot();

            match session.call(request, &schema, deadline).await {
                Err(err)
                    if err.is_schema_mismatch()
                        && self.options.auto_refetch_schema
                        && retries < self.options.schema_retry_limit =>
                {
                    retries += 1;
                    debug!(retries, stale_id = ?schema.id(), "Schema changed, refetching");
                    self.refresh_schema(&session, schema.id(), deadline).await?;
                }
                result => return result,
            }
        }
    }

    /// Refetch unless another caller already replaced the `stale` snapshot.
    async fn refresh_schema(
        &self,
        session: &Session,
        stale: Option<u64>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let _guard = self.refetch_lock.lock().await;
        if self.schema.schema_id() != stale {
            return Ok(());
        }

        let schema = session.fetch_schema(deadline).await?;
        info!(schema_id = ?schema.id(), spaces = schema.len(), "Schema refetched");
        self.schema.replace(Arc::new(schema));
        Ok(())
    }
}

/// Waits for a connection instance to break, then reconnects.
///
/// Boxed because the reconnect path spawns this again for the new instance.
fn supervise(inner: Weak<Inner>, session: Arc<Session>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        session.closed().await;
        let id = session.id();
        drop(session);

        let Some(inner) = inner.upgrade() else {
            return;
        };
        // Replaced or taken by an explicit reconnect or disconnect.
        if !inner.clear(id) || inner.controller.state() == ReconnectState::Closed {
            return;
        }

        if !inner.controller.policy().enabled {
            warn!(session = id, "Connection lost, auto-reconnect disabled");
            inner.controller.advance(ReconnectState::Disconnected);
            return;
        }

        warn!(session = id, "Connection lost, reconnecting");
        if !inner.controller.advance(ReconnectState::Reconnecting) {
            return;
        }
        if let Err(e) = inner.connect_loop(false).await {
            debug!(error = %e, "Reconnect loop ended");
        }
    })
}

/// A client connection that survives connection instances.
///
/// Requests may be issued concurrently from many tasks through `&self`;
/// share the connection with an `Arc`. Dropping it closes the current
/// connection instance and stops reconnecting.
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a new connection builder.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    pub async fn ping(&self, timeout: Option<Duration>) -> Result<()> {
        self.request(Request::Ping, timeout).await.map(|_| ())
    }

    pub async fn select(
        &self,
        space: impl Into<SpaceRef>,
        key: impl Into<TupleData>,
        options: SelectOptions,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let request = Request::Select {
            space: space.into(),
            index: options.index,
            key: key.into(),
            iterator: options.iterator,
            limit: options.limit,
            offset: options.offset,
        };
        self.request(request, timeout).await
    }

    pub async fn insert(
        &self,
        space: impl Into<SpaceRef>,
        tuple: impl Into<TupleData>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let request = Request::Insert {
            space: space.into(),
            tuple: tuple.into(),
        };
        self.request(request, timeout).await
    }

    pub async fn replace(
        &self,
        space: impl Into<SpaceRef>,
        tuple: impl Into<TupleData>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let request = Request::Replace {
            space: space.into(),
            tuple: tuple.into(),
        };
        self.request(request, timeout).await
    }

    /// Apply update `ops` (e.g. `["=", 2, value]`) to the tuple at `key`.
    pub async fn update(
        &self,
        space: impl Into<SpaceRef>,
        index: impl Into<IndexRef>,
        key: impl Into<TupleData>,
        ops: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let request = Request::Update {
            space: space.into(),
            index: index.into(),
            key: key.into(),
            ops,
        };
        self.request(request, timeout).await
    }

    pub async fn upsert(
        &self,
        space: impl Into<SpaceRef>,
        tuple: impl Into<TupleData>,
        ops: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let request = Request::Upsert {
            space: space.into(),
            tuple: tuple.into(),
            ops,
        };
        self.request(request, timeout).await
    }

    pub async fn delete(
        &self,
        space: impl Into<SpaceRef>,
        index: impl Into<IndexRef>,
        key: impl Into<TupleData>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let request = Request::Delete {
            space: space.into(),
            index: index.into(),
            key: key.into(),
        };
        self.request(request, timeout).await
    }

    /// Call a stored function; the response data holds its return values.
    pub async fn call(
        &self,
        function: impl Into<String>,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let request = Request::Call {
            function: function.into(),
            args,
        };
        self.request(request, timeout).await
    }

    /// Call with 1.6 semantics: every return value comes back as a tuple.
    pub async fn call16(
        &self,
        function: impl Into<String>,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let request = Request::Call16 {
            function: function.into(),
            args,
        };
        self.request(request, timeout).await
    }

    pub async fn eval(
        &self,
        expression: impl Into<String>,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let request = Request::Eval {
            expression: expression.into(),
            args,
        };
        self.request(request, timeout).await
    }

    /// Execute SQL text or a prepared statement id.
    pub async fn execute(
        &self,
        statement: impl Into<SqlStatement>,
        binds: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let request = Request::Execute {
            statement: statement.into(),
            binds,
        };
        self.request(request, timeout).await
    }

    pub async fn prepare(
        &self,
        sql: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        self.request(Request::Prepare { sql: sql.into() }, timeout)
            .await
    }

    /// Send any request.
    ///
    /// `timeout` overrides the configured request timeout. A schema mismatch
    /// reported by the server triggers a refetch and a resend of the same
    /// request, up to the configured retry limit.
    pub async fn request(&self, request: Request, timeout: Option<Duration>) -> Result<Response> {
        let deadline = self.inner.deadline(timeout);
        self.inner.execute(&request, deadline).await
    }

    /// Reload the schema now.
    pub async fn refetch_schema(&self) -> Result<Arc<Schema>> {
        let session = self.inner.ready_session()?;
        let deadline = self.inner.deadline(None);

        let _guard = self.inner.refetch_lock.lock().await;
        let schema = Arc::new(session.fetch_schema(deadline).await?);
        self.inner.schema.replace(schema.clone());
        Ok(schema)
    }

    /// Connect again after [`disconnect`](Self::disconnect) or a permanent
    /// failure. No-op while connected.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.inner.controller.set(ReconnectState::Connecting);
        self.inner.connect_loop(false).await
    }

    /// Drop the current connection instance and open a fresh one.
    ///
    /// Requests in flight on the old instance fail with `ConnectionLost`.
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.controller.set(ReconnectState::Connecting);
        if let Some(session) = self.inner.take() {
            session.close();
            session.closed().await;
        }
        self.inner.connect_loop(false).await
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Returns once requests in flight have been failed.
    pub async fn disconnect(&self) {
        self.inner.controller.set(ReconnectState::Closed);
        if let Some(session) = self.inner.take() {
            session.close();
            session.closed().await;
            info!(session = session.id(), "Disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.ready_session().is_ok()
    }

    pub fn state(&self) -> ReconnectState {
        self.inner.controller.state()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ReconnectState> {
        self.inner.controller.subscribe()
    }

    /// Greeting of the current connection instance.
    pub fn greeting(&self) -> Option<Greeting> {
        self.inner
            .current()
            .map(|session| session.greeting().clone())
    }

    /// Server version from the greeting.
    pub fn version(&self) -> Option<Version> {
        self.greeting().map(|greeting| greeting.version)
    }

    pub fn schema_id(&self) -> Option<u64> {
        self.inner.schema.schema_id()
    }

    /// Current schema snapshot.
    pub fn schema(&self) -> Arc<Schema> {
        self.inner.schema.snapshot()
    }

    /// Requests awaiting a response on the current instance.
    pub fn in_flight(&self) -> usize {
        self.inner
            .current()
            .map_or(0, |session| session.in_flight())
    }

    pub fn peer(&self) -> String {
        self.inner.connector.peer()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer())
            .field("state", &self.state())
            .field("schema_id", &self.schema_id())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.controller.set(ReconnectState::Closed);
        if let Some(session) = self.inner.take() {
            session.close();
        }
    }
}
