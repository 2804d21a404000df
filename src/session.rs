//! One connection instance: handshake, request/response exchange, teardown.
//!
//! ```text
//!             ┌──────────────┐   mpsc    ┌──────────────┐
//! call() ────►│ PendingTable │──────────►│ Writer Task  │──► socket
//!    ▲        └──────┬───────┘           └──────────────┘
//!    │ oneshot       │ take(sync)
//!    │        ┌──────┴───────┐
//!    └────────│ Driver Task  │◄── socket (CoreProtocol + FrameBuffer)
//!             └──────────────┘
//! ```
//!
//! A session never comes back from `Broken`. When the driver stops, every
//! pending request fails with [`IprotoError::ConnectionLost`] and the state
//! watch flips to `Broken`; reconnecting builds a new session.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, ReadHalf};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::codec::{encode_request, EncodedRequest, Request, Response, SystemSpace};
use crate::error::{IprotoError, Result};
use crate::pending::PendingTable;
use crate::protocol::{
    ConnectionState, CoreProtocol, Credentials, Frame, Greeting, ProtocolEvent, ResponseHeader,
};
use crate::schema::Schema;
use crate::transport::{BoxedStream, Connector};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Read buffer size per connection.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Schema fetches retried when the schema changes between the two selects.
const SCHEMA_FETCH_ATTEMPTS: usize = 3;

/// Settings shared by every session of a connection.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub credentials: Option<Credentials>,
    pub max_payload_size: u32,
    pub connect_timeout: Duration,
    pub writer: WriterConfig,
}

pub(crate) struct Session {
    id: u64,
    greeting: Greeting,
    writer: WriterHandle,
    pending: Arc<PendingTable>,
    state: watch::Receiver<ConnectionState>,
    shutdown: Arc<Notify>,
}

impl Session {
    /// Open a stream and run the handshake, bounded by the connect timeout.
    pub(crate) async fn establish(
        connector: &dyn Connector,
        config: &SessionConfig,
        id: u64,
    ) -> Result<Arc<Self>> {
        let deadline = Instant::now() + config.connect_timeout;
        let attempt = async {
            let stream = connector.connect().await?;
            Self::handshake(stream, config, id).await
        };

        match timeout_at(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => {
                debug!(session = id, peer = %connector.peer(), "Connect timed out");
                Err(IprotoError::Timeout)
            }
        }
    }

    async fn handshake(stream: BoxedStream, config: &SessionConfig, id: u64) -> Result<Arc<Self>> {
        let (mut reader, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer.clone());

        let mut proto = CoreProtocol::new(config.credentials.clone(), config.max_payload_size);
        proto.connect()?;

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut ready = false;
        while !ready {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                proto.on_closed();
                return Err(IprotoError::ConnectionLost);
            }

            for event in proto.on_bytes(&buf[..n])? {
                match event {
                    ProtocolEvent::Greeting(greeting) => {
                        debug!(
                            session = id,
                            version = %greeting.version_string,
                            uuid = ?greeting.instance_uuid,
                            "Greeting received"
                        );
                    }
                    ProtocolEvent::Send(bytes) => writer.send(OutboundFrame::new(bytes)).await?,
                    ProtocolEvent::Ready => ready = true,
                    ProtocolEvent::Frame(_) => {
                        debug!(session = id, "Discarding frame received before any request")
                    }
                }
            }
        }

        let greeting = proto
            .greeting()
            .cloned()
            .ok_or_else(|| IprotoError::Protocol("Ready without a greeting".to_string()))?;

        let pending = Arc::new(PendingTable::new());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Ready);
        let shutdown = Arc::new(Notify::new());

        tokio::spawn(drive(
            id,
            proto,
            reader,
            buf,
            writer_task,
            pending.clone(),
            state_tx,
            shutdown.clone(),
        ));

        debug!(session = id, "Session ready");

        Ok(Arc::new(Self {
            id,
            greeting,
            writer,
            pending,
            state: state_rx,
            shutdown,
        }))
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    pub(crate) fn is_ready(&self) -> bool {
        *self.state.borrow() == ConnectionState::Ready
    }

    /// Number of requests awaiting a response.
    pub(crate) fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Send `request` and wait for its response.
    ///
    /// Name resolution happens against `schema` before anything is sent.
    /// On timeout the pending entry is dropped, so a late reply is ignored.
    pub(crate) async fn call(
        &self,
        request: &Request,
        schema: &Schema,
        deadline: Option<Instant>,
    ) -> Result<Response> {
        if !self.is_ready() {
            return Err(IprotoError::NotConnected);
        }

        let sync = self.pending.next_sync();
        let EncodedRequest { bytes, decoder } = encode_request(request, sync, schema)?;
        let completion = self.pending.register(sync, decoder, deadline)?;

        let exchange = async {
            self.writer.send(OutboundFrame::new(bytes)).await?;
            completion.await.unwrap_or(Err(IprotoError::ConnectionLost))
        };

        let result = match deadline {
            Some(deadline) => timeout_at(deadline, exchange)
                .await
                .unwrap_or(Err(IprotoError::Timeout)),
            None => exchange.await,
        };

        if result.is_err() && self.pending.remove(sync) {
            trace!(session = self.id, sync, "Dropped pending request");
        }
        result
    }

    /// Read `_vspace` and `_vindex` into a fresh snapshot.
    ///
    /// Both selects run concurrently; if they observe different schema ids
    /// the fetch is repeated.
    pub(crate) async fn fetch_schema(&self, deadline: Option<Instant>) -> Result<Schema> {
        let empty = Schema::empty();
        let spaces_request = Request::SchemaFetch(SystemSpace::Spaces);
        let indexes_request = Request::SchemaFetch(SystemSpace::Indexes);

        for attempt in 1..=SCHEMA_FETCH_ATTEMPTS {
            let (spaces, indexes) = tokio::try_join!(
                self.call(&spaces_request, &empty, deadline),
                self.call(&indexes_request, &empty, deadline),
            )?;

            if spaces.schema_id == indexes.schema_id {
                let schema =
                    Schema::from_rows(spaces.schema_id, spaces.tuples(), indexes.tuples());
                debug!(
                    session = self.id,
                    schema_id = ?schema.id(),
                    spaces = schema.len(),
                    "Schema fetched"
                );
                return Ok(schema);
            }

            debug!(session = self.id, attempt, "Schema changed during fetch");
        }

        Err(IprotoError::SchemaMismatch {
            message: "schema kept changing while it was fetched".to_string(),
        })
    }

    /// Ask the driver to tear the session down.
    pub(crate) fn close(&self) {
        self.shutdown.notify_one();
    }

    /// Wait until the session is `Broken`.
    pub(crate) async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Broken)
            .await;
    }
}

/// Owns the read half until the session ends, then fails what is left.
#[allow(clippy::too_many_arguments)]
async fn drive(
    id: u64,
    mut proto: CoreProtocol,
    mut reader: ReadHalf<BoxedStream>,
    mut buf: Vec<u8>,
    mut writer_task: JoinHandle<Result<()>>,
    pending: Arc<PendingTable>,
    state: watch::Sender<ConnectionState>,
    shutdown: Arc<Notify>,
) {
    let outcome = tokio::select! {
        result = read_loop(id, &mut proto, &mut reader, &mut buf, &pending) => result,
        result = &mut writer_task => match result {
            // Every writer handle dropped: the session object is gone.
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(IprotoError::Protocol(format!("writer task failed: {e}"))),
        },
        _ = shutdown.notified() => Ok(()),
    };

    proto.on_closed();
    writer_task.abort();

    match &outcome {
        Ok(()) => debug!(session = id, "Session closed"),
        Err(e) => warn!(session = id, error = %e, "Connection lost"),
    }

    let failed = pending.fail_all(|| IprotoError::ConnectionLost);
    if failed > 0 {
        debug!(session = id, failed, "Failed in-flight requests");
    }
    state.send_replace(ConnectionState::Broken);
}

async fn read_loop<R>(
    id: u64,
    proto: &mut CoreProtocol,
    reader: &mut R,
    buf: &mut [u8],
    pending: &PendingTable,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Err(IprotoError::ConnectionLost);
        }

        for event in proto.on_bytes(&buf[..n])? {
            if let ProtocolEvent::Frame(frame) = event {
                dispatch(id, &frame, pending)?;
            }
        }
    }
}

fn dispatch(id: u64, frame: &Frame, pending: &PendingTable) -> Result<()> {
    let mut body = frame.payload();
    let header = ResponseHeader::decode(&mut body)?;

    if header.is_chunk() {
        trace!(session = id, sync = header.sync, "Ignoring out-of-band push");
        return Ok(());
    }

    match pending.take(header.sync) {
        Some(request) => request.complete(header, body),
        None => debug!(
            session = id,
            sync = header.sync,
            "Discarding response for unknown or expired request"
        ),
    }
    Ok(())
}
