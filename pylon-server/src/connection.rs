//! One client connection: a read loop feeding the dispatcher and a writer
//! task draining the outbox.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pylon_mtproto::Handshake;
use pylon_mtproto::transport::{self, AcceptOptions, FrameReader, FrameWriter};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::context::ServerState;
use crate::dispatch::{self, Disposition};
use crate::errors::{Result, ServerError};

/// How long a client may take to send the transport header.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Something for the writer task to put on the wire.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Frame(Vec<u8>),
    TransportError(i32),
}

/// Per-connection state shared by the read loop and every task it spawns.
pub struct Connection {
    server: Arc<ServerState>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    closed: CancellationToken,
    handshake: tokio::sync::Mutex<Handshake>,
    /// The auth key of the first encrypted message.
    bound_key: Mutex<Option<u64>>,
    /// Content-related messages sent so far, per session.
    sequences: Mutex<HashMap<i64, i32>>,
    /// RPC tasks still running, by request message id.
    running: Mutex<HashMap<i64, AbortHandle>>,
    disconnect_timer: Mutex<Option<AbortHandle>>,
}

impl Connection {
    pub(crate) fn new(server: Arc<ServerState>, outbox: mpsc::UnboundedSender<Outgoing>, closed: CancellationToken) -> Self {
        Self {
            server,
            outbox,
            closed,
            handshake: tokio::sync::Mutex::new(Handshake::new()),
            bound_key: Mutex::new(None),
            sequences: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            disconnect_timer: Mutex::new(None),
        }
    }

    pub fn server(&self) -> &Arc<ServerState> {
        &self.server
    }

    pub(crate) fn handshake(&self) -> &tokio::sync::Mutex<Handshake> {
        &self.handshake
    }

    pub fn bound_key(&self) -> Option<u64> {
        *self.bound_key.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds the connection to `key_id`, or checks it matches the bound key.
    pub(crate) fn bind_key(&self, key_id: u64) -> Result<()> {
        let mut bound = self.bound_key.lock().unwrap_or_else(PoisonError::into_inner);
        match *bound {
            Some(id) if id != key_id => Err(ServerError::AuthKeyMismatch { bound: id, got: key_id }),
            Some(_) => Ok(()),
            None => {
                *bound = Some(key_id);
                Ok(())
            }
        }
    }

    /// Odd and counting for content-related messages, even otherwise.
    pub(crate) fn next_seq_no(&self, session_id: i64, content_related: bool) -> i32 {
        let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = sequences.entry(session_id).or_insert(0);
        if content_related {
            *sent += 1;
            *sent * 2 - 1
        } else {
            *sent * 2
        }
    }

    pub(crate) fn push(&self, frame: Vec<u8>) -> Result<()> {
        self.outbox.send(Outgoing::Frame(frame)).map_err(|_| ServerError::Closed)
    }

    pub(crate) fn push_transport_error(&self, code: i32) -> Result<()> {
        self.outbox.send(Outgoing::TransportError(code)).map_err(|_| ServerError::Closed)
    }

    /// Stops the read loop. Frames already queued are still written.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn track_rpc(&self, msg_id: i64, handle: AbortHandle) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.retain(|_, h| !h.is_finished());
        if !handle.is_finished() {
            running.insert(msg_id, handle);
        }
    }

    pub(crate) fn finish_rpc(&self, msg_id: i64) {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).remove(&msg_id);
    }

    /// Aborts the RPC answering `msg_id`. Returns whether one was running.
    pub(crate) fn drop_rpc(&self, msg_id: i64) -> bool {
        let handle = self.running.lock().unwrap_or_else(PoisonError::into_inner).remove(&msg_id);
        match handle {
            Some(h) if !h.is_finished() => {
                h.abort();
                true
            }
            _ => false,
        }
    }

    /// Closes the connection after `delay` unless called again first.
    /// A zero delay cancels the timer.
    pub(crate) fn delay_disconnect(&self, delay: Duration) {
        let mut timer = self.disconnect_timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        if delay.is_zero() {
            return;
        }
        let closed = self.closed.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::debug!("[pylon] disconnect delay elapsed");
            closed.cancel();
        });
        *timer = Some(task.abort_handle());
    }

    fn abort_all(&self) {
        for (_, handle) in self.running.lock().unwrap_or_else(PoisonError::into_inner).drain() {
            handle.abort();
        }
        if let Some(timer) = self.disconnect_timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.abort();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("bound_key", &self.bound_key())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Serves one stream until the client leaves, a fatal error occurs or
/// `shutdown` fires.
pub async fn serve<S>(server: Arc<ServerState>, stream: S, options: &AcceptOptions, shutdown: CancellationToken) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (reader, writer) = tokio::time::timeout(ACCEPT_TIMEOUT, transport::accept(read_half, write_half, options))
        .await
        .map_err(|_| ServerError::Io(std::io::ErrorKind::TimedOut.into()))??;

    let (tx, rx) = mpsc::unbounded_channel();
    let closed = shutdown.child_token();
    let conn = Arc::new(Connection::new(server, tx, closed.clone()));
    let writer_task = tokio::spawn(write_loop(writer, rx, closed));

    let outcome = read_loop(&conn, reader).await;
    conn.close();
    conn.abort_all();
    match writer_task.await {
        Ok(Err(e)) => tracing::debug!("[pylon] writer stopped: {e}"),
        Err(e) => tracing::warn!("[pylon] writer task failed: {e}"),
        Ok(Ok(())) => {}
    }
    outcome
}

async fn read_loop<R: AsyncRead + Unpin>(conn: &Arc<Connection>, mut reader: FrameReader<R>) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = conn.closed.cancelled() => return Ok(()),
            frame = reader.read_frame() => frame?,
        };
        let Some(frame) = frame else {
            tracing::debug!("[pylon] client closed the connection");
            return Ok(());
        };
        if dispatch::handle_frame(conn, frame).await == Disposition::Close {
            return Ok(());
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    closed: CancellationToken,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            biased;
            next = rx.recv() => next,
            _ = closed.cancelled() => break,
        };
        let Some(out) = next else { break };
        write_one(&mut writer, out).await?;
    }
    while let Ok(out) = rx.try_recv() {
        write_one(&mut writer, out).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

async fn write_one<W: AsyncWrite + Unpin>(writer: &mut FrameWriter<W>, out: Outgoing) -> Result<()> {
    match out {
        Outgoing::Frame(frame) => writer.write_frame(&frame).await?,
        Outgoing::TransportError(code) => writer.write_transport_error(code).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pylon_mtproto::Stores;
    use pylon_mtproto::store::RsaKeyRing;

    use super::*;
    use crate::registry::RpcRegistry;

    fn connection() -> Connection {
        let state = ServerState::new(Stores::in_memory(RsaKeyRing::default()), None, RpcRegistry::new()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        Connection::new(Arc::new(state), tx, CancellationToken::new())
    }

    #[test]
    fn seq_numbers_per_session() {
        let conn = connection();
        assert_eq!(conn.next_seq_no(1, false), 0);
        assert_eq!(conn.next_seq_no(1, true), 1);
        assert_eq!(conn.next_seq_no(1, true), 3);
        assert_eq!(conn.next_seq_no(1, false), 4);
        assert_eq!(conn.next_seq_no(2, true), 1);
    }

    #[test]
    fn key_binding_is_sticky() {
        let conn = connection();
        assert_eq!(conn.bound_key(), None);
        conn.bind_key(7).unwrap();
        conn.bind_key(7).unwrap();
        assert!(matches!(conn.bind_key(8), Err(ServerError::AuthKeyMismatch { bound: 7, got: 8 })));
    }
}
