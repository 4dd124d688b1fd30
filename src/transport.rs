//! Framed TCP client for the comment protocol.
//!
//! One [`TransportConnection`] owns a TCP socket carrying NUL-terminated
//! text frames. A single receive task reads frames and forwards them on an
//! unbounded channel to the session's consumer loop; writes are serialized
//! behind an async mutex with a short deadline. Disconnect is idempotent
//! and synchronous: it cancels the connection token, closes the socket and
//! joins the receive task before returning, so callers can rely on all
//! resources being free afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{DIAL_TIMEOUT, FRAME_WRITE_TIMEOUT};
use crate::error::HubError;

/// Events emitted by the receive task.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete frame, NUL terminator stripped.
    Frame(String),
    /// A transient receive problem; the read loop keeps going.
    Error(HubError),
    /// The connection is gone (EOF, fatal read error, or cancellation).
    /// No further events follow.
    Closed,
}

/// A framed TCP connection to a comment or notification server.
pub struct TransportConnection {
    writer: Mutex<Option<OwnedWriteHalf>>,
    cancel: CancellationToken,
    read_handle: Mutex<Option<JoinHandle<()>>>,
    disconnecting: AtomicBool,
    /// Fires once teardown is complete; late disconnect callers wait on it.
    done: CancellationToken,
    peer: String,
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection")
            .field("peer", &self.peer)
            .field("disconnecting", &self.disconnecting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TransportConnection {
    /// Dials `addr` and starts the receive task.
    ///
    /// Frames and errors are delivered through `event_tx`; the channel is
    /// the only way the connection talks back to its owner.
    pub async fn connect(
        addr: &str,
        event_tx: UnboundedSender<TransportEvent>,
    ) -> Result<Arc<Self>, HubError> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| HubError::Transport(format!("dial {addr}: timed out")))?
            .map_err(|e| HubError::Transport(format!("dial {addr}: {e}")))?;

        let (read_half, write_half) = stream.into_split();
        let cancel = CancellationToken::new();

        let conn = Arc::new(Self {
            writer: Mutex::new(Some(write_half)),
            cancel: cancel.clone(),
            read_handle: Mutex::new(None),
            disconnecting: AtomicBool::new(false),
            done: CancellationToken::new(),
            peer: addr.to_string(),
        });

        let handle = tokio::spawn(Self::read_loop(
            addr.to_string(),
            read_half,
            event_tx,
            cancel,
        ));
        *conn.read_handle.lock().await = Some(handle);

        log::info!("[Transport] Connected to {addr}");
        Ok(conn)
    }

    /// Sends one frame, appending the NUL terminator.
    ///
    /// Writes are serialized; a write that exceeds the frame deadline or
    /// hits a closed socket returns a transport error.
    pub async fn send(&self, frame: &str) -> Result<(), HubError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(HubError::Closed);
        };

        let mut buf = Vec::with_capacity(frame.len() + 1);
        buf.extend_from_slice(frame.as_bytes());
        buf.push(0);

        tokio::time::timeout(FRAME_WRITE_TIMEOUT, writer.write_all(&buf))
            .await
            .map_err(|_| HubError::Transport(format!("write to {}: timed out", self.peer)))?
            .map_err(|e| HubError::Transport(format!("write to {}: {e}", self.peer)))
    }

    /// Closes the connection and joins the receive task.
    ///
    /// Idempotent: a concurrent second caller gets `AlreadyDisconnecting`,
    /// but only after teardown has finished — no caller returns while the
    /// receive task is still alive.
    pub async fn disconnect(&self) -> Result<(), HubError> {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            self.done.cancelled().await;
            return Err(HubError::AlreadyDisconnecting);
        }

        // Cancelling unblocks the read loop; shutting the write half closes
        // the socket underneath a blocked read.
        self.cancel.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        if let Some(handle) = self.read_handle.lock().await.take() {
            if let Err(e) = handle.await {
                log::warn!("[Transport] Receive task for {} panicked: {e}", self.peer);
            }
        }

        self.done.cancel();
        log::info!("[Transport] Disconnected from {}", self.peer);
        Ok(())
    }

    /// Receive task: reads NUL-terminated frames until EOF, a fatal error
    /// or cancellation.
    async fn read_loop(
        peer: String,
        read_half: OwnedReadHalf,
        event_tx: UnboundedSender<TransportEvent>,
        cancel: CancellationToken,
    ) {
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::with_capacity(4096);

        loop {
            buf.clear();
            let read = tokio::select! {
                () = cancel.cancelled() => break,
                read = read_until_nul(&mut reader, &mut buf) => read,
            };

            match read {
                Ok(0) => {
                    log::info!("[Transport] {peer} closed the connection");
                    break;
                }
                Ok(_) => {
                    // Strip the terminator; the protocol is text.
                    if buf.last() == Some(&0) {
                        buf.pop();
                    }
                    match String::from_utf8(std::mem::take(&mut buf)) {
                        Ok(frame) => {
                            if event_tx.send(TransportEvent::Frame(frame)).is_err() {
                                break; // Consumer gone.
                            }
                        }
                        Err(e) => {
                            // Bad encoding in one frame is transient; the
                            // stream remains aligned on NUL boundaries.
                            buf = e.into_bytes();
                            let _ = event_tx.send(TransportEvent::Error(HubError::Protocol(
                                format!("non-UTF-8 frame from {peer}"),
                            )));
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    let _ = event_tx.send(TransportEvent::Error(HubError::Transport(format!(
                        "read from {peer}: {e}"
                    ))));
                }
                Err(e) => {
                    log::error!("[Transport] Read error from {peer}: {e}");
                    break;
                }
            }
        }

        let _ = event_tx.send(TransportEvent::Closed);
        cancel.cancel();
    }
}

/// Reads bytes into `buf` until a NUL byte (inclusive). Returns the number
/// of bytes read; 0 means EOF.
async fn read_until_nul(
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    tokio::io::AsyncBufReadExt::read_until(reader, 0, buf).await
}
