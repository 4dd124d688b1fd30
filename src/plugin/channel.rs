//! Per-plugin duplex adapter.
//!
//! A [`PluginChannel`] owns the two tasks behind one plugin connection:
//! a decode loop turning the byte stream into [`Message`]s for the bus,
//! and a core loop that batches outbound writes behind a short coalescing
//! delay. The transport is a boxed reader/writer pair so TCP sockets and
//! child stdio plug in identically.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, Receiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{PLUGIN_FLUSH_DELAY, PLUGIN_QUEUE_CAPACITY};
use crate::session::Deadline;

use super::message::{self, Message, DOMAIN_DIRECT};
use super::BusEvent;

/// Lifecycle state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Transport ended or never opened. Terminal.
    Closed,
    /// Receiving routed messages.
    Enabled,
    /// Connected but excluded from routing.
    Disabled,
}

/// Reader half of a plugin transport.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
/// Writer half of a plugin transport.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle to one connected plugin.
pub struct PluginChannel {
    slot: usize,
    name: String,
    subscriptions: HashSet<String>,
    enabled: AtomicBool,
    closed: AtomicBool,
    out_tx: mpsc::Sender<Message>,
    ctrl_tx: UnboundedSender<bool>,
    quit: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PluginChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginChannel")
            .field("slot", &self.slot)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PluginChannel {
    /// Starts the decode and core loops over an open transport.
    ///
    /// Inbound messages and the closed sentinel are delivered to
    /// `event_tx`; the returned handle is what the router holds in its
    /// registry slot.
    pub fn open(
        slot: usize,
        name: &str,
        subscriptions: impl IntoIterator<Item = String>,
        reader: BoxReader,
        writer: BoxWriter,
        initially_enabled: bool,
        event_tx: UnboundedSender<BusEvent>,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(PLUGIN_QUEUE_CAPACITY);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let quit = CancellationToken::new();

        let channel = Arc::new(Self {
            slot,
            name: name.to_string(),
            subscriptions: subscriptions.into_iter().collect(),
            enabled: AtomicBool::new(initially_enabled),
            closed: AtomicBool::new(false),
            out_tx,
            ctrl_tx,
            quit: quit.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let decode = tokio::spawn(decode_loop(
            slot,
            name.to_string(),
            reader,
            event_tx.clone(),
            quit.clone(),
        ));
        let core = tokio::spawn(
            CoreLoop {
                slot,
                name: name.to_string(),
                writer,
                out_rx,
                ctrl_rx,
                quit,
                flush: Deadline::unarmed(),
                pending: Vec::new(),
                event_tx,
            }
            .run(),
        );

        if let Ok(mut tasks) = channel.tasks.try_lock() {
            tasks.push(decode);
            tasks.push(core);
        }
        channel
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PluginState {
        if self.closed.load(Ordering::SeqCst) {
            PluginState::Closed
        } else if self.enabled.load(Ordering::SeqCst) {
            PluginState::Enabled
        } else {
            PluginState::Disabled
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == PluginState::Enabled
    }

    /// Whether this plugin subscribed to `domain` at registration.
    pub fn subscribes_to(&self, domain: &str) -> bool {
        self.subscriptions.contains(domain)
    }

    /// Queues a message for this plugin's wire.
    ///
    /// The queue is bounded; when the plugin cannot keep up the message
    /// is dropped here rather than stalling the router.
    pub fn try_send(&self, msg: Message) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.out_tx.try_send(msg) {
            log::debug!("[Plugin] {} queue full, dropping: {e}", self.name);
        }
    }

    /// Flips the enable state; the plugin is told its new state over the
    /// direct domain.
    pub fn set_enabled(&self, enabled: bool) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled && self.ctrl_tx.send(enabled).is_err() {
            log::warn!("[Plugin] {} core loop gone", self.name);
        }
    }

    /// Marks the channel closed once its transport ended.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Stops both tasks and joins them.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.quit.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("[Plugin] {} task panicked: {e}", self.name);
            }
        }
    }
}

/// Reads newline-delimited JSON off the plugin's wire.
///
/// EOF, a read error or a decode error all end the plugin: the loop sends
/// the closed sentinel and exits.
async fn decode_loop(
    slot: usize,
    name: String,
    reader: BoxReader,
    event_tx: UnboundedSender<BusEvent>,
    quit: CancellationToken,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            () = quit.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match message::decode_line(&line, slot) {
                        Ok(msg) => {
                            if event_tx.send(BusEvent::Inbound(msg)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            log::warn!("[Plugin] {name} sent garbage: {e:#}");
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("[Plugin] {name} read failed: {e}");
                    break;
                }
            },
        }
    }
    let _ = event_tx.send(BusEvent::ChannelClosed(slot));
}

/// The write side: batches queued messages and flushes them together.
struct CoreLoop {
    slot: usize,
    name: String,
    writer: BoxWriter,
    out_rx: Receiver<Message>,
    ctrl_rx: mpsc::UnboundedReceiver<bool>,
    quit: CancellationToken,
    flush: Deadline,
    pending: Vec<Message>,
    event_tx: UnboundedSender<BusEvent>,
}

impl CoreLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.quit.cancelled() => break,
                msg = self.out_rx.recv() => match msg {
                    Some(msg) => self.enqueue(msg),
                    None => break,
                },
                ctrl = self.ctrl_rx.recv() => match ctrl {
                    Some(enabled) => {
                        let command = if enabled { "Enabled" } else { "Disabled" };
                        self.enqueue(Message::internal(
                            DOMAIN_DIRECT,
                            command,
                            serde_json::Value::Null,
                        ));
                    }
                    None => break,
                },
                () = self.flush.fired() => {
                    if !self.write_pending().await {
                        let _ = self.event_tx.send(BusEvent::ChannelClosed(self.slot));
                        return;
                    }
                },
            }
        }

        // Drain whatever is still queued before dropping the writer.
        self.flush.disarm();
        while let Ok(msg) = self.out_rx.try_recv() {
            self.pending.push(msg);
        }
        let _ = self.write_pending().await;
        let _ = self.writer.shutdown().await;
    }

    fn enqueue(&mut self, msg: Message) {
        self.pending.push(msg);
        if !self.flush.is_armed() {
            self.flush.arm(PLUGIN_FLUSH_DELAY);
        }
    }

    /// Writes all pending lines in one burst. Returns false when the
    /// transport is gone.
    async fn write_pending(&mut self) -> bool {
        let mut batch = String::new();
        for msg in self.pending.drain(..) {
            match message::encode_line(&msg) {
                Ok(line) => batch.push_str(&line),
                Err(e) => log::warn!("[Plugin] {} unencodable message: {e:#}", self.name),
            }
        }
        if batch.is_empty() {
            return true;
        }
        if let Err(e) = self.writer.write_all(batch.as_bytes()).await {
            log::warn!("[Plugin] {} write failed: {e}", self.name);
            return false;
        }
        if let Err(e) = self.writer.flush().await {
            log::warn!("[Plugin] {} flush failed: {e}", self.name);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn open_over_duplex(
        slot: usize,
        enabled: bool,
    ) -> (
        Arc<PluginChannel>,
        tokio::io::DuplexStream,
        mpsc::UnboundedReceiver<BusEvent>,
    ) {
        let (host_side, plugin_side) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(host_side);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let channel = PluginChannel::open(
            slot,
            "test-plugin",
            vec!["nicohub".to_string()],
            Box::new(read_half),
            Box::new(write_half),
            enabled,
            event_tx,
        );
        (channel, plugin_side, event_rx)
    }

    #[tokio::test]
    async fn test_inbound_lines_decoded_to_bus() {
        let (channel, mut plugin_side, mut event_rx) = open_over_duplex(1, true);

        plugin_side
            .write_all(b"{\"domain\":\"nicohub\",\"command\":\"Ping\",\"content\":1}\n")
            .await
            .unwrap();

        match event_rx.recv().await.unwrap() {
            BusEvent::Inbound(msg) => {
                assert_eq!(msg.command, "Ping");
                assert_eq!(msg.source, super::super::message::Source::Plugin(1));
            }
            other => panic!("unexpected event {other:?}"),
        }
        channel.close().await;
    }

    #[tokio::test]
    async fn test_outbound_messages_coalesce_into_one_write() {
        let (channel, mut plugin_side, _event_rx) = open_over_duplex(1, true);

        channel.try_send(Message::internal("nicohub", "A", json!(1)));
        channel.try_send(Message::internal("nicohub", "B", json!(2)));

        let mut buf = vec![0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(2), plugin_side.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert_eq!(text.matches('\n').count(), 2, "both lines in one burst: {text:?}");
        channel.close().await;
    }

    #[tokio::test]
    async fn test_eof_sends_closed_sentinel() {
        let (channel, plugin_side, mut event_rx) = open_over_duplex(3, true);
        drop(plugin_side);

        let ev = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(ev, BusEvent::ChannelClosed(3)));
        channel.close().await;
    }

    #[tokio::test]
    async fn test_state_change_notifies_plugin_directly() {
        let (channel, mut plugin_side, _event_rx) = open_over_duplex(1, true);
        assert_eq!(channel.state(), PluginState::Enabled);

        channel.set_enabled(false);
        assert_eq!(channel.state(), PluginState::Disabled);

        let mut buf = vec![0u8; 512];
        let n = tokio::time::timeout(Duration::from_secs(2), plugin_side.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("\"nicohub_direct\""));
        assert!(text.contains("\"Disabled\""));
        channel.close().await;
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let (channel, _plugin_side, _event_rx) = open_over_duplex(1, false);
        channel.close().await;
        assert_eq!(channel.state(), PluginState::Closed);
        // No effect after close.
        channel.set_enabled(true);
        assert_eq!(channel.state(), PluginState::Closed);
    }
}
