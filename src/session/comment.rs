//! Comment session state machine.
//!
//! One `CommentSession` owns the live chat connection for a single
//! broadcast. All mutable session state (ticket, block counter, postkey,
//! timers) lives inside one consumer task that multiplexes cancellation,
//! transport frames, send requests and the heartbeat/postkey deadlines —
//! serializing every mutation without explicit locks. The public handle
//! only enqueues requests and drives disconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::account::Account;
use crate::api::{BroadcastStatus, LiveApi};
use crate::constants::{
    DISCONNECT_SENTINEL, HEARTBEAT_INTERVAL, POSTKEY_MAX_SENDS, POSTKEY_TTL,
};
use crate::error::HubError;
use crate::transport::{TransportConnection, TransportEvent};

use super::wire;
use super::{CloseReason, Comment, Deadline, SessionEvent, SessionSnapshot, SessionState};

/// A queued comment post.
#[derive(Debug)]
struct SendRequest {
    text: String,
    anonymous: bool,
    owner: bool,
}

/// Stateful client for the live chat connection of one broadcast.
pub struct CommentSession {
    req_tx: UnboundedSender<SendRequest>,
    cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
    disconnecting: AtomicBool,
    done: CancellationToken,
    broadcast_id: String,
}

impl std::fmt::Debug for CommentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommentSession")
            .field("broadcast_id", &self.broadcast_id)
            .finish_non_exhaustive()
    }
}

impl CommentSession {
    /// Opens the comment connection for `status` and starts the consumer.
    ///
    /// Requires an account with a login session and a broadcast with
    /// comment server info; events flow to `event_tx` until `disconnect`.
    pub async fn connect(
        api: Arc<dyn LiveApi>,
        account: Account,
        status: BroadcastStatus,
        event_tx: UnboundedSender<SessionEvent>,
    ) -> Result<Arc<Self>, HubError> {
        if status.broadcast_id.is_empty() {
            return Err(HubError::InvalidBroadcastId(String::new()));
        }
        if status.ms_thread.is_empty() || status.ms_addr.is_empty() {
            return Err(HubError::Protocol("broadcast has no comment server info".into()));
        }
        if !account.has_session() {
            return Err(HubError::NotLoggedIn);
        }

        let addr = format!("{}:{}", status.ms_addr, status.ms_port);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = TransportConnection::connect(&addr, transport_tx).await?;
        transport.send(&wire::build_thread_open(&status.ms_thread)).await?;

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let consumer = Consumer {
            api,
            account,
            status: status.clone(),
            transport: Arc::clone(&transport),
            event_tx,
            transport_rx,
            req_rx,
            cancel: cancel.clone(),
            heartbeat: Deadline::unarmed(),
            postkey_deadline: Deadline::unarmed(),
            state: SessionState::Connecting,
            ticket: String::new(),
            block: 0,
            server_offset: chrono::Duration::zero(),
            postkey: None,
            postkey_sends: 0,
            close_reason: CloseReason::Requested,
        };
        let handle = tokio::spawn(consumer.run());

        log::info!("[Comment] Session opened for {}", status.broadcast_id);
        Ok(Arc::new(Self {
            req_tx,
            cancel,
            consumer: Mutex::new(Some(handle)),
            disconnecting: AtomicBool::new(false),
            done: CancellationToken::new(),
            broadcast_id: status.broadcast_id,
        }))
    }

    /// Broadcast this session is attached to.
    pub fn broadcast_id(&self) -> &str {
        &self.broadcast_id
    }

    /// Enqueues a comment for posting.
    ///
    /// State is never touched here; the consumer task picks the request up
    /// and reports the outcome as `Send`/`SendError` events.
    pub fn send_comment(&self, text: &str, anonymous: bool, owner: bool) -> Result<(), HubError> {
        self.req_tx
            .send(SendRequest {
                text: text.to_string(),
                anonymous,
                owner,
            })
            .map_err(|_| HubError::Closed)
    }

    /// Stops the timers, closes the transport and joins the consumer.
    ///
    /// Idempotent; a concurrent second caller gets `AlreadyDisconnecting`
    /// once teardown has finished. The consumer emits the final `Close`
    /// event before this returns.
    pub async fn disconnect(&self) -> Result<(), HubError> {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            self.done.cancelled().await;
            return Err(HubError::AlreadyDisconnecting);
        }

        self.cancel.cancel();
        if let Some(handle) = self.consumer.lock().await.take() {
            if let Err(e) = handle.await {
                log::warn!("[Comment] Consumer task panicked: {e}");
            }
        }
        self.done.cancel();
        log::info!("[Comment] Session closed for {}", self.broadcast_id);
        Ok(())
    }
}

/// The consumer task: sole owner of all mutable session state.
struct Consumer {
    api: Arc<dyn LiveApi>,
    account: Account,
    status: BroadcastStatus,
    transport: Arc<TransportConnection>,
    event_tx: UnboundedSender<SessionEvent>,
    transport_rx: UnboundedReceiver<TransportEvent>,
    req_rx: UnboundedReceiver<SendRequest>,
    cancel: CancellationToken,
    heartbeat: Deadline,
    postkey_deadline: Deadline,
    state: SessionState,
    ticket: String,
    /// Comment block counter; never decreases.
    block: u64,
    /// Server clock minus local clock, applied when computing `vpos`.
    server_offset: chrono::Duration,
    postkey: Option<String>,
    postkey_sends: u32,
    close_reason: CloseReason,
}

impl Consumer {
    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                ev = self.transport_rx.recv() => match ev {
                    Some(TransportEvent::Frame(frame)) => self.handle_frame(&frame),
                    Some(TransportEvent::Error(e)) => self.emit(SessionEvent::Err(e)),
                    Some(TransportEvent::Closed) | None => {
                        if self.close_reason == CloseReason::Requested {
                            self.emit(SessionEvent::Err(HubError::Transport(
                                "comment server closed the connection".into(),
                            )));
                        }
                        break;
                    }
                },
                req = self.req_rx.recv() => match req {
                    Some(req) => self.handle_send(req).await,
                    None => break,
                },
                () = self.heartbeat.fired() => self.handle_heartbeat().await,
                () = self.postkey_deadline.fired() => {
                    // Key expired; the next send fetches a fresh one.
                    self.postkey = None;
                },
            }
        }

        // Teardown: timers off, socket closed, exactly one Close event.
        self.heartbeat.disarm();
        self.postkey_deadline.disarm();
        match self.transport.disconnect().await {
            Ok(()) | Err(HubError::AlreadyDisconnecting) => {}
            Err(e) => log::warn!("[Comment] Transport teardown: {e}"),
        }
        self.state = SessionState::Disconnected;
        self.emit(SessionEvent::Close(self.close_reason));
    }

    fn emit(&self, event: SessionEvent) {
        if self.event_tx.send(event).is_err() {
            log::warn!("[Comment] Event consumer gone");
        }
    }

    fn handle_frame(&mut self, frame: &str) {
        let el = match wire::parse_frame(frame) {
            Ok(el) => el,
            Err(e) => {
                self.emit(SessionEvent::Err(HubError::Protocol(e.to_string())));
                return;
            }
        };

        match el.name.as_str() {
            "thread" => self.handle_thread_open(&el),
            "chat" => self.handle_chat(&el),
            "chat_result" => {
                let status = el.attr("status");
                if status == "0" {
                    self.emit(SessionEvent::Send);
                } else {
                    self.emit(SessionEvent::SendError(HubError::SendFailed(
                        status.to_string(),
                    )));
                }
            }
            other => {
                self.emit(SessionEvent::Err(HubError::Protocol(format!(
                    "unexpected frame <{other}>"
                ))));
            }
        }
    }

    fn handle_thread_open(&mut self, el: &wire::WireElement) {
        let last_res = el.attr_u64("last_res").unwrap_or(0);
        self.block = last_res / 10;
        self.ticket = el.attr("ticket").to_string();
        if let Some(server_time) = el.attr_u64("server_time") {
            self.server_offset =
                chrono::Duration::seconds(server_time as i64 - Utc::now().timestamp());
        }
        self.state = SessionState::Open;

        // First heartbeat fires immediately; the fetch result reschedules it.
        self.heartbeat.arm(std::time::Duration::from_secs(0));

        self.emit(SessionEvent::Open(SessionSnapshot {
            thread: self.status.ms_thread.clone(),
            block: self.block,
            server_offset: self.server_offset,
        }));
    }

    fn handle_chat(&mut self, el: &wire::WireElement) {
        let comment = match Comment::from_element(el) {
            Ok(c) => c,
            Err(e) => {
                self.emit(SessionEvent::Err(e));
                return;
            }
        };

        self.block = self.block.max(comment.no / 10);

        let ends_broadcast = comment.is_command && comment.text == DISCONNECT_SENTINEL;
        self.emit(SessionEvent::Got(comment));

        if ends_broadcast {
            // The server is done with us; tear down after the current
            // event settles rather than mid-frame.
            self.close_reason = CloseReason::BroadcastEnded;
            self.cancel.cancel();
        }
    }

    async fn handle_send(&mut self, req: SendRequest) {
        if self.state != SessionState::Open {
            self.emit(SessionEvent::SendError(HubError::Closed));
            return;
        }

        if self.postkey.is_none() {
            match self
                .api
                .fetch_postkey(&self.account, &self.status.ms_thread, self.block)
                .await
            {
                Ok(key) => {
                    self.postkey = Some(key);
                    self.postkey_sends = 0;
                    self.postkey_deadline.arm(POSTKEY_TTL);
                }
                Err(e) => {
                    self.emit(SessionEvent::SendError(e));
                    return;
                }
            }
        }

        if self.postkey_sends >= POSTKEY_MAX_SENDS {
            self.emit(SessionEvent::SendError(HubError::RateLimited(format!(
                "{POSTKEY_MAX_SENDS} sends on one postkey"
            ))));
            return;
        }

        // vpos: centiseconds from broadcast open, on the server's clock.
        let now = Utc::now() + self.server_offset;
        let vpos = (now - self.status.open_time).num_milliseconds() / 10;

        let postkey = self.postkey.as_deref().unwrap_or_default();
        let frame = wire::build_chat(
            &self.status.ms_thread,
            &self.ticket,
            vpos,
            postkey,
            &self.account.user_id,
            &req.text,
            &wire::ChatOptions {
                anonymous: req.anonymous,
                owner: req.owner,
            },
        );

        match self.transport.send(&frame).await {
            Ok(()) => self.postkey_sends += 1,
            Err(e) => self.emit(SessionEvent::SendError(e)),
        }
    }

    async fn handle_heartbeat(&mut self) {
        match self
            .api
            .fetch_heartbeat(&self.account, &self.status.broadcast_id)
            .await
        {
            Ok(hb) => {
                let next = hb
                    .wait_time
                    .map_or(HEARTBEAT_INTERVAL, std::time::Duration::from_secs);
                self.heartbeat.arm(next);
                self.emit(SessionEvent::HeartbeatGot(hb));
            }
            Err(e) => {
                // Heartbeat failures never end the session; try again at
                // the fixed interval.
                self.heartbeat.arm(HEARTBEAT_INTERVAL);
                self.emit(SessionEvent::Err(e));
            }
        }
    }
}
