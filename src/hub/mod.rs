//! Orchestrator: owns the sessions, the account and the settings, and
//! bridges between protocol events and bus messages.
//!
//! The hub is single-task: one event loop selects over the quit signal,
//! messages routed from plugins, and events from the comment and
//! notification sessions. All hub state is therefore plain `&mut self`.

mod handlers;

use std::sync::Arc;

use regex::Regex;
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::account::Account;
use crate::api::{BroadcastStatus, LiveApi};
use crate::config::Settings;
use crate::constants::{USER_FETCH_LIMIT, USER_FETCH_WINDOW};
use crate::error::HubError;
use crate::plugin::{Message, DOMAIN_BROADCAST};
use crate::router::MessageRouter;
use crate::session::comment::CommentSession;
use crate::session::notification::NotificationSession;
use crate::session::{CloseReason, Comment, NotificationItem, SessionEvent};
use crate::user::{RollingLimiter, UserStore};

/// The orchestrator.
pub struct Hub {
    api: Arc<dyn LiveApi>,
    router: Arc<MessageRouter>,
    settings: Settings,
    account: Option<Account>,
    users: UserStore,
    fetch_limiter: RollingLimiter,

    comment_session: Option<Arc<CommentSession>>,
    current_broadcast: Option<BroadcastStatus>,
    publish_token: Option<String>,
    notification: Option<Arc<NotificationSession>>,

    session_tx: UnboundedSender<SessionEvent>,
    session_rx: UnboundedReceiver<SessionEvent>,
    notif_tx: UnboundedSender<SessionEvent>,
    notif_rx: UnboundedReceiver<SessionEvent>,

    /// Matches a broadcast or community id anywhere in user input.
    broadcast_re: Regex,
    /// Registered user ids are purely decimal; anything else is an
    /// anonymous (184) hash.
    registered_re: Regex,
}

impl Hub {
    pub fn new(
        api: Arc<dyn LiveApi>,
        router: Arc<MessageRouter>,
        settings: Settings,
        account: Option<Account>,
        users: UserStore,
    ) -> Self {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();
        Self {
            api,
            router,
            settings,
            account,
            users,
            fetch_limiter: RollingLimiter::new(USER_FETCH_LIMIT, USER_FETCH_WINDOW),
            comment_session: None,
            current_broadcast: None,
            publish_token: None,
            notification: None,
            session_tx,
            session_rx,
            notif_tx,
            notif_rx,
            broadcast_re: Regex::new(r"(lv|co)\d+").expect("static pattern"),
            registered_re: Regex::new(r"^\d+$").expect("static pattern"),
        }
    }

    /// Runs the hub event loop until `quit` fires, then tears the
    /// sessions down and returns the final settings for persistence.
    pub async fn run(
        mut self,
        mut hub_rx: UnboundedReceiver<Message>,
        quit: CancellationToken,
    ) -> Settings {
        log::info!("[Hub] Event loop started");
        loop {
            tokio::select! {
                () = quit.cancelled() => break,
                msg = hub_rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => break,
                },
                ev = self.session_rx.recv() => {
                    if let Some(ev) = ev {
                        self.handle_session_event(ev).await;
                    }
                },
                ev = self.notif_rx.recv() => {
                    if let Some(ev) = ev {
                        self.handle_notification_event(ev).await;
                    }
                },
            }
        }

        self.teardown_comment().await;
        self.teardown_notification().await;
        log::info!("[Hub] Event loop stopped");
        self.settings
    }

    /// Broadcasts a host event onto the bus.
    fn publish(&self, command: &str, content: serde_json::Value) {
        self.router
            .route(Message::internal(DOMAIN_BROADCAST, command, content));
    }

    fn notify_ui(&self, text: &str) {
        self.publish("UI.Notify", json!({ "text": text }));
    }

    async fn teardown_comment(&mut self) {
        self.publish_token = None;
        self.current_broadcast = None;
        if let Some(session) = self.comment_session.take() {
            match session.disconnect().await {
                Ok(()) | Err(HubError::AlreadyDisconnecting) => {}
                Err(e) => log::warn!("[Hub] Comment teardown: {e}"),
            }
        }
    }

    async fn teardown_notification(&mut self) {
        if let Some(session) = self.notification.take() {
            match session.disconnect().await {
                Ok(()) | Err(HubError::AlreadyDisconnecting) => {}
                Err(e) => log::warn!("[Hub] Notification teardown: {e}"),
            }
        }
    }

    /// Translates comment session events into bus messages.
    async fn handle_session_event(&mut self, ev: SessionEvent) {
        match ev {
            SessionEvent::Open(snapshot) => {
                let info = self.current_broadcast.as_ref().map_or_else(
                    || json!({ "thread": snapshot.thread }),
                    |b| {
                        json!({
                            "id": b.broadcast_id,
                            "title": b.title,
                            "community": b.community_id,
                            "owner": b.owner_name,
                            "thread": snapshot.thread,
                        })
                    },
                );
                self.publish("UI.Clear", serde_json::Value::Null);
                self.publish("Broad.Open", info);
            }
            SessionEvent::Got(comment) => {
                let content = self.comment_json(&comment);
                self.publish("Comment.Got", content);
            }
            SessionEvent::HeartbeatGot(hb) => {
                self.publish(
                    "Broad.Info",
                    json!({
                        "watch_count": hb.watch_count,
                        "comment_count": hb.comment_count,
                    }),
                );
            }
            SessionEvent::Send => self.publish("Comment.Sent", serde_json::Value::Null),
            SessionEvent::SendError(e) => {
                self.notify_ui(&format!("comment not sent: {e}"));
            }
            SessionEvent::Err(e) => self.notify_ui(&e.to_string()),
            SessionEvent::Close(reason) => {
                self.comment_session = None;
                self.current_broadcast = None;
                self.publish_token = None;
                let reason_text = match reason {
                    CloseReason::Requested => "requested",
                    CloseReason::BroadcastEnded => "ended",
                };
                self.publish("Broad.Close", json!({ "reason": reason_text }));
                if reason == CloseReason::BroadcastEnded {
                    self.notify_ui("broadcast ended");
                }
            }
            SessionEvent::Notified(_) => {}
        }
    }

    /// Translates notification session events; a new-broadcast item may
    /// trigger an automatic reconnect.
    async fn handle_notification_event(&mut self, ev: SessionEvent) {
        match ev {
            SessionEvent::Notified(item) => self.handle_notified(item).await,
            SessionEvent::Open(_) => {
                log::info!("[Hub] Notification watch open");
            }
            SessionEvent::Close(_) => {
                self.notification = None;
                self.notify_ui("notification watch closed");
            }
            SessionEvent::Err(e) => {
                log::warn!("[Hub] Notification: {e}");
            }
            _ => {}
        }
    }

    async fn handle_notified(&mut self, item: NotificationItem) {
        self.notify_ui(&format!(
            "broadcast lv{} started in co{}",
            item.broadcast_id, item.community_id
        ));

        let follow = self.settings.auto_follow_next
            && self
                .current_broadcast
                .as_ref()
                .is_some_and(|b| b.community_id.trim_start_matches("co")
                    == item.community_id.trim_start_matches("co"));
        if follow {
            let id = format!("lv{}", item.broadcast_id.trim_start_matches("lv"));
            log::info!("[Hub] Following community broadcast to {id}");
            self.connect_broadcast(&id).await;
        }
    }

    /// Bus payload for a comment, enriched with the cached display name.
    fn comment_json(&self, comment: &Comment) -> serde_json::Value {
        let name = self
            .users
            .get(&comment.user_id)
            .map(|r| r.name.clone())
            .unwrap_or_default();
        json!({
            "no": comment.no,
            "date": comment.date.to_rfc3339(),
            "user_id": comment.user_id,
            "name": name,
            "premium": comment.is_premium,
            "command": comment.is_command,
            "staff": comment.is_staff,
            "anonymous": comment.is_anonymous,
            "mail": comment.mail,
            "score": comment.score,
            "text": comment.text,
        })
    }
}
