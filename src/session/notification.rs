//! Notification session: the new-broadcast watch connection.
//!
//! Logs into the alert API, resolves the watch server, then listens on a
//! single thread whose chat bodies are CSV triples
//! `broadcast,community,user` announcing broadcasts starting in followed
//! communities.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::account::Account;
use crate::api::LiveApi;
use crate::error::HubError;
use crate::transport::{TransportConnection, TransportEvent};

use super::wire;
use super::{CloseReason, NotificationItem, SessionEvent, SessionState};

/// Stateful client for the notification watch connection.
pub struct NotificationSession {
    cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
    disconnecting: AtomicBool,
    done: CancellationToken,
    /// Communities the logged-in user follows, from the admin response.
    communities: Vec<String>,
}

impl std::fmt::Debug for NotificationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationSession")
            .field("communities", &self.communities.len())
            .finish_non_exhaustive()
    }
}

impl NotificationSession {
    /// Logs into the alert API and returns the session ticket.
    ///
    /// An empty ticket from a successful login means the credentials
    /// belong to the wrong account kind ([`HubError::IncorrectAccount`]).
    pub async fn login(api: &dyn LiveApi, account: &Account) -> Result<String, HubError> {
        let ticket = api
            .notification_login(&account.mail, &account.password)
            .await?;
        if ticket.status != "ok" {
            return Err(HubError::Protocol(format!(
                "alert login status {:?}",
                ticket.status
            )));
        }
        if ticket.ticket.is_empty() {
            return Err(HubError::IncorrectAccount);
        }
        Ok(ticket.ticket)
    }

    /// Resolves the watch server for a ticket from [`Self::login`].
    pub async fn admin(
        api: &dyn LiveApi,
        ticket: &str,
    ) -> Result<crate::api::NotificationInfo, HubError> {
        api.notification_admin(ticket).await
    }

    /// Runs the login and admin steps, then opens the watch connection.
    pub async fn connect(
        api: Arc<dyn LiveApi>,
        account: Account,
        event_tx: UnboundedSender<SessionEvent>,
    ) -> Result<Arc<Self>, HubError> {
        let ticket = Self::login(api.as_ref(), &account).await?;
        let info = Self::admin(api.as_ref(), &ticket).await?;
        let addr = format!("{}:{}", info.addr, info.port);

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = TransportConnection::connect(&addr, transport_tx).await?;
        transport.send(&wire::build_thread_open(&info.thread)).await?;

        let cancel = CancellationToken::new();
        let consumer = Consumer {
            transport: Arc::clone(&transport),
            event_tx,
            transport_rx,
            cancel: cancel.clone(),
            state: SessionState::Connecting,
        };
        let handle = tokio::spawn(consumer.run());

        log::info!(
            "[Notif] Watching {} communities via {addr}",
            info.communities.len()
        );
        Ok(Arc::new(Self {
            cancel,
            consumer: Mutex::new(Some(handle)),
            disconnecting: AtomicBool::new(false),
            done: CancellationToken::new(),
            communities: info.communities,
        }))
    }

    /// Communities covered by this watch connection.
    pub fn communities(&self) -> &[String] {
        &self.communities
    }

    /// Closes the watch connection and joins the consumer. Idempotent.
    pub async fn disconnect(&self) -> Result<(), HubError> {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            self.done.cancelled().await;
            return Err(HubError::AlreadyDisconnecting);
        }

        self.cancel.cancel();
        if let Some(handle) = self.consumer.lock().await.take() {
            if let Err(e) = handle.await {
                log::warn!("[Notif] Consumer task panicked: {e}");
            }
        }
        self.done.cancel();
        log::info!("[Notif] Watch connection closed");
        Ok(())
    }
}

struct Consumer {
    transport: Arc<TransportConnection>,
    event_tx: UnboundedSender<SessionEvent>,
    transport_rx: UnboundedReceiver<TransportEvent>,
    cancel: CancellationToken,
    state: SessionState,
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
                        self.emit(SessionEvent::Err(HubError::Transport(
                            "alert server closed the connection".into(),
                        )));
                        break;
                    }
                },
            }
        }

        match self.transport.disconnect().await {
            Ok(()) | Err(HubError::AlreadyDisconnecting) => {}
            Err(e) => log::warn!("[Notif] Transport teardown: {e}"),
        }
        self.state = SessionState::Disconnected;
        self.emit(SessionEvent::Close(CloseReason::Requested));
    }

    fn emit(&self, event: SessionEvent) {
        if self.event_tx.send(event).is_err() {
            log::warn!("[Notif] Event consumer gone");
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
            "thread" => {
                self.state = SessionState::Open;
                self.emit(SessionEvent::Open(super::SessionSnapshot {
                    thread: el.attr("thread").to_string(),
                    block: 0,
                    server_offset: chrono::Duration::zero(),
                }));
            }
            "chat" => match parse_notification(&el.body) {
                Ok(item) => self.emit(SessionEvent::Notified(item)),
                Err(e) => self.emit(SessionEvent::Err(e)),
            },
            other => {
                self.emit(SessionEvent::Err(HubError::Protocol(format!(
                    "unexpected frame <{other}>"
                ))));
            }
        }
    }
}

/// Parses the `broadcast,community,user` body of a notification chat.
fn parse_notification(body: &str) -> Result<NotificationItem, HubError> {
    let mut parts = body.split(',');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(broadcast), Some(community), Some(user), None)
            if !broadcast.is_empty() && !community.is_empty() =>
        {
            Ok(NotificationItem {
                broadcast_id: broadcast.to_string(),
                community_id: community.to_string(),
                user_id: user.to_string(),
            })
        }
        _ => Err(HubError::Protocol(format!(
            "malformed notification body {body:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_notification_triple() {
        let item = parse_notification("12345,67890,100").unwrap();
        assert_eq!(item.broadcast_id, "12345");
        assert_eq!(item.community_id, "67890");
        assert_eq!(item.user_id, "100");
    }

    #[test]
    fn test_malformed_notification_bodies() {
        assert!(parse_notification("").is_err());
        assert!(parse_notification("only,two").is_err());
        assert!(parse_notification("a,b,c,d").is_err());
        assert!(parse_notification(",x,y").is_err());
    }
}
