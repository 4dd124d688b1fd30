//! Protocol session engine.
//!
//! Two stateful clients share this module: [`comment::CommentSession`] for
//! the live chat connection and [`notification::NotificationSession`] for
//! the new-broadcast watch connection. Both ride on
//! [`crate::transport::TransportConnection`] and report everything that
//! happens through [`SessionEvent`]s consumed by the hub.

pub mod comment;
pub mod notification;
pub mod wire;

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};

use crate::api::HeartbeatStatus;
use crate::error::HubError;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No connection.
    #[default]
    Disconnected,
    /// Transport dialed, open-thread response pending.
    Connecting,
    /// Open-thread response received; comments flow.
    Open,
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A local disconnect request.
    Requested,
    /// The server announced the end of the broadcast.
    BroadcastEnded,
}

/// Snapshot of a comment session at open time, carried on the Open event.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Comment thread id.
    pub thread: String,
    /// Block counter derived from the last comment number.
    pub block: u64,
    /// Server clock minus local clock.
    pub server_offset: chrono::Duration,
}

/// An item from the notification watch connection: a newly started
/// broadcast in a followed community.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationItem {
    /// Broadcast id (`lv…`).
    pub broadcast_id: String,
    /// Community id (`co…`).
    pub community_id: String,
    /// Broadcaster user id.
    pub user_id: String,
}

/// Everything a session reports to the hub.
#[derive(Debug)]
pub enum SessionEvent {
    /// The session reached the Open state.
    Open(SessionSnapshot),
    /// The session closed.
    Close(CloseReason),
    /// A comment arrived.
    Got(Comment),
    /// A new-broadcast notification arrived (notification session only).
    Notified(NotificationItem),
    /// A posted comment was accepted by the server.
    Send,
    /// A posted comment was rejected, or failed before reaching the wire.
    SendError(HubError),
    /// A heartbeat fetch succeeded.
    HeartbeatGot(HeartbeatStatus),
    /// A non-fatal session error; the connection stays up.
    Err(HubError),
}

/// A live chat comment, parsed once from a wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    /// Sequence number within the thread.
    pub no: u64,
    /// Post time.
    pub date: DateTime<Utc>,
    /// Commenter user id.
    pub user_id: String,
    /// Premium account flag (`premium` bit 0).
    pub is_premium: bool,
    /// Operator/command comment flag (`premium` bit 1).
    pub is_command: bool,
    /// Staff comment flag (`premium` bit 2).
    pub is_staff: bool,
    /// Anonymous (184) comment flag.
    pub is_anonymous: bool,
    /// Raw mail (command) attribute.
    pub mail: String,
    /// Locale attribute.
    pub locale: String,
    /// NG score, zero or negative.
    pub score: i64,
    /// Comment text.
    pub text: String,
}

impl Comment {
    /// Decodes a parsed `<chat>` element into a comment.
    ///
    /// The `premium` attribute is a 3-bit flag field:
    ///
    /// | bit | meaning    |
    /// |-----|------------|
    /// | 0   | IsPremium  |
    /// | 1   | IsCommand  |
    /// | 2   | IsStaff    |
    ///
    /// `anonymity` parses as a boolean (`"1"`/`"true"` → anonymous).
    pub fn from_element(el: &wire::WireElement) -> Result<Self, HubError> {
        let no = el
            .attr_u64("no")
            .ok_or_else(|| HubError::Protocol("chat frame without no".into()))?;
        let date_secs = el
            .attr_u64("date")
            .ok_or_else(|| HubError::Protocol("chat frame without date".into()))?;
        let date_usec = el.attr_u64("date_usec").unwrap_or(0);
        let date = Utc
            .timestamp_opt(date_secs as i64, (date_usec as u32) * 1000)
            .single()
            .ok_or_else(|| HubError::Protocol("chat date out of range".into()))?;

        let premium = el.attr_u64("premium").unwrap_or(0);
        let anonymity = matches!(el.attr("anonymity"), "1" | "true");

        Ok(Self {
            no,
            date,
            user_id: el.attr("user_id").to_string(),
            is_premium: premium & 0b001 != 0,
            is_command: premium & 0b010 != 0,
            is_staff: premium & 0b100 != 0,
            is_anonymous: anonymity,
            mail: el.attr("mail").to_string(),
            locale: el.attr("locale").to_string(),
            score: el
                .attrs
                .get("score")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            text: el.body.clone(),
        })
    }
}

/// An armable one-shot deadline for `select!` loops.
///
/// Wraps `tokio::time::Sleep` so session consumer tasks can carry their
/// heartbeat and postkey timers as plain struct fields: `fired()` resolves
/// when an armed deadline elapses and pends forever while disarmed, which
/// makes it safe to poll unconditionally in a `select!` arm.
#[derive(Debug)]
pub struct Deadline {
    sleep: Pin<Box<tokio::time::Sleep>>,
    armed: bool,
}

impl Deadline {
    /// Creates a disarmed deadline.
    pub fn unarmed() -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(Duration::from_secs(0))),
            armed: false,
        }
    }

    /// Arms the deadline to fire after `after`.
    pub fn arm(&mut self, after: Duration) {
        self.arm_at(Instant::now() + after);
    }

    /// Arms the deadline to fire at `at`.
    pub fn arm_at(&mut self, at: Instant) {
        self.sleep.as_mut().reset(tokio::time::Instant::from_std(at));
        self.armed = true;
    }

    /// Disarms the deadline; `fired()` pends until re-armed.
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Whether the deadline is currently armed.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Resolves when the armed deadline elapses; pends forever if disarmed.
    ///
    /// The deadline disarms itself on firing, so a `select!` loop that does
    /// not re-arm it will not busy-spin.
    pub fn fired(&mut self) -> impl Future<Output = ()> + '_ {
        let armed = self.armed;
        let sleep = self.sleep.as_mut();
        let armed_flag = &mut self.armed;
        async move {
            if !armed {
                std::future::pending::<()>().await;
            }
            sleep.await;
            *armed_flag = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn chat_element(premium: &str, anonymity: &str) -> wire::WireElement {
        let mut attrs = HashMap::new();
        attrs.insert("no".to_string(), "25286041".to_string());
        attrs.insert("date".to_string(), "1500000300".to_string());
        attrs.insert("date_usec".to_string(), "500000".to_string());
        attrs.insert("user_id".to_string(), "100".to_string());
        attrs.insert("premium".to_string(), premium.to_string());
        attrs.insert("anonymity".to_string(), anonymity.to_string());
        attrs.insert("score".to_string(), "-10".to_string());
        wire::WireElement {
            name: "chat".to_string(),
            attrs,
            body: "hello".to_string(),
        }
    }

    #[test]
    fn test_premium_bitfield_decoding() {
        // premium="5" is binary 101: premium + staff, not command.
        let c = Comment::from_element(&chat_element("5", "0")).unwrap();
        assert!(c.is_premium);
        assert!(!c.is_command);
        assert!(c.is_staff);

        let c = Comment::from_element(&chat_element("2", "0")).unwrap();
        assert!(!c.is_premium);
        assert!(c.is_command);
        assert!(!c.is_staff);

        let c = Comment::from_element(&chat_element("0", "0")).unwrap();
        assert!(!c.is_premium && !c.is_command && !c.is_staff);
    }

    #[test]
    fn test_anonymity_parses_as_boolean() {
        assert!(Comment::from_element(&chat_element("0", "1")).unwrap().is_anonymous);
        assert!(Comment::from_element(&chat_element("0", "true")).unwrap().is_anonymous);
        assert!(!Comment::from_element(&chat_element("0", "0")).unwrap().is_anonymous);
        assert!(!Comment::from_element(&chat_element("0", "")).unwrap().is_anonymous);
    }

    #[test]
    fn test_missing_no_is_protocol_error() {
        let mut el = chat_element("0", "0");
        el.attrs.remove("no");
        assert!(matches!(
            Comment::from_element(&el),
            Err(HubError::Protocol(_))
        ));
    }

    #[test]
    fn test_date_usec_carried_into_timestamp() {
        let c = Comment::from_element(&chat_element("0", "0")).unwrap();
        assert_eq!(c.date.timestamp(), 1_500_000_300);
        assert_eq!(c.date.timestamp_subsec_micros(), 500_000);
        assert_eq!(c.score, -10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_arm_fire_disarm() {
        let mut deadline = Deadline::unarmed();
        assert!(!deadline.is_armed());

        deadline.arm(Duration::from_secs(5));
        assert!(deadline.is_armed());

        tokio::time::timeout(Duration::from_secs(10), deadline.fired())
            .await
            .expect("armed deadline should fire");
        assert!(!deadline.is_armed());

        // Disarmed deadline pends.
        let pended = tokio::time::timeout(Duration::from_secs(10), deadline.fired()).await;
        assert!(pended.is_err(), "disarmed deadline must not fire");
    }
}
