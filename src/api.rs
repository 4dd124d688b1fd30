//! Typed interface to the platform's web API.
//!
//! The orchestrator never talks HTTP directly; it calls the [`LiveApi`]
//! trait, which models each one-shot GET/POST helper as a typed
//! request/response function. [`HttpLiveApi`] is the production
//! implementation backed by a shared `reqwest` client; tests substitute
//! their own implementation to drive sessions without a network.
//!
//! Response bodies on this platform are small ad-hoc XML documents; the
//! scanner in [`tag_text`] pulls out the handful of leaf values we need
//! without a DOM.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::account::Account;
use crate::constants::HTTP_REQUEST_TIMEOUT;
use crate::error::HubError;

/// Broadcast metadata returned by the player-status endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastStatus {
    /// Canonical broadcast id (`lv…`).
    pub broadcast_id: String,
    /// Broadcast title.
    pub title: String,
    /// Description text.
    #[serde(default)]
    pub description: String,
    /// Community the broadcast belongs to (`co…`).
    pub community_id: String,
    /// User id of the broadcaster.
    pub owner_id: String,
    /// Display name of the broadcaster.
    #[serde(default)]
    pub owner_name: String,
    /// When the broadcast opened; `vpos` is measured from this.
    pub open_time: DateTime<Utc>,
    /// When the program started.
    pub start_time: DateTime<Utc>,
    /// Comment server host.
    pub ms_addr: String,
    /// Comment server port.
    pub ms_port: u16,
    /// Comment server thread id.
    pub ms_thread: String,
}

/// Viewer/comment counters from the heartbeat endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatStatus {
    /// Current viewer count.
    pub watch_count: u64,
    /// Current comment count.
    pub comment_count: u64,
    /// Server-suggested seconds until the next heartbeat, if any.
    pub wait_time: Option<u64>,
}

/// Result of the notification login endpoint.
#[derive(Clone, Debug)]
pub struct NotificationTicket {
    /// Endpoint status string; `"ok"` on success.
    pub status: String,
    /// Session ticket for the admin endpoint. Empty on bad credentials.
    pub ticket: String,
}

/// Connection info and followed communities from the notification admin
/// endpoint.
#[derive(Clone, Debug)]
pub struct NotificationInfo {
    /// Multicast server host.
    pub addr: String,
    /// Multicast server port.
    pub port: u16,
    /// Watch thread id.
    pub thread: String,
    /// Communities the account follows.
    pub communities: Vec<String>,
}

/// A resolved viewer profile.
#[derive(Clone, Debug)]
pub struct UserProfile {
    /// User id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Avatar URL.
    pub thumbnail_url: String,
}

/// External HTTP collaborators, one typed function per endpoint.
#[async_trait]
pub trait LiveApi: Send + Sync {
    /// Logs in and returns the usersession cookie value.
    async fn login(&self, mail: &str, password: &str) -> Result<String, HubError>;

    /// Fetches broadcast metadata and comment server connection info.
    async fn fetch_broadcast_status(
        &self,
        account: &Account,
        broadcast_id: &str,
    ) -> Result<BroadcastStatus, HubError>;

    /// Fetches viewer/comment counts for a connected broadcast.
    async fn fetch_heartbeat(
        &self,
        account: &Account,
        broadcast_id: &str,
    ) -> Result<HeartbeatStatus, HubError>;

    /// Issues a short-lived posting credential for the given thread/block.
    async fn fetch_postkey(
        &self,
        account: &Account,
        thread: &str,
        block: u64,
    ) -> Result<String, HubError>;

    /// Posts credentials to the notification login endpoint.
    async fn notification_login(
        &self,
        mail: &str,
        password: &str,
    ) -> Result<NotificationTicket, HubError>;

    /// Posts the login ticket and returns watch connection info.
    async fn notification_admin(&self, ticket: &str) -> Result<NotificationInfo, HubError>;

    /// Resolves a viewer profile by user id.
    async fn fetch_user_profile(
        &self,
        account: &Account,
        user_id: &str,
    ) -> Result<UserProfile, HubError>;

    /// Fetches the owner-comment token for a broadcast the account owns.
    async fn fetch_publish_token(
        &self,
        account: &Account,
        broadcast_id: &str,
    ) -> Result<String, HubError>;

    /// Posts a comment through the owner API.
    async fn post_owner_comment(
        &self,
        account: &Account,
        broadcast_id: &str,
        token: &str,
        text: &str,
        name: &str,
    ) -> Result<(), HubError>;
}

/// Extracts the text of the first `<tag>…</tag>` leaf in an XML body.
///
/// The platform's responses are flat enough that a scan beats a DOM; nested
/// occurrences return the first match.
pub(crate) fn tag_text<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(&body[start..end])
}

fn require_tag(body: &str, tag: &str) -> Result<String, HubError> {
    tag_text(body, tag)
        .map(str::to_string)
        .ok_or_else(|| HubError::Protocol(format!("missing <{tag}> in response")))
}

fn epoch_tag(body: &str, tag: &str) -> Result<DateTime<Utc>, HubError> {
    let raw = require_tag(body, tag)?;
    let secs: i64 = raw
        .parse()
        .map_err(|_| HubError::Protocol(format!("bad epoch in <{tag}>: {raw}")))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| HubError::Protocol(format!("epoch out of range in <{tag}>")))
}

/// Production [`LiveApi`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpLiveApi {
    client: reqwest::Client,
    /// Base URL of the live API host.
    live_base: String,
    /// Base URL of the account/login host.
    account_base: String,
    /// Base URL of the notification host.
    notify_base: String,
}

impl Default for HttpLiveApi {
    fn default() -> Self {
        Self::new(
            "https://live.nicovideo.jp",
            "https://secure.nicovideo.jp",
            "https://live.nicovideo.jp",
        )
    }
}

impl HttpLiveApi {
    /// Creates a client against the given API hosts.
    ///
    /// Separate bases keep tests and alternative deployments possible
    /// without touching call sites.
    pub fn new(live_base: &str, account_base: &str, notify_base: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            live_base: live_base.trim_end_matches('/').to_string(),
            account_base: account_base.trim_end_matches('/').to_string(),
            notify_base: notify_base.trim_end_matches('/').to_string(),
        }
    }

    fn session_cookie(account: &Account) -> String {
        format!("user_session={}", account.usersession)
    }

    async fn get_text(&self, url: &str, account: Option<&Account>) -> Result<String, HubError> {
        let mut req = self.client.get(url);
        if let Some(account) = account {
            req = req.header(reqwest::header::COOKIE, Self::session_cookie(account));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| HubError::Transport(format!("GET {url}: {e}")))?;
        resp.text()
            .await
            .map_err(|e| HubError::Transport(format!("GET {url} body: {e}")))
    }

    async fn post_form(
        &self,
        url: &str,
        account: Option<&Account>,
        form: &[(&str, &str)],
    ) -> Result<String, HubError> {
        let mut req = self.client.post(url).form(form);
        if let Some(account) = account {
            req = req.header(reqwest::header::COOKIE, Self::session_cookie(account));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| HubError::Transport(format!("POST {url}: {e}")))?;
        resp.text()
            .await
            .map_err(|e| HubError::Transport(format!("POST {url} body: {e}")))
    }
}

#[async_trait]
impl LiveApi for HttpLiveApi {
    async fn login(&self, mail: &str, password: &str) -> Result<String, HubError> {
        let url = format!("{}/secure/login?site=nicolive", self.account_base);
        let resp = self
            .client
            .post(&url)
            .form(&[("mail", mail), ("password", password)])
            .send()
            .await
            .map_err(|e| HubError::Transport(format!("login: {e}")))?;

        // The session comes back as a Set-Cookie header.
        for cookie in resp.headers().get_all(reqwest::header::SET_COOKIE) {
            let Ok(raw) = cookie.to_str() else { continue };
            if let Some(rest) = raw.strip_prefix("user_session=") {
                let value = rest.split(';').next().unwrap_or(rest);
                if !value.is_empty() && value != "deleted" {
                    return Ok(value.to_string());
                }
            }
        }
        Err(HubError::IncorrectAccount)
    }

    async fn fetch_broadcast_status(
        &self,
        account: &Account,
        broadcast_id: &str,
    ) -> Result<BroadcastStatus, HubError> {
        let url = format!("{}/api/getplayerstatus?v={broadcast_id}", self.live_base);
        let body = self.get_text(&url, Some(account)).await?;

        if let Some(code) = tag_text(&body, "code") {
            match code {
                "closed" | "comingsoon" => {
                    return Err(HubError::BroadcastClosed(broadcast_id.to_string()))
                }
                "notlogin" => return Err(HubError::NotLoggedIn),
                _ => return Err(HubError::Protocol(format!("player status error: {code}"))),
            }
        }

        Ok(BroadcastStatus {
            broadcast_id: require_tag(&body, "id")?,
            title: require_tag(&body, "title")?,
            description: tag_text(&body, "description").unwrap_or_default().to_string(),
            community_id: tag_text(&body, "default_community")
                .unwrap_or_default()
                .to_string(),
            owner_id: require_tag(&body, "owner_id")?,
            owner_name: tag_text(&body, "owner_name").unwrap_or_default().to_string(),
            open_time: epoch_tag(&body, "open_time")?,
            start_time: epoch_tag(&body, "start_time")?,
            ms_addr: require_tag(&body, "addr")?,
            ms_port: require_tag(&body, "port")?
                .parse()
                .map_err(|_| HubError::Protocol("bad comment server port".into()))?,
            ms_thread: require_tag(&body, "thread")?,
        })
    }

    async fn fetch_heartbeat(
        &self,
        account: &Account,
        broadcast_id: &str,
    ) -> Result<HeartbeatStatus, HubError> {
        let url = format!("{}/api/heartbeat?v={broadcast_id}", self.live_base);
        let body = self.get_text(&url, Some(account)).await?;

        if let Some(code) = tag_text(&body, "code") {
            return Err(HubError::Protocol(format!("heartbeat error: {code}")));
        }
        Ok(HeartbeatStatus {
            watch_count: require_tag(&body, "watchCount")?
                .parse()
                .map_err(|_| HubError::Protocol("bad watchCount".into()))?,
            comment_count: require_tag(&body, "commentCount")?
                .parse()
                .map_err(|_| HubError::Protocol("bad commentCount".into()))?,
            wait_time: tag_text(&body, "waitTime").and_then(|w| w.parse().ok()),
        })
    }

    async fn fetch_postkey(
        &self,
        account: &Account,
        thread: &str,
        block: u64,
    ) -> Result<String, HubError> {
        let url = format!(
            "{}/api/getpostkey?thread={thread}&block_no={block}",
            self.live_base
        );
        let body = self.get_text(&url, Some(account)).await?;
        // Body is `postkey=VALUE`; empty value means the request was refused.
        let key = body
            .trim()
            .strip_prefix("postkey=")
            .ok_or_else(|| HubError::Protocol(format!("unexpected postkey body: {body}")))?;
        if key.is_empty() {
            return Err(HubError::Protocol("empty postkey".into()));
        }
        Ok(key.to_string())
    }

    async fn notification_login(
        &self,
        mail: &str,
        password: &str,
    ) -> Result<NotificationTicket, HubError> {
        let url = format!("{}/api/antenna/login", self.notify_base);
        let body = self
            .post_form(&url, None, &[("mail", mail), ("password", password)])
            .await?;
        Ok(NotificationTicket {
            status: tag_text(&body, "status").unwrap_or_default().to_string(),
            ticket: tag_text(&body, "ticket").unwrap_or_default().to_string(),
        })
    }

    async fn notification_admin(&self, ticket: &str) -> Result<NotificationInfo, HubError> {
        let url = format!("{}/api/antenna/getserver", self.notify_base);
        let body = self.post_form(&url, None, &[("ticket", ticket)]).await?;

        let mut communities = Vec::new();
        let mut rest = body.as_str();
        while let Some(id) = tag_text(rest, "community_id") {
            communities.push(id.to_string());
            // Advance past this occurrence; tag_text always finds the first.
            let Some(pos) = rest.find("</community_id>") else { break };
            rest = &rest[pos + "</community_id>".len()..];
        }

        Ok(NotificationInfo {
            addr: require_tag(&body, "addr")?,
            port: require_tag(&body, "port")?
                .parse()
                .map_err(|_| HubError::Protocol("bad notification port".into()))?,
            thread: require_tag(&body, "thread")?,
            communities,
        })
    }

    async fn fetch_user_profile(
        &self,
        account: &Account,
        user_id: &str,
    ) -> Result<UserProfile, HubError> {
        let url = format!("{}/api/userinfo?user_id={user_id}", self.live_base);
        let body = self.get_text(&url, Some(account)).await?;
        Ok(UserProfile {
            id: user_id.to_string(),
            name: require_tag(&body, "nickname")?,
            thumbnail_url: tag_text(&body, "thumbnail_url").unwrap_or_default().to_string(),
        })
    }

    async fn fetch_publish_token(
        &self,
        account: &Account,
        broadcast_id: &str,
    ) -> Result<String, HubError> {
        let url = format!("{}/api/getpublishstatus?v={broadcast_id}", self.live_base);
        let body = self.get_text(&url, Some(account)).await?;
        require_tag(&body, "token")
    }

    async fn post_owner_comment(
        &self,
        account: &Account,
        broadcast_id: &str,
        token: &str,
        text: &str,
        name: &str,
    ) -> Result<(), HubError> {
        let url = format!("{}/api/broadcast/{broadcast_id}", self.live_base);
        let body = self
            .post_form(
                &url,
                Some(account),
                &[("body", text), ("token", token), ("name", name)],
            )
            .await?;
        match tag_text(&body, "status") {
            Some("ok") | None => Ok(()),
            Some(other) => Err(HubError::SendFailed(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_text_extracts_first_leaf() {
        let body = "<resp><status>ok</status><addr>omsg.example</addr><addr>x</addr></resp>";
        assert_eq!(tag_text(body, "status"), Some("ok"));
        assert_eq!(tag_text(body, "addr"), Some("omsg.example"));
        assert_eq!(tag_text(body, "missing"), None);
    }

    #[test]
    fn test_epoch_tag_parses_unix_seconds() {
        let body = "<open_time>1500000000</open_time>";
        let t = epoch_tag(body, "open_time").unwrap();
        assert_eq!(t.timestamp(), 1_500_000_000);
        assert!(epoch_tag(body, "start_time").is_err());
    }

    #[test]
    fn test_require_tag_reports_missing() {
        let err = require_tag("<a>1</a>", "b").unwrap_err();
        assert!(matches!(err, HubError::Protocol(_)));
    }
}
