//! Command handlers keyed by (domain, command).
//!
//! Commands arrive as bus messages, either broadcast on the `nicohub`
//! domain or sent over a plugin's direct lane. Replies go back over the
//! direct lane of the plugin that asked; internally-sourced commands have
//! nowhere to reply to and only log.

use serde_json::{json, Value};

use crate::account::Account;
use crate::constants::{CONNECT_RETRIES, CONNECT_RETRY_DELAY};
use crate::error::HubError;
use crate::plugin::{Message, Source, DOMAIN_BROADCAST, DOMAIN_DIRECT};
use crate::user::UserRecord;

use super::Hub;

impl Hub {
    /// Dispatches one routed message to its handler.
    pub(super) async fn handle_message(&mut self, msg: Message) {
        if msg.domain != DOMAIN_BROADCAST && msg.domain != DOMAIN_DIRECT {
            return;
        }
        match msg.command.as_str() {
            "Broad.Connect" => self.on_broad_connect(&msg).await,
            "Broad.Disconnect" => self.teardown_comment().await,
            "Comment.Send" => self.on_comment_send(&msg).await,
            "Account.Set" => self.on_account_set(&msg),
            "Account.Login" => self.on_account_login(&msg).await,
            "Account.Save" => self.on_account_save(&msg),
            "Account.Load" => self.on_account_load(&msg),
            "Settings.Get" => {
                self.reply(&msg, "Settings.Get", self.settings.as_public_json());
            }
            "Settings.Set" => {
                self.settings.apply_public_json(&msg.content);
                self.reply(&msg, "Settings.Get", self.settings.as_public_json());
            }
            "Plug.Enable" => self.on_plug_state(&msg, true),
            "Plug.Disable" => self.on_plug_state(&msg, false),
            "User.Set" => self.on_user_set(&msg),
            "User.SetName" => self.on_user_set_name(&msg),
            "User.Delete" => self.on_user_delete(&msg),
            "User.Fetch" => self.on_user_fetch(&msg).await,
            "Notif.Start" => self.on_notif_start(&msg).await,
            "Notif.Stop" => self.teardown_notification().await,
            _ => {}
        }
    }

    /// Sends a reply over the direct lane of the plugin that asked.
    fn reply(&self, request: &Message, command: &str, content: Value) {
        match request.source {
            Source::Plugin(slot) => {
                if let Err(e) = self
                    .router
                    .unicast(slot, Message::internal(DOMAIN_DIRECT, command, content))
                {
                    log::warn!("[Hub] Reply to slot {slot} failed: {e}");
                }
            }
            Source::Internal => {
                log::debug!("[Hub] No reply target for internal {command}");
            }
        }
    }

    fn reply_error(&self, request: &Message, err: &HubError) {
        self.reply(request, "Error", json!({ "text": err.to_string() }));
        self.notify_ui(&err.to_string());
    }

    // ------------------------------------------------------------------
    // Broadcast connection
    // ------------------------------------------------------------------

    async fn on_broad_connect(&mut self, msg: &Message) {
        let raw = msg.content.get("id").and_then(Value::as_str).unwrap_or("");
        let Some(id) = self.broadcast_re.find(raw).map(|m| m.as_str().to_string())
        else {
            self.reply_error(msg, &HubError::InvalidBroadcastId(raw.to_string()));
            return;
        };
        self.connect_broadcast(&id).await;
    }

    /// Connects the comment session to `id`, replacing any current one.
    ///
    /// The metadata fetch retries on transport failures only; a closed
    /// broadcast or a bad account fails immediately.
    pub(super) async fn connect_broadcast(&mut self, id: &str) {
        let Some(account) = self.account.clone() else {
            self.notify_ui("no account configured");
            return;
        };

        let status = {
            let mut retries = 0;
            loop {
                match self.api.fetch_broadcast_status(&account, id).await {
                    Ok(status) => break status,
                    Err(e) if e.is_transient() && retries < CONNECT_RETRIES => {
                        retries += 1;
                        log::warn!("[Hub] Metadata fetch for {id} failed, retrying: {e}");
                        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                    }
                    Err(e) => {
                        self.notify_ui(&format!("connect to {id} failed: {e}"));
                        return;
                    }
                }
            }
        };

        self.teardown_comment().await;

        match crate::session::comment::CommentSession::connect(
            std::sync::Arc::clone(&self.api),
            account.clone(),
            status.clone(),
            self.session_tx.clone(),
        )
        .await
        {
            Ok(session) => {
                if status.owner_id == account.user_id {
                    match self.api.fetch_publish_token(&account, &status.broadcast_id).await {
                        Ok(token) => self.publish_token = Some(token),
                        Err(e) => log::warn!("[Hub] Publish token fetch failed: {e}"),
                    }
                }
                self.current_broadcast = Some(status);
                self.comment_session = Some(session);
            }
            Err(e) => self.notify_ui(&format!("connect to {id} failed: {e}")),
        }
    }

    // ------------------------------------------------------------------
    // Comments
    // ------------------------------------------------------------------

    async fn on_comment_send(&mut self, msg: &Message) {
        let text = msg.content.get("text").and_then(Value::as_str).unwrap_or("");
        if text.is_empty() {
            return;
        }
        let anonymous = msg
            .content
            .get("anonymous")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let owner_requested = msg
            .content
            .get("owner")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let (Some(broadcast), Some(account)) =
            (self.current_broadcast.as_ref(), self.account.as_ref())
        else {
            self.notify_ui("not connected to a broadcast");
            return;
        };

        let owns = broadcast.owner_id == account.user_id;
        let owner_mode = owns && (self.settings.owner_comment || owner_requested);

        if owner_mode {
            let Some(token) = self.publish_token.as_deref() else {
                self.notify_ui("owner comment token unavailable");
                return;
            };
            let result = self
                .api
                .post_owner_comment(account, &broadcast.broadcast_id, token, text, "")
                .await;
            match result {
                Ok(()) => self.publish("Comment.Sent", Value::Null),
                Err(e) => self.notify_ui(&format!("owner comment failed: {e}")),
            }
            return;
        }

        let Some(session) = self.comment_session.as_ref() else {
            self.notify_ui("not connected to a broadcast");
            return;
        };
        if let Err(e) = session.send_comment(text, anonymous, false) {
            self.notify_ui(&format!("comment not sent: {e}"));
        }
    }

    // ------------------------------------------------------------------
    // Account
    // ------------------------------------------------------------------

    fn on_account_set(&mut self, msg: &Message) {
        let mail = msg.content.get("mail").and_then(Value::as_str).unwrap_or("");
        let password = msg
            .content
            .get("password")
            .and_then(Value::as_str)
            .unwrap_or("");
        // New credentials invalidate any previous session cookie.
        self.account = Some(Account {
            mail: mail.to_string(),
            password: password.to_string(),
            usersession: String::new(),
            user_id: String::new(),
        });
        self.reply(msg, "Account.Got", json!({ "mail": mail }));
    }

    async fn on_account_login(&mut self, msg: &Message) {
        let Some(account) = self.account.as_mut() else {
            self.reply_error(msg, &HubError::NotLoggedIn);
            return;
        };
        match self.api.login(&account.mail, &account.password).await {
            Ok(session) => {
                account.usersession = session;
                if let Some(id) = msg.content.get("user_id").and_then(Value::as_str) {
                    account.user_id = id.to_string();
                }
                let mail = account.mail.clone();
                self.reply(msg, "Account.LoggedIn", json!({ "mail": mail }));
                log::info!("[Hub] Logged in as {mail}");
            }
            Err(e) => self.reply_error(msg, &e),
        }
    }

    fn on_account_save(&mut self, msg: &Message) {
        let Some(account) = self.account.as_ref() else {
            self.reply_error(msg, &HubError::NotLoggedIn);
            return;
        };
        if let Err(e) = account.save() {
            self.notify_ui(&format!("account save failed: {e:#}"));
        }
    }

    fn on_account_load(&mut self, msg: &Message) {
        match Account::load() {
            Ok(account) => {
                self.reply(msg, "Account.Got", json!({ "mail": account.mail }));
                self.account = Some(account);
            }
            Err(e) => self.notify_ui(&format!("account load failed: {e:#}")),
        }
    }

    // ------------------------------------------------------------------
    // Plugins
    // ------------------------------------------------------------------

    fn on_plug_state(&mut self, msg: &Message, enabled: bool) {
        let slot = match msg.content.get("no").and_then(Value::as_u64) {
            Some(no) => Some(no as usize),
            None => msg
                .content
                .get("name")
                .and_then(Value::as_str)
                .and_then(|name| self.router.slot_of(name)),
        };
        let Some(slot) = slot else {
            self.reply_error(msg, &HubError::RecordNotFound("plugin".into()));
            return;
        };
        if let Err(e) = self.router.set_enabled(slot, enabled) {
            self.reply_error(msg, &e);
        }
    }

    // ------------------------------------------------------------------
    // User records
    // ------------------------------------------------------------------

    fn user_json(record: &UserRecord) -> Value {
        json!({
            "id": record.id,
            "name": record.name,
            "thumbnail_url": record.thumbnail_url,
            "anonymous": record.is_anonymous,
        })
    }

    fn on_user_set(&mut self, msg: &Message) {
        let Some(id) = msg.content.get("id").and_then(Value::as_str) else {
            return;
        };
        let record = UserRecord {
            id: id.to_string(),
            name: msg
                .content
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            thumbnail_url: msg
                .content
                .get("thumbnail_url")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            create_time: chrono::Utc::now(),
            is_anonymous: !self.registered_re.is_match(id),
        };
        if let Err(e) = self.users.set(record) {
            self.notify_ui(&format!("user store write failed: {e:#}"));
        }
    }

    fn on_user_set_name(&mut self, msg: &Message) {
        let (Some(id), Some(name)) = (
            msg.content.get("id").and_then(Value::as_str),
            msg.content.get("name").and_then(Value::as_str),
        ) else {
            return;
        };
        if let Err(e) = self.users.set_name(id, name) {
            self.reply_error(msg, &e);
        }
    }

    fn on_user_delete(&mut self, msg: &Message) {
        let Some(id) = msg.content.get("id").and_then(Value::as_str) else {
            return;
        };
        if let Err(e) = self.users.delete(id) {
            self.reply_error(msg, &e);
        }
    }

    /// Resolves a user record, hitting the profile API only for
    /// registered ids and only within the rolling rate budget.
    async fn on_user_fetch(&mut self, msg: &Message) {
        let Some(id) = msg.content.get("id").and_then(Value::as_str) else {
            return;
        };

        // Anonymous ids have no profile; answer locally.
        if !self.registered_re.is_match(id) {
            let record = UserRecord::anonymous(id);
            self.reply(msg, "User.Got", Self::user_json(&record));
            return;
        }

        if let Ok(record) = self.users.get(id) {
            let content = Self::user_json(record);
            self.reply(msg, "User.Got", content);
            return;
        }

        if let Err(e) = self.fetch_limiter.try_acquire() {
            self.reply_error(msg, &e);
            return;
        }

        let Some(account) = self.account.clone() else {
            self.reply_error(msg, &HubError::NotLoggedIn);
            return;
        };
        match self.api.fetch_user_profile(&account, id).await {
            Ok(profile) => {
                let record = UserRecord {
                    id: profile.id,
                    name: profile.name,
                    thumbnail_url: profile.thumbnail_url,
                    create_time: chrono::Utc::now(),
                    is_anonymous: false,
                };
                if let Err(e) = self.users.set(record.clone()) {
                    log::warn!("[Hub] User store write failed: {e:#}");
                }
                self.reply(msg, "User.Got", Self::user_json(&record));
            }
            Err(e) => self.reply_error(msg, &e),
        }
    }

    // ------------------------------------------------------------------
    // Notification watch
    // ------------------------------------------------------------------

    async fn on_notif_start(&mut self, msg: &Message) {
        if self.notification.is_some() {
            return;
        }
        let Some(account) = self.account.clone() else {
            self.reply_error(msg, &HubError::NotLoggedIn);
            return;
        };
        match crate::session::notification::NotificationSession::connect(
            std::sync::Arc::clone(&self.api),
            account,
            self.notif_tx.clone(),
        )
        .await
        {
            Ok(session) => {
                log::info!(
                    "[Hub] Notification watch started ({} communities)",
                    session.communities().len()
                );
                self.notification = Some(session);
            }
            Err(e) => self.reply_error(msg, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        BroadcastStatus, HeartbeatStatus, LiveApi, NotificationInfo, NotificationTicket,
        UserProfile,
    };
    use crate::config::Settings;
    use crate::router::MessageRouter;
    use crate::user::UserStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Fails every metadata fetch with a transport error, counting calls.
    #[derive(Default)]
    struct FlakyApi {
        status_calls: AtomicU32,
    }

    #[async_trait]
    impl LiveApi for FlakyApi {
        async fn login(&self, _mail: &str, _password: &str) -> Result<String, HubError> {
            Err(HubError::Protocol("unused".into()))
        }

        async fn fetch_broadcast_status(
            &self,
            _account: &Account,
            _broadcast_id: &str,
        ) -> Result<BroadcastStatus, HubError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            Err(HubError::Transport("connection reset".into()))
        }

        async fn fetch_heartbeat(
            &self,
            _account: &Account,
            _broadcast_id: &str,
        ) -> Result<HeartbeatStatus, HubError> {
            Err(HubError::Protocol("unused".into()))
        }

        async fn fetch_postkey(
            &self,
            _account: &Account,
            _thread: &str,
            _block: u64,
        ) -> Result<String, HubError> {
            Err(HubError::Protocol("unused".into()))
        }

        async fn notification_login(
            &self,
            _mail: &str,
            _password: &str,
        ) -> Result<NotificationTicket, HubError> {
            Err(HubError::Protocol("unused".into()))
        }

        async fn notification_admin(&self, _ticket: &str) -> Result<NotificationInfo, HubError> {
            Err(HubError::Protocol("unused".into()))
        }

        async fn fetch_user_profile(
            &self,
            _account: &Account,
            _user_id: &str,
        ) -> Result<UserProfile, HubError> {
            Err(HubError::Protocol("unused".into()))
        }

        async fn fetch_publish_token(
            &self,
            _account: &Account,
            _broadcast_id: &str,
        ) -> Result<String, HubError> {
            Err(HubError::Protocol("unused".into()))
        }

        async fn post_owner_comment(
            &self,
            _account: &Account,
            _broadcast_id: &str,
            _token: &str,
            _text: &str,
            _name: &str,
        ) -> Result<(), HubError> {
            Err(HubError::Protocol("unused".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_transient_failures_then_gives_up() {
        let api = Arc::new(FlakyApi::default());
        let (hub_tx, _hub_rx) = mpsc::unbounded_channel();
        let router = MessageRouter::new(&[], hub_tx, CancellationToken::new());
        let dir = tempfile::tempdir().unwrap();
        let users = UserStore::open(dir.path().join("users.json")).unwrap();
        let account = Account {
            mail: "a@example.com".to_string(),
            password: "pw".to_string(),
            usersession: "sess".to_string(),
            user_id: "100".to_string(),
        };

        let mut hub = super::super::Hub::new(
            Arc::clone(&api) as Arc<dyn LiveApi>,
            router,
            Settings::default(),
            Some(account),
            users,
        );
        hub.connect_broadcast("lv1").await;

        // One initial attempt plus CONNECT_RETRIES retries.
        assert_eq!(
            api.status_calls.load(Ordering::SeqCst),
            1 + CONNECT_RETRIES
        );
        assert!(hub.comment_session.is_none());
    }
}
