//! Error kinds shared across the hub.

use std::fmt;

/// Everything that can go wrong between the hub, the comment servers and
/// the HTTP collaborators.
#[derive(Debug)]
pub enum HubError {
    /// Network-level failure: dial, read, write, HTTP transport.
    Transport(String),
    /// The peer spoke, but not the protocol we expected.
    Protocol(String),
    /// A broadcast identifier that matches no known pattern.
    InvalidBroadcastId(String),
    /// The operation needs a logged-in account.
    NotLoggedIn,
    /// Credentials were accepted but belong to the wrong account kind.
    IncorrectAccount,
    /// The broadcast has already ended or has not started.
    BroadcastClosed(String),
    /// The comment server rejected a post; carries the status code.
    SendFailed(String),
    /// A client-side rate limit stopped the operation before the wire.
    RateLimited(String),
    /// No stored record for the requested key.
    RecordNotFound(String),
    /// Disconnect re-entered while another caller is tearing down.
    AlreadyDisconnecting,
    /// The target (session, channel, queue) is already gone.
    Closed,
}

impl HubError {
    /// Whether retrying the same operation can reasonably succeed.
    ///
    /// Only network-level failures qualify; protocol and account errors
    /// will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::InvalidBroadcastId(id) => write!(f, "invalid broadcast id: {id:?}"),
            Self::NotLoggedIn => write!(f, "not logged in"),
            Self::IncorrectAccount => write!(f, "incorrect account"),
            Self::BroadcastClosed(id) => write!(f, "broadcast {id} is closed"),
            Self::SendFailed(status) => write!(f, "comment rejected with status {status}"),
            Self::RateLimited(msg) => write!(f, "rate limited: {msg}"),
            Self::RecordNotFound(key) => write!(f, "no record for {key:?}"),
            Self::AlreadyDisconnecting => write!(f, "already disconnecting"),
            Self::Closed => write!(f, "already closed"),
        }
    }
}

impl std::error::Error for HubError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_transient() {
        assert!(HubError::Transport("reset".into()).is_transient());
        assert!(!HubError::Protocol("junk".into()).is_transient());
        assert!(!HubError::BroadcastClosed("lv1".into()).is_transient());
        assert!(!HubError::IncorrectAccount.is_transient());
        assert!(!HubError::RateLimited("limit".into()).is_transient());
    }

    #[test]
    fn test_display_carries_detail() {
        let e = HubError::SendFailed("4".into());
        assert_eq!(e.to_string(), "comment rejected with status 4");
        let e = HubError::InvalidBroadcastId("xx99".into());
        assert!(e.to_string().contains("xx99"));
    }
}
