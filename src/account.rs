//! Account credential persistence.
//!
//! The account file holds the login mail, password and the usersession
//! cookie issued by the platform. It is stored next to the settings file
//! with owner-only permissions. The password never appears in log output;
//! `Debug` is implemented by hand for that reason.

use anyhow::Result;
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::fs;

use crate::config::Settings;

/// Platform account credentials.
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct Account {
    /// Login mail address.
    pub mail: String,
    /// Login password.
    pub password: String,
    /// Session cookie from a successful login; sent with API requests.
    #[serde(default)]
    pub usersession: String,
    /// Numeric user id of the account, filled in after login.
    #[serde(default)]
    pub user_id: String,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("mail", &self.mail)
            .field("user_id", &self.user_id)
            .field("has_session", &!self.usersession.is_empty())
            .finish_non_exhaustive()
    }
}

impl Account {
    fn path() -> Result<std::path::PathBuf> {
        Ok(Settings::config_dir()?.join("account.json"))
    }

    /// Loads the account file. Missing file is an error; callers treat it
    /// as "no account configured".
    pub fn load() -> Result<Self> {
        let content = fs::read_to_string(Self::path()?)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persists the account with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        let path = Self::path()?;
        fs::write(&path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// True when a login session cookie is present.
    pub fn has_session(&self) -> bool {
        !self.usersession.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_password() {
        let acc = Account {
            mail: "user@example.com".into(),
            password: "hunter2".into(),
            usersession: "sess".into(),
            user_id: "123".into(),
        };
        let dbg = format!("{acc:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("user@example.com"));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::env::set_var("NICOHUB_CONFIG_DIR", tmp.path());

        let acc = Account {
            mail: "a@b".into(),
            password: "p".into(),
            usersession: "s".into(),
            user_id: "42".into(),
        };
        acc.save().unwrap();
        let loaded = Account::load().unwrap();
        assert_eq!(loaded.mail, "a@b");
        assert_eq!(loaded.user_id, "42");
        assert!(loaded.has_session());

        std::env::remove_var("NICOHUB_CONFIG_DIR");
    }
}
