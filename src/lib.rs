//! nicohub - live-broadcast comment client and plugin host.
//!
//! The crate has three layers:
//!
//! - the protocol session engine ([`session`], [`transport`]): NUL-framed
//!   TCP connections to the comment and notification servers,
//! - the plugin bus ([`plugin`], [`router`]): newline-delimited JSON
//!   pub/sub between the hub and external plugin processes,
//! - the orchestrator ([`hub`]): command handlers and the translation
//!   between protocol events and bus messages.

pub mod account;
pub mod api;
pub mod config;
pub mod constants;
pub mod error;
pub mod hub;
pub mod plugin;
pub mod router;
pub mod session;
pub mod transport;
pub mod user;

pub use account::Account;
pub use api::{HttpLiveApi, LiveApi};
pub use config::Settings;
pub use error::HubError;
pub use hub::Hub;
pub use router::MessageRouter;
