//! Application-wide constants for nicohub.
//!
//! Centralizes protocol timings and bus limits so the tuning story is in
//! one place. Constants are grouped by subsystem with documentation
//! explaining their purpose.

use std::time::Duration;

// ============================================================================
// HTTP
// ============================================================================

/// HTTP client request timeout for web API calls.
///
/// Applies to each one-shot GET/POST helper. 10 seconds is ample for these
/// endpoints while preventing indefinite hangs on network issues.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Transport
// ============================================================================

/// Write deadline for a single frame on the comment/notification socket.
///
/// The comment servers accept frames quickly; a write that stalls this long
/// indicates a dead peer and the session is better off reconnecting.
pub const FRAME_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial timeout for the comment/notification TCP connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Comment session
// ============================================================================

/// Fallback heartbeat interval when the server supplies no wait hint.
///
/// The heartbeat fetches viewer/comment counts and keeps the session's
/// posting credentials warm. 60 seconds matches the server default.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Lifetime of a cached postkey.
///
/// A postkey issued by the server is only honored briefly; after this the
/// session fetches a fresh one before the next send.
pub const POSTKEY_TTL: Duration = Duration::from_secs(30);

/// Maximum comments posted on a single postkey.
///
/// The server throttles beyond this; the session fails the send locally
/// instead of burning a rejected frame.
pub const POSTKEY_MAX_SENDS: u32 = 10;

/// Sentinel comment text that signals the end of the broadcast.
pub const DISCONNECT_SENTINEL: &str = "/disconnect";

// ============================================================================
// Hub
// ============================================================================

/// Retries after a failed broadcast metadata fetch, on transient network
/// errors only. The initial attempt is not counted.
pub const CONNECT_RETRIES: u32 = 3;

/// Backoff between broadcast metadata fetch attempts.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// User profile fetches allowed per [`USER_FETCH_WINDOW`].
pub const USER_FETCH_LIMIT: usize = 6;

/// Rolling window for the user profile fetch limiter.
pub const USER_FETCH_WINDOW: Duration = Duration::from_secs(60);

// ============================================================================
// Plugin bus
// ============================================================================

/// Capacity of each plugin's outbound message queue.
///
/// A plugin that falls this far behind starts losing messages rather than
/// stalling the router.
pub const PLUGIN_QUEUE_CAPACITY: usize = 3;

/// Coalescing delay before queued outbound messages are flushed to a plugin.
///
/// Batches fan-out bursts into a single write per plugin instead of one
/// syscall per message.
pub const PLUGIN_FLUSH_DELAY: Duration = Duration::from_millis(50);

/// How long a TCP plugin gets to send its slot handshake before the
/// connection is dropped.
pub const PLUGIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
