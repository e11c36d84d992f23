//! Canonical method, topic and header names shared across the workspace.
//!
//! Event kinds double as JSON-RPC notification method names, so the strings
//! below are part of the client-facing protocol. Do not rename them casually.

// Exec lifecycle (published on the bus, forwarded as notifications)
pub const TOPIC_EXEC_ERROR: &str = "onExecError";
pub const TOPIC_EXEC_EXIT: &str = "onExecExit";

// Tunnel lifecycle
pub const METHOD_CONNECTED: &str = "connected";
pub const HELLO_TEXT: &str = "Hello!";

// Exec RPC group
pub const METHOD_EXEC_CREATE: &str = "create";
pub const METHOD_EXEC_CHECK: &str = "check";
pub const METHOD_EXEC_RESIZE: &str = "resize";

// Tunnel attributes
pub const ATTR_BEARER_TOKEN: &str = "bearerToken";

// Admission headers (set by the authenticating proxy in front of the service)
pub const HEADER_ACCESS_TOKEN: &str = "x-forwarded-access-token";
pub const HEADER_FORWARDED_USER: &str = "x-forwarded-user";
