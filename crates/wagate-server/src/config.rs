use std::time::Duration;

use wagate_core::security::AdminToken;

/// HTTP listener configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Guards the management routes when set.
    pub admin_token: Option<AdminToken>,
    /// Applies to every route except the SSE stream.
    pub request_timeout: Duration,
    pub sse_keepalive: Duration,
    /// Upper bound on request bodies; media arrives base64-encoded inline.
    pub max_body_bytes: usize,
    /// How long `ServerHandle::stop` waits for in-flight requests.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            admin_token: None,
            request_timeout: Duration::from_secs(60),
            sse_keepalive: Duration::from_secs(15),
            max_body_bytes: 32 * 1024 * 1024,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
