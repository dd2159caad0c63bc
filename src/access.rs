//! NCSA-style access log (§9 Open Question (c)).
//!
//! Emits one `tracing::info!` record per action instead of writing to a raw
//! stream, so the choice of destination (stdout, file, nothing) is left to
//! whatever `tracing-subscriber` layer the host process installs.

use chrono::Local;

/// The high-level action being logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    HttpComplete,
    WebSocketConnecting,
    WebSocketRejected,
    WebSocketConnected,
    WebSocketDisconnected,
}

impl Action {
    fn request_tag(self) -> &'static str {
        match self {
            Action::HttpComplete => "HTTP",
            Action::WebSocketConnecting => "WSCONNECTING",
            Action::WebSocketRejected => "WSREJECT",
            Action::WebSocketConnected => "WSCONNECT",
            Action::WebSocketDisconnected => "WSDISCONNECT",
        }
    }
}

/// Fields shared by every access log line; unused fields are left `None`.
#[derive(Debug, Clone, Default)]
pub struct AccessLogEntry<'a> {
    pub host: Option<String>,
    pub path: &'a str,
    pub method: Option<&'a str>,
    pub status: Option<u16>,
    pub size: Option<u64>,
}

/// Writes one NCSA-ish line through `tracing`, with a `%d/%b/%Y:%H:%M:%S`
/// timestamp.
pub fn log_action(action: Action, entry: AccessLogEntry<'_>) {
    let timestamp = Local::now().format("%d/%b/%Y:%H:%M:%S").to_string();
    tracing::info!(
        target: "netgate::access",
        time = %timestamp,
        host = entry.host.as_deref().unwrap_or("-"),
        request = entry.method.unwrap_or(action.request_tag()),
        details = entry.path,
        status = entry.status.map(|s| s as i64).unwrap_or(-1),
        length = entry.size.map(|s| s as i64).unwrap_or(-1),
        "{} {}",
        entry.method.unwrap_or(action.request_tag()),
        entry.path,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tags_match_ncsa_style_actions() {
        assert_eq!(Action::WebSocketConnecting.request_tag(), "WSCONNECTING");
        assert_eq!(Action::WebSocketRejected.request_tag(), "WSREJECT");
        assert_eq!(Action::WebSocketConnected.request_tag(), "WSCONNECT");
        assert_eq!(Action::WebSocketDisconnected.request_tag(), "WSDISCONNECT");
    }

    #[test]
    fn log_action_does_not_panic_on_missing_fields() {
        log_action(
            Action::HttpComplete,
            AccessLogEntry {
                host: None,
                path: "/",
                method: Some("GET"),
                status: Some(200),
                size: Some(2),
            },
        );
    }
}
