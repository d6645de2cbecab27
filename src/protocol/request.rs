//! Join request parsing from the WebSocket handshake
//!
//! The room is the last non-empty path segment (a leading `ws` segment is
//! accepted for older clients), `default` when the path is empty. Query
//! parameters carry the async flag and the access token.

use std::net::IpAddr;

/// Room used when the request path names none
pub const DEFAULT_ROOM: &str = "default";

/// Legacy leading path segment stripped before picking the room
pub const LEGACY_PATH_PREFIX: &str = "ws";

/// Maximum room identifier length
pub const MAX_ROOM_ID_LEN: usize = 128;

/// What a connecting client asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub room: String,
    pub async_mode: bool,
    pub token: Option<String>,
}

impl JoinRequest {
    /// Parse a request path and optional query string
    pub fn parse(path: &str, query: Option<&str>) -> Self {
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.first() == Some(&LEGACY_PATH_PREFIX) {
            segments.remove(0);
        }
        let room = segments.last().copied().unwrap_or(DEFAULT_ROOM).to_string();

        let mut async_mode = false;
        let mut token = None;
        for pair in query.unwrap_or_default().split('&') {
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (k, v),
                None => (pair, ""),
            };
            match key {
                "async" => async_mode = is_truthy(value),
                "token" if !value.is_empty() => token = Some(value.to_string()),
                _ => {}
            }
        }

        Self {
            room,
            async_mode,
            token,
        }
    }

    /// Parse a request target such as `/room1?async=1&token=abc`
    pub fn from_target(target: &str) -> Self {
        match target.split_once('?') {
            Some((path, query)) => Self::parse(path, Some(query)),
            None => Self::parse(target, None),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Check a room identifier: non-empty, bounded, `[A-Za-z0-9_.-]` only
pub fn is_valid_room_id(room: &str) -> bool {
    !room.is_empty()
        && room.len() <= MAX_ROOM_ID_LEN
        && room
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Resolve the client IP: first `X-Forwarded-For` entry if it parses,
/// otherwise the transport peer address
pub fn client_ip(forwarded_for: Option<&str>, peer: IpAddr) -> IpAddr {
    forwarded_for
        .and_then(|header| header.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .unwrap_or(peer)
}
