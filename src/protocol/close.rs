//! Close causes sent to clients
//!
//! Every admission rejection and every in-session violation closes the
//! WebSocket with its own code and reason so a client can tell them apart.

use std::fmt;

/// Why the broker closed (or refused) a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Per-IP live connection limit reached
    TooManyConnections,
    /// Live room limit reached and the requested room is not live
    ServerAtCapacity,
    /// Room identifier failed length/charset validation
    InvalidRoomId,
    /// Room has a token and the joiner's token differs or is missing
    InvalidToken,
    /// Room member limit reached
    RoomFull,
    /// Inbound message exceeded the size limit
    MessageTooLarge,
    /// Server is shutting down
    ServerShutdown,
}

impl CloseReason {
    /// WebSocket close code
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::TooManyConnections => 4029,
            CloseReason::ServerAtCapacity => 1013,
            CloseReason::InvalidRoomId => 4000,
            CloseReason::InvalidToken => 4001,
            CloseReason::RoomFull => 4002,
            CloseReason::MessageTooLarge => 1009,
            CloseReason::ServerShutdown => 1001,
        }
    }

    /// Close frame reason text
    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::TooManyConnections => "Too many connections",
            CloseReason::ServerAtCapacity => "Server at capacity",
            CloseReason::InvalidRoomId => "Invalid room id",
            CloseReason::InvalidToken => "Invalid token",
            CloseReason::RoomFull => "Room full",
            CloseReason::MessageTooLarge => "Message too large",
            CloseReason::ServerShutdown => "Server shutting down",
        }
    }

    /// Whether this cause is decided during admission
    pub fn is_admission(&self) -> bool {
        !matches!(
            self,
            CloseReason::MessageTooLarge | CloseReason::ServerShutdown
        )
    }

    /// Look up a cause by its close code
    pub fn from_code(code: u16) -> Option<Self> {
        ALL_REASONS.iter().copied().find(|r| r.code() == code)
    }
}

const ALL_REASONS: [CloseReason; 7] = [
    CloseReason::TooManyConnections,
    CloseReason::ServerAtCapacity,
    CloseReason::InvalidRoomId,
    CloseReason::InvalidToken,
    CloseReason::RoomFull,
    CloseReason::MessageTooLarge,
    CloseReason::ServerShutdown,
];

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason(), self.code())
    }
}
