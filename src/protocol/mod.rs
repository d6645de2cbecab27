//! Wire-facing types: join requests, close causes and buffered records

pub mod close;
pub mod record;
pub mod request;

pub use close::CloseReason;
pub use record::{BufferedRecord, Payload, PayloadKind};
pub use request::{JoinRequest, client_ip, is_valid_room_id};
