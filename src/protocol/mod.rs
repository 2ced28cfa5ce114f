//! Wire protocol shared by the server and the client library.
//!
//! Every frame is `magic (4) | length (u32 BE) | body`. The first frame on a
//! connection is a single [`ClientType`] byte; every later body is a
//! [`Message`]: `msg_id NUL command [NUL payload]`, with payload fields
//! separated by NUL bytes.

pub mod command;
pub mod frame;
pub mod handle;
pub mod message;

pub use command::{ClientType, Command};
pub use frame::{read_frame, write_frame, MAGIC_REQUEST, MAGIC_RESPONSE};
pub use handle::{decode_job_handle, encode_job_handle, SchedLater, HANDLE_LEN};
pub use message::{command_reply, error_reply, Message};

pub const NULL_CHAR: u8 = 0;
