//! Chat wire protocol
//!
//! Every connection carries exactly one call, selected by its first frame:
//!
//! ```text
//! Client                                   Server
//!   |------- Login{name} ------------------>|
//!   |<------ LoginOk{token} | Status -------|   (unary, then close)
//!
//!   |------- Logout{token} ---------------->|
//!   |<------ LogoutOk | Status -------------|   (unary, then close)
//!
//!   |------- Stream{x-token: ...} --------->|
//!   |<------ StreamAccepted | Status -------|
//!   |------- Message{text} --------------->|   (any number, either direction
//!   |<------ Event{...} --------------------|    until one side ends)
//! ```

pub mod codec;
pub mod constants;
pub mod message;

pub use codec::{max_message_len, max_name_len, FrameCodec};
pub use constants::TOKEN_HEADER;
pub use message::{Event, EventKind, Frame, Metadata};
