//! Modbus RTU responder for regbridge.
//!
//! Serves every configured device's register bank on one serial line. The
//! unit address in each request selects the device; requests for any other
//! unit are left unanswered.
//!
//! # Register Map
//!
//! ```text
//! address = index * words_per_value
//! ```
//!
//! Where `words_per_value` is 1 for the scaled `u16`/`i16` encodings and 2
//! for `f32`. Function codes 0x03 and 0x04 read the bank; 0x06 and 0x10
//! write it when writes are enabled.

pub mod config;
pub mod encoding;
pub mod frame;
pub mod responder;
pub mod transport;

pub use config::{RegisterConfig, RegisterEncoding, SerialConfig};
pub use encoding::RegisterLayout;
pub use frame::{ExceptionCode, FrameError, Request, RequestFrame, Response};
pub use responder::{ProtocolResponder, ResponderState, ResponderStats};
pub use transport::{SerialTransport, StreamTransport, Transport, TransportError, open_serial};
