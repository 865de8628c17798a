//! Traffic capture subsystem.
//!
//! # Data Flow
//! ```text
//! request chunks  → record.rs (RequestRecorder)  → CapturedRequest
//! response chunks → record.rs (ResponseRecorder) → codec.rs (decode) → CapturedResponse
//!                                                 → observer.rs (hooks)
//! ```
//!
//! # Design Decisions
//! - Request bodies are taken as-is; only response bodies are decoded
//! - Response bodies are decoded once, after the stream ends
//! - Decoding never fails (base64 fallback)
//! - Time comes from an injectable clock

pub mod clock;
pub mod codec;
pub mod observer;
pub mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{decode, BodyEncoding, DecodedBody};
pub use observer::Observers;
pub use record::{
    CapturedHeaders, CapturedRequest, CapturedResponse, HeaderEntry, RequestRecorder,
    ResponseRecorder,
};
