// Frame encoding: raw BGRA passthrough and RemoteFX (RFX/RFX Progressive),
// with a shared manager that dispatches between them and falls back from RFX
// to raw when a peer's payload limit is exceeded.
//
// - raw.rs:     bottom-up BGRA RawEncoder
// - rfx/:        RemoteFX encoder (tile hashing, quantize+entropy code, wire framing)
// - manager.rs: EncodingManager codec dispatch + RFX->RAW fallback window
// - error.rs:   EncodeError

pub mod error;
pub mod manager;
pub mod raw;
pub mod rfx;

pub use error::EncodeError;
pub use manager::{EncodingManager, EncodingMode, EncodingOptions};
pub use raw::RawEncoder;
pub use rfx::{RfxEncoder, RfxEncoderKind};
