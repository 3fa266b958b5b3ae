// Shared D-Bus plumbing: the status-reporting interface the user-mode
// server exposes, the process-wide `Config` (§4.10/§6) shared by both
// `rdp-server` and `rdp-system-daemon`, and the credential carriers
// (`AuthToken`, `NlaSamFile`) used to hand login material between the
// system daemon and the display manager / NLA stack.
//
// - types.rs:      wire-ish value types shared across interfaces
// - client.rs:      proxy trait for talking to the server daemon
// - server.rs:      skeleton interface the server daemon serves
// - config.rs:      process-wide `Config`/`Cli` (§4.10/§6)
// - constants.rs:   well-known bus name / object path
// - secret.rs:      zero-on-drop secret string
// - auth_token.rs:  `[auth]`/`[meta]` INI credential blob (§6)
// - nla_sam.rs:     NTLMv1 SAM file for static NLA credentials

pub mod auth_token;
pub mod client;
pub mod config;
pub mod constants;
pub mod nla_sam;
pub mod secret;
pub mod server;
pub mod types;

pub use auth_token::{AuthToken, AuthTokenError};
pub use config::{Cli, Config, ConfigError, NlaMode};
pub use nla_sam::{NlaSamError, NlaSamFile};
pub use secret::Secret;
