//! The process-wide `Config`/`Cli` (§4.10/§6) lives in `rdp_dbus::config`
//! since it is shared verbatim with the user-mode `rdp-server` binary;
//! this daemon only needs to know its own default config path.

pub use rdp_dbus::config::{
    AuthSection, CaptureSection, Cli, Config, ConfigError, EncodingSection, NlaMode, ServerSection, ServiceSection,
    TlsSection,
};

/// Default config path when `--config` is not given and no file is found
/// at it; system-mode deployments normally ship a file here.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rdp-system-daemon/config.toml";
