use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Default PAM service name used when running detached from any display
/// manager (`system.mode = false`). System-mode deployments normally
/// override this to the distro's own RDP PAM service file.
const DEFAULT_USER_PAM_SERVICE: &str = "rdp-server";
const DEFAULT_SYSTEM_PAM_SERVICE: &str = "rdp-system-daemon";

/// NLA credential mode (§4.10): `static` ships one fixed username/password
/// pair from the config file; `delegate` defers to the per-connection
/// handover flow and only makes sense in system mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NlaMode {
    Static,
    Delegate,
}

impl Default for NlaMode {
    fn default() -> Self {
        Self::Delegate
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 3389 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self { width: 1920, height: 1080 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingSection {
    pub mode: String,
    pub enable_diff: bool,
}

impl Default for EncodingSection {
    fn default() -> Self {
        Self { mode: "rfx".to_string(), enable_diff: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub username: Option<String>,
    pub password: Option<String>,
    pub mode: NlaMode,
    pub pam_service: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// Run as the privileged system-mode daemon (`true`) or as a plain
    /// per-user server (`false`).
    pub system: bool,
    /// Advertise RDSTLS / RDP-SSO to clients; requires `system = true`.
    pub rdp_sso: bool,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self { system: true, rdp_sso: false }
    }
}

/// Process-wide configuration (§4.10/§6), loaded from an INI-shaped TOML
/// file (section names preserved 1:1 from the original INI grammar) and
/// overridden by CLI flags. Shared by both the user-mode `rdp-server`
/// binary and the privileged `rdp-system-daemon`; `service.system`
/// distinguishes which role a given process plays.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub tls: TlsSection,
    pub capture: CaptureSection,
    pub encoding: EncodingSection,
    pub auth: AuthSection,
    pub service: ServiceSection,
}

/// Errors produced validating a loaded/overridden [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, Box<toml::de::Error>),
    #[error("tls.certificate and tls.private_key are both required")]
    TlsRequired,
    #[error("service.rdp_sso requires service.system = true")]
    RdpSsoRequiresSystemMode,
    #[error("auth.mode = static requires auth.username and auth.password")]
    StaticNlaRequiresCredentials,
    #[error("auth.mode = delegate requires service.system = true")]
    DelegateNlaRequiresSystemMode,
    #[error("server.port must be nonzero")]
    InvalidPort,
}

impl Config {
    /// Load from a TOML file at `path` (or `default_path` if `path` is
    /// `None`), resolving `tls.*` paths relative to the config file's own
    /// directory, then returning defaults if no file exists there.
    pub fn load(path: Option<&Path>, default_path: &Path) -> Result<Self, ConfigError> {
        let path = path.map_or_else(|| default_path.to_path_buf(), Path::to_path_buf);

        if !path.exists() {
            tracing::debug!(?path, "config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::Read(path.clone(), e))?;
        let mut config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.clone(), Box::new(e)))?;

        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        config.canonicalize_tls_paths(&base_dir);
        Ok(config)
    }

    fn canonicalize_tls_paths(&mut self, base_dir: &Path) {
        if let Some(cert) = self.tls.certificate.take() {
            self.tls.certificate = Some(resolve_relative(base_dir, cert));
        }
        if let Some(key) = self.tls.private_key.take() {
            self.tls.private_key = Some(resolve_relative(base_dir, key));
        }
    }

    /// Apply CLI overrides (any `Some` field wins over the file value).
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(bind) = &cli.bind_address {
            self.server.bind_address = bind.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(cert) = &cli.tls_certificate {
            self.tls.certificate = Some(cert.clone());
        }
        if let Some(key) = &cli.tls_private_key {
            self.tls.private_key = Some(key.clone());
        }
        if let Some(width) = cli.width {
            self.capture.width = width;
        }
        if let Some(height) = cli.height {
            self.capture.height = height;
        }
        if let Some(mode) = &cli.encoding_mode {
            self.encoding.mode = mode.clone();
        }
        match cli.diff {
            1 => self.encoding.enable_diff = true,
            -1 => self.encoding.enable_diff = false,
            _ => {}
        }
        if let Some(username) = &cli.username {
            self.auth.username = Some(username.clone());
        }
        if let Some(password) = &cli.password {
            self.auth.password = Some(password.clone());
        }
        if let Some(pam_service) = &cli.pam_service {
            self.auth.pam_service = Some(pam_service.clone());
        }
        if cli.system {
            self.service.system = true;
        }
        if cli.rdp_sso {
            self.service.rdp_sso = true;
        }
    }

    /// PAM service name to authenticate with, defaulting per mode.
    #[must_use]
    pub fn pam_service(&self) -> &str {
        self.auth.pam_service.as_deref().unwrap_or(if self.service.system {
            DEFAULT_SYSTEM_PAM_SERVICE
        } else {
            DEFAULT_USER_PAM_SERVICE
        })
    }

    /// Validation rules from §4.10.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.tls.certificate.is_some() != self.tls.private_key.is_some() {
            return Err(ConfigError::TlsRequired);
        }
        if self.service.rdp_sso && !self.service.system {
            return Err(ConfigError::RdpSsoRequiresSystemMode);
        }
        match self.auth.mode {
            NlaMode::Static => {
                if self.auth.username.as_deref().unwrap_or("").is_empty()
                    || self.auth.password.as_deref().unwrap_or("").is_empty()
                {
                    return Err(ConfigError::StaticNlaRequiresCredentials);
                }
            }
            NlaMode::Delegate => {
                if !self.service.system {
                    return Err(ConfigError::DelegateNlaRequiresSystemMode);
                }
            }
        }
        Ok(())
    }
}

fn resolve_relative(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

/// CLI overrides mirroring the config file fields (§6), plus the tri-state
/// diff flag (`-1` disable, `0` leave as configured, `+1` force-enable).
/// Shared by both binaries; clap infers the displayed program name from
/// `CARGO_BIN_NAME` so each binary's `--help` shows its own name.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub bind_address: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub tls_certificate: Option<PathBuf>,
    #[arg(long)]
    pub tls_private_key: Option<PathBuf>,
    #[arg(long)]
    pub width: Option<u32>,
    #[arg(long)]
    pub height: Option<u32>,
    #[arg(long)]
    pub encoding_mode: Option<String>,
    /// -1 disable dirty-rect diffing, 0 leave as configured, +1 force it on.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub diff: i8,
    #[arg(long)]
    pub username: Option<String>,
    #[arg(long)]
    pub password: Option<String>,
    #[arg(long)]
    pub pam_service: Option<String>,
    #[arg(long)]
    pub system: bool,
    #[arg(long)]
    pub rdp_sso: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_requires_both_paths() {
        let mut cfg = Config::default();
        cfg.tls.certificate = Some(PathBuf::from("cert.pem"));
        assert!(matches!(cfg.validate(), Err(ConfigError::TlsRequired)));
    }

    #[test]
    fn rdp_sso_requires_system_mode() {
        let mut cfg = Config::default();
        cfg.service.system = false;
        cfg.service.rdp_sso = true;
        cfg.auth.mode = NlaMode::Static;
        cfg.auth.username = Some("a".into());
        cfg.auth.password = Some("b".into());
        assert!(matches!(cfg.validate(), Err(ConfigError::RdpSsoRequiresSystemMode)));
    }

    #[test]
    fn static_nla_requires_credentials() {
        let mut cfg = Config::default();
        cfg.auth.mode = NlaMode::Static;
        assert!(matches!(cfg.validate(), Err(ConfigError::StaticNlaRequiresCredentials)));
    }

    #[test]
    fn delegate_nla_requires_system_mode() {
        let mut cfg = Config::default();
        cfg.service.system = false;
        cfg.auth.mode = NlaMode::Delegate;
        assert!(matches!(cfg.validate(), Err(ConfigError::DelegateNlaRequiresSystemMode)));
    }

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn pam_service_defaults_per_mode() {
        let mut cfg = Config::default();
        cfg.service.system = true;
        assert_eq!(cfg.pam_service(), DEFAULT_SYSTEM_PAM_SERVICE);
        cfg.service.system = false;
        assert_eq!(cfg.pam_service(), DEFAULT_USER_PAM_SERVICE);
    }
}
