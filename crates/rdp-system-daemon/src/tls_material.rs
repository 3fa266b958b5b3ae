use std::net::IpAddr;
use std::path::{Path, PathBuf};

use rcgen::{CertificateParams, KeyPair, SanType};

use crate::config::Config;

/// Ensures `config.tls.{certificate,private_key}` point at readable PEM
/// files, generating a self-signed pair under the runtime directory when
/// the config doesn't already name one. The daemon never holds the key
/// material in memory longer than it takes to hand the PEM text to the
/// per-user worker over `StartHandover`; the worker owns the actual TLS
/// accept (see `rdp-server::tls`, which this mirrors for certificate
/// generation but not for building a `rustls` acceptor).
pub fn ensure_tls_material(config: &mut Config, bind_ip: IpAddr) -> anyhow::Result<()> {
    if config.tls.certificate.is_some() && config.tls.private_key.is_some() {
        return Ok(());
    }

    let dir = runtime_tls_dir();
    std::fs::create_dir_all(&dir)?;
    let cert_path = dir.join("handover-cert.pem");
    let key_path = dir.join("handover-key.pem");

    if !cert_path.exists() || !key_path.exists() {
        let (cert_pem, key_pem) = generate_self_signed_pem(bind_ip)?;
        write_private(&cert_path, cert_pem.as_bytes())?;
        write_private(&key_path, key_pem.as_bytes())?;
        tracing::info!(?cert_path, ?key_path, "generated self-signed TLS material for handover delivery");
    }

    config.tls.certificate = Some(cert_path);
    config.tls.private_key = Some(key_path);
    Ok(())
}

fn generate_self_signed_pem(bind_ip: IpAddr) -> anyhow::Result<(String, String)> {
    let key_pair = KeyPair::generate()?;

    let mut san_names = vec!["localhost".to_string()];
    let ip_str = bind_ip.to_string();
    if !bind_ip.is_unspecified() && ip_str != "localhost" {
        san_names.push(ip_str);
    }

    let mut params = CertificateParams::new(san_names)?;
    if !bind_ip.is_unspecified() {
        params.subject_alt_names.push(SanType::IpAddress(bind_ip));
    }
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, rcgen::DnValue::Utf8String("rdp-system-daemon".to_string()));

    let cert = params.self_signed(&key_pair)?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write as _;
    use std::os::unix::fs::OpenOptionsExt as _;

    let mut file = std::fs::OpenOptions::new().write(true).create(true).truncate(true).mode(0o600).open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn runtime_tls_dir() -> PathBuf {
    std::env::var_os("RUNTIME_DIRECTORY")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("XDG_RUNTIME_DIR").map(|d| PathBuf::from(d).join("rdp-system-daemon")))
        .unwrap_or_else(|| PathBuf::from("/run/rdp-system-daemon"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_valid_pem_pair() {
        let (cert, key) = generate_self_signed_pem("127.0.0.1".parse().unwrap()).unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("BEGIN PRIVATE KEY"));
    }
}
