//! The daemon-side half of handover step 4: once a client's RDP session
//! reaches the "ready" callback, decide whether it gets a single-logon
//! session or a plain greeter, hand the display manager a shared-memory FD
//! in the former case, and keep watching the resulting login session for
//! the client-identity migration described in §4.9/§9.
//!
//! This fires only for negotiators that actually own the RDP handshake
//! in-process (see `negotiator::SessionNegotiator`); the default
//! `TlsOnlyNegotiator` hands the raw socket off via `TakeClient` before any
//! protocol byte is read, so in that configuration a per-user worker process
//! reaches "ready", not this daemon (an Open Question resolution, recorded
//! in DESIGN.md). Deployments that plug in a negotiator that fully drives
//! the RDP library in-process get this step for free.

use std::os::fd::AsRawFd as _;

use futures_util::StreamExt as _;
use rustix::fs::{MemfdFlags, SealFlags};
use zbus::Connection;

use crate::display_manager::{LoginSessionProxy, RemoteDisplayFactoryProxy};
use crate::pam_auth::PamAuthResult;
use crate::registry::{HandoverRegistry, RemoteClient, SessionFacts};

/// §4.9 step 4: `use_system_credentials = (client is mstsc-family) &&
/// !requested_rdstls`.
#[must_use]
pub fn decide_use_system_credentials(facts: &SessionFacts, requested_rdstls: bool) -> bool {
    facts.is_mstsc_family && !requested_rdstls
}

/// Pack `username:password` into an anonymous, sealed `memfd` for delivery
/// to the display manager's single-logon call. `memfd_create` FDs have no
/// backing path to unlink; sealing them read-only after the write is the
/// equivalent safeguard against the receiver (or a local attacker who
/// somehow gets the FD number) mutating the credential after handoff.
pub fn pack_credentials_shm(username: &str, password: &str) -> std::io::Result<std::os::fd::OwnedFd> {
    use std::io::{Seek as _, SeekFrom, Write as _};

    let fd = rustix::fs::memfd_create("rdp-handover-creds", MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING)?;
    let mut file = std::fs::File::from(fd);
    writeln!(file, "{username}:{password}")?;
    file.flush()?;
    file.seek(SeekFrom::Start(0))?;

    rustix::fs::fcntl_add_seals(
        &file,
        SealFlags::SEAL | SealFlags::SHRINK | SealFlags::GROW | SealFlags::WRITE,
    )?;

    Ok(file.into())
}

/// Drive step 4 for one client: invoke the appropriate display-manager
/// factory method, record the resulting login-session path, and spawn a
/// background watcher for `client_id` migration.
pub async fn drive_session_ready(
    bus: &Connection,
    registry: HandoverRegistry,
    client: std::sync::Arc<RemoteClient>,
    facts: SessionFacts,
    peer_ip: &str,
    single_logon_creds: Option<PamAuthResult>,
    password_for_single_logon: Option<String>,
) -> anyhow::Result<()> {
    let factory = RemoteDisplayFactoryProxy::new(bus).await?;

    let login_session_path = if let Some(creds) = single_logon_creds {
        let password = password_for_single_logon.unwrap_or_default();
        let fd = pack_credentials_shm(&creds.username, &password).map_err(|e| {
            tracing::warn!(error = %e, "failed to pack single-logon credentials, aborting handover");
            anyhow::anyhow!("failed to pack single-logon credentials: {e}")
        })?;

        factory
            .create_single_logon_session(
                &client.routing_token,
                facts.peer_width,
                facts.peer_height,
                zbus::zvariant::Fd::from(fd.as_raw_fd()),
                peer_ip,
            )
            .await?
    } else {
        factory
            .create_remote_greeter_display(&client.routing_token, facts.peer_width, facts.peer_height, peer_ip)
            .await?
    };

    client.set_lightdm_path(Some(login_session_path.to_string())).await;

    let bus = bus.clone();
    let old_token = client.routing_token.clone();
    tokio::spawn(async move {
        if let Err(e) = watch_client_id_migration(&bus, registry, &old_token, &login_session_path).await {
            tracing::warn!(error = %e, token = %old_token, "login session watcher exited");
        }
    });

    Ok(())
}

/// §9 "signal-driven state migration": when the login session's `client_id`
/// changes to a routing token different from the one we registered it
/// under, migrate the `RemoteClient` onto the new token.
async fn watch_client_id_migration(
    bus: &Connection,
    registry: HandoverRegistry,
    old_token: &str,
    session_path: &zbus::zvariant::OwnedObjectPath,
) -> anyhow::Result<()> {
    let proxy = LoginSessionProxy::builder(bus).path(session_path.clone())?.build().await?;
    let mut changes = proxy.receive_client_id_changed().await;

    while let Some(change) = changes.next().await {
        let Ok(new_token) = change.get().await else { continue };
        if new_token == old_token {
            continue;
        }

        tracing::info!(old_token, new_token, "login session client_id migrated, rebinding handover client");
        let Some(old) = registry.get(old_token).await else {
            break;
        };
        let Some(stream) = old.take_connection().await else {
            break;
        };

        if registry.replace_client_identity(old_token, &new_token, stream).await.is_some() {
            tracing::info!(old_token, new_token, "migrated RemoteClient to new routing token");
        }
        break;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mstsc_without_rdstls_uses_system_credentials() {
        let facts = SessionFacts { is_mstsc_family: true, peer_width: 1920, peer_height: 1080 };
        assert!(decide_use_system_credentials(&facts, false));
    }

    #[test]
    fn rdstls_requested_disables_system_credentials() {
        let facts = SessionFacts { is_mstsc_family: true, peer_width: 1920, peer_height: 1080 };
        assert!(!decide_use_system_credentials(&facts, true));
    }

    #[test]
    fn non_mstsc_client_disables_system_credentials() {
        let facts = SessionFacts { is_mstsc_family: false, peer_width: 1920, peer_height: 1080 };
        assert!(!decide_use_system_credentials(&facts, false));
    }

    #[test]
    fn packs_and_reads_back_credentials() {
        use std::io::{Read as _, Seek as _, SeekFrom};

        let fd = pack_credentials_shm("alice", "hunter2").unwrap();
        let mut file = std::fs::File::from(fd);
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = String::new();
        file.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "alice:hunter2\n");
    }
}
