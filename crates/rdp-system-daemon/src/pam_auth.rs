use pam_client::conv_mock::Conversation;
use pam_client::{Context, Flag};

use crate::error::DaemonError;

/// Result of a successful PAM authentication.
#[derive(Debug)]
pub struct PamAuthResult {
    pub username: String,
    pub uid: u32,
}

/// Authenticate a user via PAM, then verify the account is valid (not
/// locked/expired) with `acct_mgmt` (§6: "PAM for local credential
/// validation"; §7: failures map to `PermissionDenied`).
///
/// PAM's C API is synchronous and blocking; the conversation runs on a
/// blocking thread so it never stalls the D-Bus main loop (§5).
pub async fn authenticate(service: &str, username: &str, password: &str) -> Result<PamAuthResult, DaemonError> {
    let service = service.to_string();
    let username = username.to_string();
    let password = password.to_string();

    tokio::task::spawn_blocking(move || authenticate_blocking(&service, &username, &password))
        .await
        .map_err(|e| DaemonError::Failed(format!("PAM task panicked: {e}")))?
}

fn authenticate_blocking(service: &str, username: &str, password: &str) -> Result<PamAuthResult, DaemonError> {
    let conversation = Conversation::with_credentials(username, password);
    let mut context = Context::new(service, Some(username), conversation)
        .map_err(|e| DaemonError::Failed(format!("PAM context init failed: {e}")))?;

    context
        .authenticate(Flag::NONE)
        .map_err(|e| DaemonError::PermissionDenied(format!("PAM authenticate failed: {e}")))?;
    context
        .acct_mgmt(Flag::NONE)
        .map_err(|e| DaemonError::PermissionDenied(format!("PAM account invalid: {e}")))?;

    let uid = nix::unistd::User::from_name(username)
        .map_err(|e| DaemonError::Failed(format!("user lookup failed: {e}")))?
        .ok_or_else(|| DaemonError::PermissionDenied(format!("user '{username}' not found")))?
        .uid
        .as_raw();

    tracing::info!(username, uid, "PAM authentication succeeded");
    Ok(PamAuthResult { username: username.to_string(), uid })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_service_fails_closed() {
        // There's no real PAM stack to authenticate against in a unit test
        // sandbox; this only asserts the call surfaces an error rather than
        // panicking or silently succeeding.
        let result = authenticate("nonexistent-pam-service-xyz", "nobody", "wrong").await;
        assert!(result.is_err());
    }
}
