use std::path::PathBuf;

use rdp_dbus::AuthToken;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::OwnedFd;
use zbus::{fdo, interface};

use crate::error::DaemonError;
use crate::registry::{HandoverRegistry, RemoteClient};

/// `org.deepin.RemoteDesktop1` at `/org/deepin/RemoteDesktop1` (common
/// interface, always present regardless of runtime mode).
pub struct CommonInterface {
    pub runtime_mode: &'static str,
}

#[interface(name = "org.deepin.RemoteDesktop1")]
impl CommonInterface {
    #[zbus(property)]
    fn runtime_mode(&self) -> &str {
        self.runtime_mode
    }

    #[zbus(property)]
    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }
}

/// `org.deepin.RemoteDesktop1.RemoteLogin`, same object path.
pub struct RemoteLoginInterface {
    pub registry: HandoverRegistry,
    pub port: u16,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
    pub tls_fingerprint: String,
    pub nla_auth_enabled: bool,
    pub auto_logout_on_disconnect: bool,
}

#[interface(name = "org.deepin.RemoteDesktop1.RemoteLogin")]
impl RemoteLoginInterface {
    /// Dispatcher entry point: pop the pending queue and hand the caller
    /// the object path of the next client to service.
    async fn request_handover(&self) -> fdo::Result<zbus::zvariant::OwnedObjectPath> {
        let path = self
            .registry
            .request_handover()
            .await
            .ok_or_else(|| DaemonError::Failed("no pending handover client".into()))?;
        zbus::zvariant::OwnedObjectPath::try_from(path).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    async fn request_port(&self) -> i32 {
        i32::from(self.port)
    }

    async fn enable_remote_login(&self, _enabled: bool) -> fdo::Result<()> {
        Err(DaemonError::NotSupported("EnableRemoteLogin".into()).into())
    }

    async fn get_credentials(&self) -> fdo::Result<(String, String)> {
        Err(DaemonError::NotSupported("GetCredentials".into()).into())
    }

    async fn set_credentials(&self, _username: String, _password: String) -> fdo::Result<()> {
        Err(DaemonError::NotSupported("SetCredentials".into()).into())
    }

    async fn enable_nla_auth(&self, _enabled: bool) -> fdo::Result<()> {
        Err(DaemonError::NotSupported("EnableNlaAuth".into()).into())
    }

    async fn enable_auto_logout_rdp_disconnect(&self, _enabled: bool) -> fdo::Result<()> {
        Err(DaemonError::NotSupported("EnableAutoLogoutRdpDisconnect".into()).into())
    }

    async fn gen_nla_credential(&self) -> fdo::Result<(String, String)> {
        Err(DaemonError::NotSupported("GenNlaCredential".into()).into())
    }

    #[zbus(property)]
    async fn enabled(&self) -> bool {
        true
    }

    #[zbus(property)]
    async fn port(&self) -> u16 {
        self.port
    }

    #[zbus(property)]
    async fn tls_cert(&self) -> String {
        self.tls_cert_path.display().to_string()
    }

    #[zbus(property)]
    async fn tls_key(&self) -> String {
        self.tls_key_path.display().to_string()
    }

    #[zbus(property)]
    async fn tls_fingerprint(&self) -> String {
        self.tls_fingerprint.clone()
    }

    #[zbus(property)]
    async fn nla_auth_enabled(&self) -> bool {
        self.nla_auth_enabled
    }

    #[zbus(property)]
    async fn auto_logout_on_disconnect(&self) -> bool {
        self.auto_logout_on_disconnect
    }

    /// Always reflects the registry's current key set.
    #[zbus(property)]
    async fn session_list(&self) -> Vec<zbus::zvariant::OwnedObjectPath> {
        self.registry
            .session_list()
            .await
            .into_iter()
            .filter_map(|p| zbus::zvariant::OwnedObjectPath::try_from(p).ok())
            .collect()
    }
}

/// Per-client `org.deepin.RemoteDesktop1.RdpHandover`, published dynamically
/// at `HANDOVER_PATH_PREFIX<token>`.
pub struct HandoverSessionInterface {
    pub registry: HandoverRegistry,
    pub routing_token: String,
    pub peer_ip: String,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
}

#[interface(name = "org.deepin.RemoteDesktop1.RdpHandover")]
impl HandoverSessionInterface {
    /// Parse the one-time auth token, load TLS material, and either
    /// redirect an already-bound client in place or signal a fresh one to
    /// reconnect.
    ///
    /// This does not PAM-authenticate `one_time_auth_token`'s credentials:
    /// that token is this session's own handover secret, not a login
    /// attempt. The PAM check in this daemon lives in `main.rs`, against a
    /// different credential (the static NLA username/password from config),
    /// per §4.9 step 4.
    async fn start_handover(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
        one_time_auth_token: String,
    ) -> fdo::Result<(String, String)> {
        let mut token =
            AuthToken::parse(&one_time_auth_token).map_err(|e| DaemonError::InvalidArgument(e.to_string()))?;
        let username = token.username.clone();
        token.secure_free();

        let Some(client) = self.registry.get(&self.routing_token).await else {
            return Err(DaemonError::Failed("client no longer registered".into()).into());
        };

        let cert_pem = std::fs::read_to_string(&self.tls_cert_path)
            .map_err(|e| DaemonError::Failed(format!("failed to read TLS certificate: {e}")))?;
        let key_pem = std::fs::read_to_string(&self.tls_key_path)
            .map_err(|e| DaemonError::Failed(format!("failed to read TLS private key: {e}")))?;

        if client.has_session().await {
            tracing::info!(
                token = %self.routing_token,
                username,
                "redirecting attached session, detaching and closing local connection"
            );
            detach_and_close_for_redirect(&client).await;
        } else {
            tracing::info!(token = %self.routing_token, username, "signalling fresh client to redirect");
        }

        // Writing a Server Redirection PDU straight onto an already-attached
        // client's own socket would need the RDP protocol library linked
        // into this daemon, which §1 puts out of scope for this crate; both
        // branches redirect through the one mechanism this daemon actually
        // owns, the same signal `drd_system_daemon.c`'s `on_start_handover`
        // emits unconditionally.
        Self::redirect_client(&emitter, &self.routing_token, &one_time_auth_token)
            .await
            .map_err(|e| DaemonError::Failed(e.to_string()))?;

        Ok((cert_pem, key_pem))
    }

    /// Dup the client's socket FD out to the caller, detach its session, and
    /// release our local handle to it (spec.md:185).
    async fn take_client(&self) -> fdo::Result<OwnedFd> {
        let Some(client) = self.registry.get(&self.routing_token).await else {
            return Err(DaemonError::Failed("client no longer registered".into()).into());
        };

        let Some(stream) = client.take_connection().await else {
            self.registry.remove(&self.routing_token).await;
            return Err(DaemonError::Failed("client has no live connection".into()).into());
        };

        let duped: std::os::fd::OwnedFd =
            rustix::io::dup(&stream).map_err(|e| DaemonError::Failed(format!("dup failed: {e}")))?.into();
        drop(stream); // closes this process's end; the dup'd fd lives on.

        client.detach_session().await;
        client.record_handover();
        self.registry.requeue(&self.routing_token).await;

        Ok(OwnedFd::from(duped))
    }

    async fn get_system_credentials(&self) -> fdo::Result<(String, String)> {
        Err(DaemonError::NotSupported("GetSystemCredentials".into()).into())
    }

    #[zbus(property)]
    async fn ip(&self) -> String {
        self.peer_ip.clone()
    }

    #[zbus(signal)]
    async fn redirect_client(emitter: &SignalEmitter<'_>, routing_token: &str, auth_token: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn take_client_ready(emitter: &SignalEmitter<'_>, use_system_credentials: bool) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn restart_handover(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;
}

/// The local state mutations `StartHandover`'s has-session branch owns
/// (spec.md:184): detach the session, close the connection this daemon is
/// still holding, and mark the client assigned so it is not redispatched by
/// `RequestHandover` mid-redirect. Split out of `start_handover` so it is
/// testable without standing up a live zbus connection for a
/// `SignalEmitter`.
async fn detach_and_close_for_redirect(client: &RemoteClient) {
    client.detach_session().await;
    if let Some(stream) = client.take_connection().await {
        drop(stream);
    }
    client.mark_assigned();
    client.record_handover();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionFacts;
    use crate::routing_token::RoutingTokenInfo;
    use tokio::net::{TcpListener, TcpStream};

    async fn dummy_stream() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(client);
        server
    }

    fn interface(registry: HandoverRegistry, routing_token: &str) -> HandoverSessionInterface {
        HandoverSessionInterface {
            registry,
            routing_token: routing_token.to_string(),
            peer_ip: "127.0.0.1".into(),
            tls_cert_path: PathBuf::from("/nonexistent/cert.pem"),
            tls_key_path: PathBuf::from("/nonexistent/key.pem"),
        }
    }

    #[tokio::test]
    async fn redirect_sequence_detaches_closes_and_marks_assigned_with_session() {
        let registry = HandoverRegistry::new();
        let peeked = RoutingTokenInfo { requested_rdstls: false, routing_token: Some("9".into()) };
        let client = registry.register_new("1.2.3.4:1".into(), dummy_stream().await, &peeked).await.unwrap();
        client.attach_session(SessionFacts::default()).await;

        detach_and_close_for_redirect(&client).await;

        assert!(!client.has_session().await);
        assert!(!client.has_connection().await);
        assert!(client.is_assigned());
        assert_eq!(client.handover_count(), 1);
    }

    #[tokio::test]
    async fn take_client_detaches_session_and_requeues() {
        let registry = HandoverRegistry::new();
        let peeked = RoutingTokenInfo { requested_rdstls: false, routing_token: Some("21".into()) };
        let client = registry.register_new("1.2.3.4:1".into(), dummy_stream().await, &peeked).await.unwrap();
        client.attach_session(SessionFacts::default()).await;
        registry.request_handover().await;
        assert!(client.is_assigned());

        let iface = interface(registry.clone(), "21");
        let fd = iface.take_client().await.unwrap();
        drop(fd);

        assert!(!client.has_session().await);
        assert!(!client.is_assigned());
        assert!(!client.has_connection().await);
    }

    #[tokio::test]
    async fn take_client_on_unknown_token_fails() {
        let registry = HandoverRegistry::new();
        let iface = interface(registry, "missing-token");
        let err = iface.take_client().await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::Failed(_)));
    }
}
