//! D-Bus proxies for the external collaborators the system daemon drives
//! (§6 "External collaborators invoked by the daemon"). Only the interface
//! shape is specified; the display manager and `login1` are out of scope.

use zbus::proxy;

/// `org.deepin.DisplayManager.RemoteDisplayFactory` at
/// `/org/deepin/DisplayManager/RemoteDisplayFactory`.
#[proxy(
    interface = "org.deepin.DisplayManager.RemoteDisplayFactory",
    default_service = "org.deepin.DisplayManager",
    default_path = "/org/deepin/DisplayManager/RemoteDisplayFactory"
)]
pub trait RemoteDisplayFactory {
    /// Creates a greeter session the user logs into normally once
    /// redirected (§4.9 step 4, non-single-logon branch).
    fn create_remote_greeter_display(
        &self,
        routing_token: &str,
        width: u16,
        height: u16,
        peer_ip: &str,
    ) -> zbus::Result<zbus::zvariant::OwnedObjectPath>;

    /// Creates a session pre-authenticated with PAM-validated credentials
    /// delivered via shared-memory FD (§4.9 step 4, single-logon branch).
    fn create_single_logon_session(
        &self,
        routing_token: &str,
        width: u16,
        height: u16,
        auth_fd: zbus::zvariant::Fd<'_>,
        peer_ip: &str,
    ) -> zbus::Result<zbus::zvariant::OwnedObjectPath>;
}

/// The login session object returned by either `RemoteDisplayFactory`
/// method. `client_id` is watched for migration (§4.9/§9): it changes when
/// the login session's underlying RDP connection gets re-established under
/// a different routing token (e.g. after a `StartHandover` redirect).
#[proxy(interface = "org.deepin.RemoteDesktop1.LoginSession", default_service = "org.deepin.DisplayManager")]
pub trait LoginSession {
    #[zbus(property)]
    fn client_id(&self) -> zbus::Result<String>;
}

/// `org.freedesktop.login1.Manager`, used to enumerate/terminate sessions
/// for cleanup and to distinguish remote vs. local logins.
#[proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
pub trait Login1Manager {
    fn list_sessions(&self) -> zbus::Result<Vec<(String, u32, String, String, zbus::zvariant::OwnedObjectPath)>>;
    fn terminate_session(&self, session_id: &str) -> zbus::Result<()>;
}

/// Per-session properties on `org.freedesktop.login1.Session`.
#[proxy(interface = "org.freedesktop.login1.Session", default_service = "org.freedesktop.login1")]
pub trait Login1Session {
    #[zbus(property)]
    fn type_(&self) -> zbus::Result<String>;
    #[zbus(property)]
    fn remote(&self) -> zbus::Result<bool>;
}
