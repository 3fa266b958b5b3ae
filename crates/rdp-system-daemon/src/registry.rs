use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng as _;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::routing_token::RoutingTokenInfo;

/// D-Bus object path prefix for per-client handover interfaces (§3/§6).
pub const HANDOVER_PATH_PREFIX: &str = "/org/deepin/RemoteDesktop1/HandoverSession";

/// Pending-queue bound (§3).
const MAX_PENDING: usize = 32;

/// Inactivity threshold after which an unassigned pending client is pruned
/// (§3/§4.9/§5).
const STALE_AFTER_SECS: u64 = 30;

fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A bound RDP session's facts relevant to the handover decision (§4.9 step
/// 4). The RDP protocol library that produces these is out of scope (§1);
/// this is the narrow boundary this repo owns.
#[derive(Debug, Clone, Default)]
pub struct SessionFacts {
    pub is_mstsc_family: bool,
    pub peer_width: u16,
    pub peer_height: u16,
}

/// One client tracked across its handover lifecycle (§3 `HandoverRegistry`).
pub struct RemoteClient {
    pub routing_token: String,
    pub object_path: String,
    pub peer_addr: String,

    connection: Mutex<Option<TcpStream>>,
    session: Mutex<Option<SessionFacts>>,
    lightdm_session_path: Mutex<Option<String>>,

    assigned: AtomicBool,
    handover_count: AtomicU32,
    last_activity_us: AtomicU64,
}

impl RemoteClient {
    fn new(routing_token: String, peer_addr: String, connection: TcpStream) -> Self {
        let object_path = format!("{HANDOVER_PATH_PREFIX}{routing_token}");
        Self {
            routing_token,
            object_path,
            peer_addr,
            connection: Mutex::new(Some(connection)),
            session: Mutex::new(None),
            lightdm_session_path: Mutex::new(None),
            assigned: AtomicBool::new(false),
            handover_count: AtomicU32::new(0),
            last_activity_us: AtomicU64::new(u64::try_from(now_us()).unwrap_or(0)),
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned.load(Ordering::SeqCst)
    }

    pub fn handover_count(&self) -> u32 {
        self.handover_count.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        self.last_activity_us
            .store(u64::try_from(now_us()).unwrap_or(0), Ordering::SeqCst);
    }

    fn idle_for_secs(&self) -> u64 {
        let last = self.last_activity_us.load(Ordering::SeqCst);
        let now = u64::try_from(now_us()).unwrap_or(0);
        now.saturating_sub(last) / 1_000_000
    }

    /// Swap in a new socket, e.g. when a known client reconnects before its
    /// session was ever attached (§4.9 step 2).
    pub async fn replace_connection(&self, connection: TcpStream) {
        *self.connection.lock().await = Some(connection);
        self.touch();
    }

    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn attach_session(&self, facts: SessionFacts) {
        *self.session.lock().await = Some(facts);
    }

    pub async fn detach_session(&self) -> Option<SessionFacts> {
        self.session.lock().await.take()
    }

    pub async fn session_facts(&self) -> Option<SessionFacts> {
        self.session.lock().await.clone()
    }

    pub async fn set_lightdm_path(&self, path: Option<String>) {
        *self.lightdm_session_path.lock().await = path;
    }

    pub async fn lightdm_path(&self) -> Option<String> {
        self.lightdm_session_path.lock().await.clone()
    }

    /// Take the socket out (e.g. to dup its FD for `TakeClient`, or to send
    /// a redirection PDU and close it locally).
    pub async fn take_connection(&self) -> Option<TcpStream> {
        self.connection.lock().await.take()
    }

    pub async fn has_connection(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Marks this client assigned so the dispatcher's FIFO skips it.
    /// Exposed beyond the registry because `StartHandover`'s has-session
    /// branch (spec.md:184) must set this directly, without going through
    /// `request_handover`'s pending-queue pop.
    pub fn mark_assigned(&self) {
        self.assigned.store(true, Ordering::SeqCst);
    }

    fn mark_unassigned(&self) {
        self.assigned.store(false, Ordering::SeqCst);
    }

    pub fn record_handover(&self) {
        self.handover_count.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("pending handover queue is full")]
    QueueFull,
    #[error("no client registered at path {0}")]
    NotFound(String),
}

struct Inner {
    clients: HashMap<String, Arc<RemoteClient>>,
    pending: VecDeque<String>,
}

/// §3 `HandoverRegistry`: `handover_path -> RemoteClient`, a FIFO of
/// not-yet-assigned clients, and the uniqueness/pruning invariants around
/// both. Mutated only from the D-Bus main-loop task (§5); cloning this
/// handle is cheap (it's an `Arc` around the real state).
#[derive(Clone)]
pub struct HandoverRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl Default for HandoverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandoverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Inner { clients: HashMap::new(), pending: VecDeque::new() })) }
    }

    /// Look up an already-registered client whose session handle is still
    /// null by routing token (§4.9 step 2).
    pub async fn find_reconnectable(&self, routing_token: &str) -> Option<Arc<RemoteClient>> {
        let inner = self.inner.lock().await;
        let client = inner.clients.get(routing_token)?;
        if client.has_session().await {
            None
        } else {
            Some(Arc::clone(client))
        }
    }

    pub async fn get(&self, routing_token: &str) -> Option<Arc<RemoteClient>> {
        self.inner.lock().await.clients.get(routing_token).cloned()
    }

    pub async fn get_by_path(&self, object_path: &str) -> Option<Arc<RemoteClient>> {
        let inner = self.inner.lock().await;
        inner.clients.values().find(|c| c.object_path == object_path).cloned()
    }

    /// Register a brand-new client (§4.9 step 3): reuse the peeked routing
    /// token if it's unique, otherwise mint a fresh one; push onto the
    /// pending queue after pruning stale entries.
    pub async fn register_new(
        &self,
        peer_addr: String,
        connection: TcpStream,
        peeked: &RoutingTokenInfo,
    ) -> Result<Arc<RemoteClient>, RegistryError> {
        let mut inner = self.inner.lock().await;
        prune_stale(&mut inner).await;

        let token = match &peeked.routing_token {
            Some(t) if !inner.clients.contains_key(t) && is_nonzero_decimal(t) => t.clone(),
            _ => fresh_token(&inner.clients),
        };

        if inner.pending.len() >= MAX_PENDING {
            return Err(RegistryError::QueueFull);
        }

        let client = Arc::new(RemoteClient::new(token.clone(), peer_addr, connection));
        inner.clients.insert(token.clone(), Arc::clone(&client));
        inner.pending.push_back(token);
        Ok(client)
    }

    /// §4.9 dispatcher `RequestHandover`: prune stale entries, pop the head
    /// of the pending queue, mark it assigned.
    pub async fn request_handover(&self) -> Option<String> {
        let mut inner = self.inner.lock().await;
        prune_stale(&mut inner).await;

        let token = inner.pending.pop_front()?;
        let client = inner.clients.get(&token)?.clone();
        client.mark_assigned();
        client.touch();
        Some(client.object_path.clone())
    }

    /// §4.9 `TakeClient`: re-enqueue after detaching, since the client may
    /// be handed over again later.
    pub async fn requeue(&self, routing_token: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(client) = inner.clients.get(routing_token) {
            client.mark_unassigned();
        }
        if !inner.pending.contains(&routing_token.to_string()) {
            inner.pending.push_back(routing_token.to_string());
        }
    }

    pub async fn remove(&self, routing_token: &str) -> Option<Arc<RemoteClient>> {
        let mut inner = self.inner.lock().await;
        inner.pending.retain(|t| t != routing_token);
        inner.clients.remove(routing_token)
    }

    /// All currently-registered handover paths, for the `SessionList`
    /// property invariant (§4.9).
    pub async fn session_list(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.clients.values().map(|c| c.object_path.clone()).collect()
    }

    /// Migrate an existing monitored client onto a new routing token and
    /// socket when the login-session `client_id` property changes
    /// (§4.9/§9 "signal-driven state migration").
    pub async fn replace_client_identity(
        &self,
        old_token: &str,
        new_token: &str,
        new_connection: TcpStream,
    ) -> Option<Arc<RemoteClient>> {
        let mut inner = self.inner.lock().await;
        let old = inner.clients.remove(old_token)?;
        inner.pending.retain(|t| t != old_token);

        let migrated = Arc::new(RemoteClient::new(new_token.to_string(), old.peer_addr.clone(), new_connection));
        if let Some(facts) = old.session_facts().await {
            migrated.attach_session(facts).await;
        }
        migrated.assigned.store(old.is_assigned(), Ordering::SeqCst);

        inner.clients.insert(new_token.to_string(), Arc::clone(&migrated));
        Some(migrated)
    }
}

async fn prune_stale(inner: &mut Inner) {
    let mut stale = Vec::new();
    for token in &inner.pending {
        if let Some(client) = inner.clients.get(token) {
            if !client.is_assigned() && client.idle_for_secs() >= STALE_AFTER_SECS {
                stale.push(token.clone());
            }
        }
    }
    for token in stale {
        inner.pending.retain(|t| t != &token);
        inner.clients.remove(&token);
    }
}

fn is_nonzero_decimal(s: &str) -> bool {
    s.parse::<u32>().is_ok_and(|v| v != 0)
}

fn fresh_token(existing: &HashMap<String, Arc<RemoteClient>>) -> String {
    let mut rng = rand::rng();
    loop {
        let candidate: u32 = rng.random();
        if candidate == 0 {
            continue;
        }
        let candidate = candidate.to_string();
        if !existing.contains_key(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn dummy_stream() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(client);
        server
    }

    #[tokio::test]
    async fn register_reuses_unique_peeked_token() {
        let registry = HandoverRegistry::new();
        let peeked = RoutingTokenInfo { requested_rdstls: true, routing_token: Some("17".into()) };
        let client = registry.register_new("1.2.3.4:1".into(), dummy_stream().await, &peeked).await.unwrap();
        assert_eq!(client.routing_token, "17");
        assert_eq!(client.object_path, format!("{HANDOVER_PATH_PREFIX}17"));
    }

    #[tokio::test]
    async fn register_mints_token_when_missing() {
        let registry = HandoverRegistry::new();
        let peeked = RoutingTokenInfo::default();
        let client = registry.register_new("1.2.3.4:1".into(), dummy_stream().await, &peeked).await.unwrap();
        assert!(client.routing_token.parse::<u32>().unwrap() > 0);
    }

    #[tokio::test]
    async fn request_handover_pops_fifo_and_marks_assigned() {
        let registry = HandoverRegistry::new();
        let peeked = RoutingTokenInfo { requested_rdstls: false, routing_token: Some("17".into()) };
        registry.register_new("a".into(), dummy_stream().await, &peeked).await.unwrap();

        let path = registry.request_handover().await.unwrap();
        assert_eq!(path, format!("{HANDOVER_PATH_PREFIX}17"));

        let client = registry.get("17").await.unwrap();
        assert!(client.is_assigned());
    }

    #[tokio::test]
    async fn request_handover_empty_queue_returns_none() {
        let registry = HandoverRegistry::new();
        assert!(registry.request_handover().await.is_none());
    }

    #[tokio::test]
    async fn queue_full_is_rejected() {
        let registry = HandoverRegistry::new();
        for i in 0..MAX_PENDING {
            let peeked = RoutingTokenInfo { requested_rdstls: false, routing_token: Some((i + 1).to_string()) };
            registry.register_new("a".into(), dummy_stream().await, &peeked).await.unwrap();
        }
        let peeked = RoutingTokenInfo { requested_rdstls: false, routing_token: Some((MAX_PENDING + 1).to_string()) };
        let err = registry.register_new("a".into(), dummy_stream().await, &peeked).await.unwrap_err();
        assert!(matches!(err, RegistryError::QueueFull));
    }
}
