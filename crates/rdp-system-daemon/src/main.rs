mod config;
mod dbus_iface;
mod display_manager;
mod error;
mod negotiator;
mod pam_auth;
mod registry;
mod routing_token;
mod session_flow;
mod tls_material;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use config::{Cli, Config, NlaMode};
use dbus_iface::{CommonInterface, HandoverSessionInterface, RemoteLoginInterface};
use negotiator::{SessionNegotiator, TlsOnlyNegotiator};
use registry::HandoverRegistry;

/// System-mode RDP handover daemon: owns the listening socket, peeks the
/// routing token off each connection, and brokers the rest over D-Bus to
/// whatever process ends up driving that session.
const BUS_NAME: &str = "org.deepin.RemoteDesktop1";
const OBJECT_PATH: &str = "/org/deepin/RemoteDesktop1";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::load(cli.config.as_deref(), std::path::Path::new(config::DEFAULT_CONFIG_PATH))?;
    cfg.apply_cli(&cli);
    cfg.validate()?;

    let bind_ip: std::net::IpAddr =
        cfg.server.bind_address.parse().unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    tls_material::ensure_tls_material(&mut cfg, bind_ip)?;

    tracing::info!(
        bind = %cfg.server.bind_address,
        port = cfg.server.port,
        system = cfg.service.system,
        rdp_sso = cfg.service.rdp_sso,
        "starting rdp-system-daemon"
    );

    let registry = HandoverRegistry::new();
    let shutdown = CancellationToken::new();

    let conn = zbus::connection::Builder::system()
        .context("failed to connect to system D-Bus")?
        .name(BUS_NAME)
        .context("failed to request handover D-Bus name")?
        .serve_at(
            OBJECT_PATH,
            CommonInterface { runtime_mode: if cfg.service.system { "system" } else { "user" } },
        )
        .context("failed to serve common interface")?
        .serve_at(
            OBJECT_PATH,
            RemoteLoginInterface {
                registry: registry.clone(),
                port: cfg.server.port,
                tls_cert_path: cfg.tls.certificate.clone().expect("ensured above"),
                tls_key_path: cfg.tls.private_key.clone().expect("ensured above"),
                tls_fingerprint: String::new(),
                nla_auth_enabled: cfg.auth.mode == config::NlaMode::Delegate,
                auto_logout_on_disconnect: true,
            },
        )
        .context("failed to serve remote-login interface")?
        .build()
        .await
        .context("failed to build handover D-Bus connection")?;

    tracing::info!(bus_name = BUS_NAME, object_path = OBJECT_PATH, "acquired D-Bus name, daemon ready");

    let listener = TcpListener::bind((cfg.server.bind_address.as_str(), cfg.server.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening for RDP connections");

    let accept_count = Arc::new(AtomicUsize::new(0));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                tracing::info!("shutdown requested, stopping accept loop");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                shutdown.cancel();
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                shutdown.cancel();
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let id = accept_count.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(id, %peer_addr, "accepted connection, peeking routing token");

                let conn = conn.clone();
                let registry = registry.clone();
                let cert_path = cfg.tls.certificate.clone().expect("ensured above");
                let key_path = cfg.tls.private_key.clone().expect("ensured above");
                let pam_service = cfg.pam_service().to_string();
                let auth_mode = cfg.auth.mode;
                let static_username = cfg.auth.username.clone();
                let static_password = cfg.auth.password.clone();
                let capture_width = u16::try_from(cfg.capture.width).unwrap_or(1920);
                let capture_height = u16::try_from(cfg.capture.height).unwrap_or(1080);
                let cancel = shutdown.child_token();

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(
                        stream,
                        peer_addr.to_string(),
                        conn,
                        registry,
                        cert_path,
                        key_path,
                        pam_service,
                        auth_mode,
                        static_username,
                        static_password,
                        capture_width,
                        capture_height,
                        cancel,
                    )
                    .await
                    {
                        tracing::warn!(error = %e, %peer_addr, "connection setup failed");
                    }
                });
            }
        }
    }

    conn.graceful_shutdown().await;
    Ok(())
}

/// Peek the connection's routing token, register (or reattach) it in the
/// handover registry, and publish its per-client D-Bus object so the
/// display manager can drive `StartHandover`/`TakeClient` against it.
#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    peer_addr: String,
    conn: zbus::Connection,
    registry: HandoverRegistry,
    cert_path: std::path::PathBuf,
    key_path: std::path::PathBuf,
    pam_service: String,
    auth_mode: NlaMode,
    static_username: Option<String>,
    static_password: Option<String>,
    capture_width: u16,
    capture_height: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let peeked = match routing_token::peek(&stream, &cancel).await {
        Ok(info) => info,
        Err(e) => {
            tracing::debug!(error = %e, %peer_addr, "routing token peek failed, treating as non-handover client");
            routing_token::RoutingTokenInfo::default()
        }
    };

    if let Some(token) = &peeked.routing_token {
        if let Some(existing) = registry.find_reconnectable(token).await {
            tracing::info!(token, %peer_addr, "known client reconnected before session attach");
            existing.replace_connection(stream).await;
            return Ok(());
        }
    }

    let client = registry.register_new(peer_addr.clone(), stream, &peeked).await?;
    let peer_ip = peer_addr.rsplit_once(':').map_or_else(|| peer_addr.clone(), |(ip, _)| ip.to_string());

    conn.object_server()
        .at(
            client.object_path.clone(),
            HandoverSessionInterface {
                registry: registry.clone(),
                routing_token: client.routing_token.clone(),
                peer_ip: peer_ip.clone(),
                tls_cert_path: cert_path,
                tls_key_path: key_path,
            },
        )
        .await?;

    tracing::info!(token = %client.routing_token, path = %client.object_path, "published pending handover client");

    // §4.9 step 3/4: drive the "ready callback" in-process for the default
    // TLS-only negotiator, then bind facts and ask the display manager for
    // a session. The real RDP handshake (NLA, capability exchange) stays
    // with whichever process ends up owning the socket after handover; see
    // `session_flow` for why this is a no-op under the default negotiator.
    let negotiator = TlsOnlyNegotiator { default_width: capture_width, default_height: capture_height };
    let Some(stream) = client.take_connection().await else {
        return Ok(());
    };
    let facts = match negotiator.negotiate(stream).await {
        Ok((stream, facts)) => {
            client.replace_connection(stream).await;
            facts
        }
        Err(e) => {
            tracing::debug!(error = %e, token = %client.routing_token, "session negotiation failed");
            return Ok(());
        }
    };
    client.attach_session(facts.clone()).await;

    let single_logon_creds = if auth_mode == NlaMode::Static {
        match (&static_username, &static_password) {
            (Some(username), Some(password)) => match pam_auth::authenticate(&pam_service, username, password).await {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::warn!(error = %e, "static NLA credential PAM authentication failed, falling back to greeter");
                    None
                }
            },
            _ => None,
        }
    } else {
        None
    };
    let password_for_single_logon = single_logon_creds.is_some().then(|| static_password.unwrap_or_default());

    tokio::spawn(async move {
        if let Err(e) = session_flow::drive_session_ready(
            &conn,
            registry,
            client,
            facts,
            &peer_ip,
            single_logon_creds,
            password_for_single_logon,
        )
        .await
        {
            tracing::warn!(error = %e, %peer_addr, "session-ready handling failed");
        }
    });

    Ok(())
}
