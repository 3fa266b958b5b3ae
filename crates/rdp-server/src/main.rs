mod dbus;
mod egfx;
mod graphics_pipeline;
mod rdpgfx;
mod server;
mod tls;

use std::net::SocketAddr;

use anyhow::{Context as _, Result};
use clap::Parser as _;
use rdp_dbus::config::{Cli, Config, NlaMode};
use rdp_dbus::server::{DaemonCommand, RdpServerState};
use rdp_encode::EncodingMode;
use rdp_input::{InputDispatcher, X11rbConnection};

use server::AuthCredentials;

/// User-mode RDP server: unlike `rdp-system-daemon`, this binary owns the
/// RDP handshake itself end to end and drives the desktop directly, so it
/// has no default config path of its own to fall back to.
const DEFAULT_CONFIG_PATH: &str = "/etc/rdp-server/config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::load(cli.config.as_deref(), std::path::Path::new(DEFAULT_CONFIG_PATH))?;
    cfg.apply_cli(&cli);
    cfg.validate()?;

    let bind_addr: SocketAddr = format!("{}:{}", cfg.server.bind_address, cfg.server.port)
        .parse()
        .context("invalid bind address")?;

    let tls_ctx = match (&cfg.tls.certificate, &cfg.tls.private_key) {
        (Some(cert), Some(key)) => tls::load_from_files(cert, key)?,
        _ => tls::generate_self_signed(bind_addr.ip())?,
    };

    let auth = match cfg.auth.mode {
        NlaMode::Static => match (&cfg.auth.username, &cfg.auth.password) {
            (Some(username), Some(password)) => {
                Some(AuthCredentials { username: username.clone(), password: password.clone(), domain: None })
            }
            _ => None,
        },
        // Delegated NLA is brokered by `rdp-system-daemon`'s handover flow;
        // this binary only ever sees it after the socket has already been
        // accepted, so it plays TLS-only here.
        NlaMode::Delegate => None,
    };

    let encoding_mode = match cfg.encoding.mode.as_str() {
        "raw" => EncodingMode::Raw,
        "rfx" => EncodingMode::Rfx,
        other => {
            tracing::warn!(mode = other, "unknown encoding.mode, defaulting to rfx");
            EncodingMode::Rfx
        }
    };

    tracing::info!(%bind_addr, mode = cfg.encoding.mode, "starting rdp-server");

    let state = RdpServerState::new(bind_addr.to_string());
    let (conn, mut cmd_rx) = dbus::start_dbus_server(state.clone()).await?;

    let width = u16::try_from(cfg.capture.width).unwrap_or(1920);
    let height = u16::try_from(cfg.capture.height).unwrap_or(1080);
    let (egfx_factory, egfx_controller, egfx_event_setter) = egfx::create_egfx(width, height);

    let display = server::LiveDisplay::new(width, height, None, encoding_mode, egfx_controller);

    let mut rdp_server = match X11rbConnection::connect(None) {
        Ok(x11_conn) => {
            let mut dispatcher = InputDispatcher::new();
            dispatcher.start(x11_conn);
            let input_handler = server::LiveInputHandler::new(dispatcher);
            tracing::info!("input injection active (X11/XTest)");
            server::build_live_server(
                bind_addr,
                &tls_ctx,
                auth.as_ref(),
                display,
                input_handler,
                None,
                None,
                Some(Box::new(egfx_factory)),
            )
        }
        Err(err) => {
            tracing::warn!(%err, "failed to open X11 display for input injection, running view-only");
            server::build_view_only_server(bind_addr, &tls_ctx, auth.as_ref(), display, None, None, Some(Box::new(egfx_factory)))
        }
    };

    egfx_event_setter.set_event_sender(rdp_server.event_sender());

    state.set_running().await;
    tracing::info!(bus = rdp_dbus::constants::SERVICE_NAME, "D-Bus status interface ready");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = rdp_server.run() => {
            state.set_error().await;
            result.context("RDP server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
        cmd = cmd_rx.recv() => {
            match cmd {
                Some(DaemonCommand::Stop) => tracing::info!("stop requested over D-Bus"),
                Some(DaemonCommand::Reload) => tracing::info!("reload requested over D-Bus (not yet applied, restart required)"),
                None => {}
            }
        }
    }

    state.set_stopped().await;
    conn.graceful_shutdown().await;
    Ok(())
}
