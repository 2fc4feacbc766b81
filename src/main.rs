use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use code_relay::config::{ExtractionConfig, PollConfig, RelayConfig, ServerConfig};
use code_relay::error::ConfigError;
use code_relay::mailbox::{CodeExtractor, ImapConfig, ImapMailbox, MailboxPoller};
use code_relay::orchestrator::{CycleSettings, Orchestrator};
use code_relay::relay::{
    DeadLetterSink, JsonlDeadLetterSink, RelayForwarder, TracingDeadLetterSink,
};
use code_relay::server;
use code_relay::session::ChallengeSession;

const USAGE: &str = "usage: code-relay [serve|cycle]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _log_guard = init_tracing();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());
    let server_config = ServerConfig::from_env()?;

    eprintln!("Code Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mode: {mode}");
    eprintln!("   Challenge server: http://{}", server_config.bind);
    eprintln!(
        "   Session timeout: {}s",
        server_config.session_timeout.as_secs()
    );

    match mode.as_str() {
        "serve" => run_server(&server_config).await,
        "cycle" => {
            let code = run_cycle(&server_config).await?;
            drop(_log_guard);
            std::process::exit(code);
        }
        "-h" | "--help" | "help" => {
            eprintln!("{USAGE}");
            Ok(())
        }
        other => bail!("unknown mode {other:?}; {USAGE}"),
    }
}

/// Serve the challenge routes until Ctrl-C.
async fn run_server(config: &ServerConfig) -> anyhow::Result<()> {
    let session = ChallengeSession::new(config.session_timeout);
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    let shutdown_session = Arc::clone(&session);
    server::serve(listener, session, config.code_length, async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
        shutdown_session.stop();
    })
    .await?;
    Ok(())
}

/// Run one verification cycle with the challenge server alongside it.
/// Returns the process exit code.
async fn run_cycle(config: &ServerConfig) -> anyhow::Result<i32> {
    let extraction = ExtractionConfig::from_env(config.code_length)?;
    let relay_config = RelayConfig::from_env()?;
    let poll_config = PollConfig::from_env()?;
    let imap_config = ImapConfig::from_env()
        .ok_or_else(|| ConfigError::MissingEnvVar("MAILBOX_IMAP_HOST".into()))?;

    RelayForwarder::validate_target(&relay_config.target_url)?;

    eprintln!("   Relay target: {}", relay_config.target_url);
    eprintln!("   Mailbox: {}:{}", imap_config.host, imap_config.port);

    let sink: Arc<dyn DeadLetterSink> = match &relay_config.dead_letter_path {
        Some(path) => {
            eprintln!("   Dead letters: {}", path.display());
            Arc::new(JsonlDeadLetterSink::new(path.clone()))
        }
        None => Arc::new(TracingDeadLetterSink),
    };
    let forwarder = RelayForwarder::new(relay_config.request_timeout, sink)?;
    let poller = MailboxPoller::new(
        Arc::new(ImapMailbox::new(imap_config)),
        CodeExtractor::from_config(&extraction)?,
    );

    let since_grace = chrono::Duration::from_std(poll_config.since_grace)
        .unwrap_or_else(|_| chrono::Duration::zero());
    let triggered_at = Utc::now() - since_grace;

    let session = ChallengeSession::new(config.session_timeout);
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_handle = tokio::spawn(server::serve(
        listener,
        Arc::clone(&session),
        config.code_length,
        async move {
            let _ = stop_rx.await;
        },
    ));

    let orchestrator = Orchestrator::new(
        poller,
        forwarder,
        CycleSettings::new(poll_config, &relay_config),
    )
    .with_session(Arc::clone(&session));

    let result = tokio::select! {
        result = orchestrator.run_cycle(triggered_at) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; stopping session");
            session.stop();
            let _ = stop_tx.send(());
            let _ = server_handle.await;
            return Ok(130);
        }
    };

    session.stop();
    let _ = stop_tx.send(());
    if let Ok(Err(e)) = server_handle.await {
        error!(error = %e, "Challenge server exited with an error");
    }

    match result {
        Ok(report) => {
            info!(
                session_id = ?report.session_id,
                source = %report.source,
                polls = report.polls,
                relay_attempts = report.relay_attempts.len(),
                "Code delivered"
            );
            Ok(0)
        }
        Err(e) => {
            error!(error = %e, exit_code = e.exit_code(), "Verification cycle failed");
            Ok(e.exit_code())
        }
    }
}

/// Stderr logging, plus a daily-rolled file when `RELAY_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match std::env::var("RELAY_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "code-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}
