use hipchat::{Client, ClientConfig, Error, SessionEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// Print startup diagnostics to stderr for debugging.
fn print_startup_diagnostics(config: &ClientConfig) {
    eprintln!("hipchat-bot v{} (build {})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
    eprintln!("Platform: {} / {}", std::env::consts::OS, std::env::consts::ARCH);
    eprintln!("JID: {}/{}", config.jid(), config.resource);
    eprintln!(
        "Server: {}",
        config.server.as_deref().unwrap_or("(SRV lookup on host)")
    );
    eprintln!("Auth: {:?}", config.auth_mode);
    eprintln!("---");
}

fn required_env(key: &str) -> hipchat::Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::Config(format!("{} is not set", key)))
}

/// Directory given with `--log-dir=DIR`, if any.
fn log_dir_arg(args: &[String]) -> Option<std::path::PathBuf> {
    args.iter()
        .find_map(|arg| arg.strip_prefix("--log-dir=").map(std::path::PathBuf::from))
}

/// Join the configured room and answer mentions until closed or disconnected.
async fn run_bot(config: ClientConfig) -> hipchat::Result<()> {
    let room = required_env("HIPCHAT_ROOM")?;
    let nickname = required_env("HIPCHAT_NICKNAME")?;
    let mention = std::env::var("HIPCHAT_MENTION").unwrap_or_else(|_| nickname.clone());
    let trigger = format!("@{}", mention);

    let (client, mut events) = Client::connect(config).await?;
    client.status("chat").await?;
    client.join(&room, &nickname, 0).await?;
    info!(jid = %client.jid(), room = %room, "Bot ready");

    loop {
        tokio::select! {
            message = events.messages.recv() => {
                let Some(message) = message else {
                    info!("Message stream closed");
                    break;
                };
                debug!(from = %message.from, body = %message.body, "Message");
                if message.body.starts_with(&trigger) {
                    if let Err(e) = client.say(&room, "Hello", &[]).await {
                        warn!(error = %e, "Reply failed");
                    }
                }
            }
            rooms = events.rooms.recv() => {
                if let Some(rooms) = rooms {
                    info!(count = rooms.len(), "Room list received");
                }
            }
            users = events.users.recv() => {
                if let Some(users) = users {
                    info!(count = users.len(), "User list received");
                }
            }
            event = events.session.recv() => match event {
                Ok(SessionEvent::Reconnected) => info!("Session reconnected"),
                Ok(SessionEvent::Disconnected { reason }) => {
                    return Err(Error::Connect(reason));
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Session events lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                client.close().await;
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // Parse CLI flags early, before tracing subscriber init
    let args: Vec<String> = std::env::args().collect();
    let dangerous_insecure_tls = args.iter().any(|arg| arg == "--dangerous-insecure-tls");

    if dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    // --verbose / -v (lifecycle only) or --verbose=xmpp (with wire stanzas)
    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    let verbose = verbose_level.is_some();

    let log_dir_override = log_dir_arg(&args);

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        eprintln!("hipchat-bot v{} (build {})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
        eprintln!();
        eprintln!("Usage: hipchat-bot [OPTIONS]");
        eprintln!();
        eprintln!("Options:");
        eprintln!("  -v, --verbose         Enable verbose logging to stderr (no XMPP traffic)");
        eprintln!("      --verbose=xmpp    Enable verbose logging including XMPP stanzas");
        eprintln!("      --log-dir=DIR     Override log directory (default: platform data dir)");
        eprintln!("      --dangerous-insecure-tls");
        eprintln!("                        Disable TLS certificate verification (INSECURE!)");
        eprintln!("  -h, --help            Show this help message");
        eprintln!();
        eprintln!("Environment variables:");
        eprintln!("  HIPCHAT_USER, HIPCHAT_PASSWORD   Credentials (required)");
        eprintln!("  HIPCHAT_ROOM, HIPCHAT_NICKNAME   Room to join and nickname (required)");
        eprintln!("  HIPCHAT_MENTION                  Mention name to answer (default: nickname)");
        eprintln!("  HIPCHAT_RESOURCE, HIPCHAT_HOST, HIPCHAT_CONF_HOST, HIPCHAT_SERVER, HIPCHAT_AUTH_MODE");
        eprintln!("  RUST_LOG                         Override log filter (e.g. RUST_LOG=debug)");
        std::process::exit(0);
    }

    let log_dir = log_dir_override.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("hipchat-bot")
            .join("logs")
    });

    // File log always; stderr only when asked for.
    {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
        }

        let file_filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new("hipchat=info,hipchat_bot=info,info")
        };

        let file_appender = tracing_appender::rolling::daily(&log_dir, "hipchat.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(file_filter);

        let stderr_layer = if verbose || std::env::var("RUST_LOG").is_ok() {
            let stderr_filter = if std::env::var("RUST_LOG").is_ok() {
                EnvFilter::from_default_env()
            } else if verbose_level == Some("xmpp") {
                EnvFilter::new("hipchat=info,hipchat::xmpp=debug,hipchat::negotiator=debug,hipchat::supervisor=debug,hipchat_bot=debug,info")
            } else {
                EnvFilter::new("hipchat=info,hipchat_bot=info,info")
            };

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(stderr_filter),
            )
        } else {
            None
        };

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .init();

        // The background writer must outlive main.
        std::mem::forget(guard);

        eprintln!("Log file: {}", log_dir.display());
    }

    let mut config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };
    config.tls_insecure = dangerous_insecure_tls;

    if verbose {
        print_startup_diagnostics(&config);
    }

    if let Err(e) = run_bot(config).await {
        error!(error = %e, "Bot stopped");
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
