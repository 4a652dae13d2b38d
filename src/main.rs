use anyhow::{Context, Result};
use interview_session::integration::{Notification, OrchestratorBuilder, SessionConfig, UserAction};
use std::sync::Arc;
use std::io::BufRead;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "Commands: mic | code <text> | submit | ack | end | exit";

fn load_config() -> Result<SessionConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("INTERVIEW_CONFIG").ok());

    let mut config = match path {
        Some(path) => SessionConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => SessionConfig::default(),
    };

    if let Ok(session_id) = std::env::var("INTERVIEW_SESSION_ID") {
        config.session_id = session_id;
    }
    if let Ok(token) = std::env::var("INTERVIEW_TOKEN") {
        config.auth_token = Some(token);
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn parse_action(line: &str) -> Option<UserAction> {
    let line = line.trim();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "mic" => Some(UserAction::ToggleMicrophone),
        "code" => Some(UserAction::UpdateCode(rest.replace("\\n", "\n"))),
        "submit" => Some(UserAction::SubmitCode),
        "ack" => Some(UserAction::AcknowledgeInstructions),
        "end" => Some(UserAction::EndInterview),
        "exit" => Some(UserAction::Exit),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "interview_session=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config()?;
    info!("Starting interview session client for {}", config.server_address);

    let (orchestrator, handle) = OrchestratorBuilder::new().with_config(config).build()?;
    let session = orchestrator.start().await?;

    let notifications = handle.notification_receiver();
    let printer = handle.clone();
    let ended = Arc::new(Notify::new());
    let ended_tx = Arc::clone(&ended);
    std::thread::spawn(move || {
        for notification in notifications.iter() {
            match notification {
                Notification::TranscriptUpdated => {
                    if let Some(message) = printer.transcript().last() {
                        if !message.is_typing {
                            println!("[{}] {}", message.sender.name, message.content);
                        }
                    }
                }
                Notification::ModeChanged(transition) => println!("** {:?}", transition),
                Notification::RecordingStarted => println!("** recording"),
                Notification::RecordingStopped => println!("** recording sent"),
                Notification::Connection(status) => println!("** connection: {:?}", status),
                Notification::Error(error) => println!("!! {}", error.user_message()),
                Notification::SessionEnded { closing_remarks } => {
                    if let Some(remarks) = closing_remarks {
                        println!("{}", remarks);
                    }
                    println!("** interview ended");
                    ended_tx.notify_one();
                    break;
                }
                Notification::StateChanged => {}
            }
        }
    });

    // Interactive stdin gets its own thread so exit never waits on a read
    let (line_tx, mut lines) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    println!("{}", USAGE);
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                match parse_action(&line) {
                    Some(action) => {
                        if let Err(e) = handle.send_action(action) {
                            warn!("Session no longer accepts input: {}", e);
                            break;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => println!("{}", USAGE),
                }
                if handle.is_ended() {
                    break;
                }
            }
            _ = ended.notified() => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    handle.shutdown();
    session.await.context("session task panicked")?;
    Ok(())
}
