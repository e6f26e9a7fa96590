// Parley node daemon: listens for peers, keeps presence with the directory, logs chat activity.

use anyhow::Context;
use parley_node::call::CallEvent;
use parley_node::presence::PresenceEvent;
use parley_node::{config, Node};
use tokio::sync::mpsc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("parley-node {}", VERSION);
            return Ok(());
        }
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = config::load();
    let auto_answer = cfg.auto_answer;
    let (node, mut events) = Node::from_config(cfg).context("directory client")?;
    let port = node.start().await.context("start listener")?;
    log::info!("user {} listening on port {}", node.ctx.local_user, port);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                if let Err(e) = res {
                    log::warn!("signal handler: {}", e);
                }
                break;
            }
            Some(msg) = events.chat.recv() => {
                log::info!(
                    "{:?} from {}: {}",
                    msg.kind,
                    msg.sender_id.map(|u| u.to_string()).unwrap_or_else(|| "?".into()),
                    msg.content.as_deref().unwrap_or("")
                );
            }
            Some(event) = events.calls.recv() => match event {
                CallEvent::Incoming(call) => {
                    log::info!("{:?} call {} from {}", call.call_type, call.call_id, call.peer);
                    if auto_answer {
                        if let Err(e) = node.calls().answer().await {
                            log::warn!("auto-answer failed: {}", e);
                        }
                    }
                }
                CallEvent::Updated(call) => {
                    log::info!("call {} is {:?} ({:?})", call.call_id, call.status, call.duration);
                }
            },
            Some(file) = events.files.recv() => {
                log::info!("file {} ({} bytes) saved", file.path.display(), file.size);
            }
            Some(event) = next_presence(&mut events.presence) => match event {
                PresenceEvent::Online(user) => log::info!("{} is online", user),
                PresenceEvent::Offline(user) => log::info!("{} went offline", user),
            },
        }
    }

    log::info!("shutting down");
    node.shutdown().await;
    Ok(())
}

/// Pends forever when there is no directory.
async fn next_presence(rx: &mut Option<mpsc::UnboundedReceiver<PresenceEvent>>) -> Option<PresenceEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
