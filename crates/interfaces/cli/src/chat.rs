use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::warn;

use persona_runtime::{SessionOrchestrator, TurnOutcome};

pub(crate) async fn run_single(
    orchestrator: &SessionOrchestrator,
    persona: &str,
    client: &str,
    message: &str,
) -> Result<()> {
    let outcome = orchestrator.handle_message(persona, client, message).await?;
    print_outcome(&outcome);
    Ok(())
}

/// Line-oriented chat on stdin.  `/end` closes the session with a
/// reflection, `/reload` re-reads the config file, `/quit` or end of input
/// leaves.
pub(crate) async fn run_interactive(
    orchestrator: Arc<SessionOrchestrator>,
    config_path: &Path,
    persona: &str,
    client: &str,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = orchestrator.clone().spawn_maintenance(shutdown_rx);

    println!("chatting as '{client}' (/end closes the session, /reload re-reads config, /quit leaves)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/end" => {
                end_session(&orchestrator, persona, client).await;
                continue;
            }
            "/reload" => {
                match orchestrator.reload_config(config_path) {
                    Ok(()) => println!("configuration reloaded"),
                    Err(err) => eprintln!("{err}"),
                }
                continue;
            }
            _ => {}
        }
        match orchestrator.handle_message(persona, client, line).await {
            Ok(outcome) => print_outcome(&outcome),
            Err(err) if err.is_user_visible() => eprintln!("{err}"),
            Err(err) => return Err(err.into()),
        }
    }

    end_session(&orchestrator, persona, client).await;
    let _ = shutdown_tx.send(true);
    if let Err(err) = maintenance.await {
        warn!(error = %err, "maintenance task ended abnormally");
    }
    Ok(())
}

async fn end_session(orchestrator: &SessionOrchestrator, persona: &str, client: &str) {
    orchestrator.drain_background().await;
    let persona = if persona.trim().is_empty() {
        orchestrator.config().snapshot().persona.default_persona.clone()
    } else {
        persona.trim().to_string()
    };
    match orchestrator.end_session(&persona, client).await {
        Ok(Some(reflection)) => println!("── reflection ──\n{}", reflection.text),
        Ok(None) => {}
        Err(err) => eprintln!("could not close session: {err}"),
    }
}

fn print_outcome(outcome: &TurnOutcome) {
    println!("{}", outcome.response);
    let mut notes = vec![format!("{} in {}ms", outcome.provider_used, outcome.latency_ms)];
    if outcome.neural_context_used {
        notes.push("context handed off".to_string());
    }
    if outcome.memory_degraded {
        notes.push("memory unavailable".to_string());
    }
    println!("  [{}]", notes.join(", "));
}
