use anyhow::{Context, Result};
use uuid::Uuid;

use persona_health::{HealthReport, HealthStatus};
use persona_memory::DocumentState;
use persona_runtime::SessionOrchestrator;

use crate::MemoryCommands;

pub(crate) async fn run(orchestrator: &SessionOrchestrator, command: MemoryCommands) -> Result<()> {
    let store = orchestrator.store();
    match command {
        MemoryCommands::Stats => {
            let stats = store.stats().await?;
            println!("── memory stats ─────────────────────────────────────");
            println!("  personas:      {}", stats.personas);
            println!("  total entries: {}", stats.total_entries);
            println!("  canon:         {}", stats.canon);
            println!("  working:       {}", stats.working);
            println!("  client facts:  {}", stats.client_facts);
            println!("  history turns: {}", stats.history_turns);
            println!("  total bytes:   {}", stats.total_bytes);
            println!("  largest doc:   {}", stats.largest_document_bytes);
        }
        MemoryCommands::Archive { persona } => {
            let report = store.archive(&persona).await?;
            println!(
                "archived {} working entries for '{}' ({} kept, {} bytes now)",
                report.archived, report.persona_id, report.kept_working, report.bytes_after
            );
        }
        MemoryCommands::Inspect => {
            println!("── document integrity ───────────────────────────────");
            for persona_id in store.personas().await? {
                let inspection = store.inspect(&persona_id).await;
                let state = match &inspection.state {
                    DocumentState::Missing => "missing".to_string(),
                    DocumentState::Unreadable(reason) => format!("unreadable: {reason}"),
                    DocumentState::Loaded => "ok".to_string(),
                };
                println!(
                    "  {:<20} {:>9} bytes  malformed={} duplicates={}  {}",
                    inspection.persona_id,
                    inspection.bytes,
                    inspection.malformed,
                    inspection.duplicate_entries,
                    state
                );
            }
        }
        MemoryCommands::Dedup { persona } => {
            let report = store.deduplicate(&persona).await?;
            println!(
                "merged {} canon and removed {} working duplicates for '{}'",
                report.canon_merged, report.working_removed, report.persona_id
            );
        }
        MemoryCommands::Promote {
            persona,
            entry_id,
            category,
        } => {
            let id = Uuid::parse_str(&entry_id)
                .with_context(|| format!("'{entry_id}' is not a memory entry id"))?;
            let canon_id = store.promote(&persona, id, &category).await?;
            println!("promoted {id} to canon entry {canon_id}");
        }
    }
    Ok(())
}

pub(crate) fn print_health(report: &HealthReport) {
    println!("overall: {}  ({})", report.overall_status, report.generated_at.to_rfc3339());

    println!();
    println!("── memory ───────────────────────────────────────────");
    println!(
        "  largest document: {} bytes [{}]",
        report.memory.memory_file_size, report.memory.memory_file_health
    );
    println!(
        "  entries:          {} [{}]",
        report.memory.total_memories, report.memory.memory_count_health
    );
    if let Some(error) = &report.memory.error {
        println!("  error:            {error}");
    }

    println!();
    println!("── integrity ────────────────────────────────────────");
    println!("  score: {:.2} [{}]", report.integrity.score, report.integrity.status);
    for persona in report
        .integrity
        .personas
        .iter()
        .filter(|p| p.status != HealthStatus::Green)
    {
        println!(
            "    {}: {:.2} {} duplicates={}",
            persona.persona_id,
            persona.score,
            persona.corruption_kinds.join(","),
            persona.duplicate_entries
        );
    }

    println!();
    println!("── context handoff ──────────────────────────────────");
    println!(
        "  success rate: {:.2} over {} handoffs [{}]",
        report.context.handoff_success_rate, report.context.total_handoffs, report.context.status
    );

    if let Some(cascade) = &report.cascade {
        println!();
        println!("── providers ────────────────────────────────────────");
        for backend in &cascade.backends {
            println!(
                "  {:<12} {:<9} failures={} ok={} failed={}",
                backend.name,
                backend.state.label(),
                backend.consecutive_failures,
                backend.successes,
                backend.failures
            );
        }
        println!("  fallback replies in recent window: {}", cascade.fallback_uses());
    }
}
