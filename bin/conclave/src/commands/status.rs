use conclave_core::{Config, MemoryBackend, Paths};
use conclave_storage::{MemoryStore, SqliteStorage};
use std::sync::Arc;

pub async fn run(paths: &Paths) -> anyhow::Result<()> {
    println!("conclave status");
    println!("===============");
    println!();

    let config_path = paths.config_file();
    let config_exists = config_path.exists();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_exists { "✓" } else { "✗ (not found, using defaults)" }
    );

    let config = Config::load_or_default(paths)?;
    println!(
        "Scheduler: stall after {}s, {} retries, supervision every {}s",
        config.scheduler.stall_threshold_secs,
        config.scheduler.max_stall_retries,
        config.scheduler.supervision_interval_secs
    );
    println!(
        "Bus:       mailbox capacity {}, overflow {:?}, heartbeat every {}s",
        config.bus.mailbox_capacity, config.bus.overflow_policy, config.bus.heartbeat_interval_secs
    );
    println!();

    if config.memory.backend == MemoryBackend::InMemory {
        println!("Memory:    in-process (nothing persisted)");
        return Ok(());
    }

    let db_path = paths.memory_db();
    if !db_path.exists() {
        println!("Memory:    {} ✗ (not created yet)", db_path.display());
        return Ok(());
    }

    let storage = SqliteStorage::open(&db_path)?;
    let store = MemoryStore::new(config.memory.clone(), Arc::new(storage));
    let stats = store.stats().await?;
    println!("Memory:    {} ✓", db_path.display());
    println!("  episodic:   {}", stats.episodic);
    println!("  semantic:   {}", stats.semantic);
    println!("  procedural: {}", stats.procedural);
    Ok(())
}
