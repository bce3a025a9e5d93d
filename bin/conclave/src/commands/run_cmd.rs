use async_trait::async_trait;
use conclave_agent::{
    handler_fn, Agent, AgentServices, BusMonitor, BusShareHook, MessageBus, TaskContext,
    TaskProcessor,
};
use conclave_core::{Config, MemoryBackend, MessageCategory, Paths};
use conclave_scheduler::TaskScheduler;
use conclave_storage::{DurableStorage, InMemoryStorage, MemoryStore, SqliteStorage};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

const COORDINATOR: &str = "coordinator";

/// Simulated work: `steps` short sleeps with a progress report after each.
struct StepProcessor;

#[async_trait]
impl TaskProcessor for StepProcessor {
    async fn process(&self, ctx: TaskContext, data: Value) -> conclave_core::Result<Value> {
        let steps = data.get("steps").and_then(Value::as_u64).unwrap_or(3).max(1);
        for step in 1..=steps {
            tokio::time::sleep(Duration::from_millis(150)).await;
            ctx.report_progress(step as f64 / steps as f64).await?;
        }
        Ok(json!({
            "steps": steps,
            "attempt": ctx.attempt(),
            "recurring": steps % 2 == 0,
        }))
    }
}

#[derive(Default)]
struct Tally {
    completed: AtomicUsize,
    rejected: AtomicUsize,
}

pub async fn run(paths: &Paths, agent_count: usize, task_count: usize) -> anyhow::Result<()> {
    let config = Config::load_or_default(paths)?;

    let durable: Arc<dyn DurableStorage> = match config.memory.backend {
        MemoryBackend::Sqlite => Arc::new(SqliteStorage::open(&paths.memory_db())?),
        MemoryBackend::InMemory => Arc::new(InMemoryStorage::new()),
    };
    let bus = Arc::new(MessageBus::new(config.bus.clone()));
    let scheduler = Arc::new(TaskScheduler::new(config.scheduler.clone()));
    let memory = Arc::new(MemoryStore::new(config.memory.clone(), durable));
    memory.set_share_hook(Arc::new(BusShareHook::new(bus.clone())));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let services = vec![
        tokio::spawn(bus.clone().run_heartbeat_loop(shutdown_tx.subscribe())),
        tokio::spawn(BusMonitor::run_monitor_loop(bus.clone(), shutdown_tx.subscribe())),
        tokio::spawn(scheduler.clone().run_supervision_loop(shutdown_tx.subscribe())),
        tokio::spawn(memory.clone().run_consolidation_loop(shutdown_tx.subscribe())),
    ];

    let wiring = AgentServices {
        bus: bus.clone(),
        scheduler: scheduler.clone(),
        memory: memory.clone(),
    };
    let mut agents = Vec::with_capacity(agent_count.max(1));
    for i in 0..agent_count.max(1) {
        let agent = Arc::new(
            Agent::new(&format!("agent-{}", i), &format!("Worker {}", i), &wiring, Arc::new(StepProcessor))
                .with_capabilities(["compute"])
                .with_config(config.agents.clone()),
        );
        agent.start().await?;
        agents.push(agent);
    }

    let tally = Arc::new(Tally::default());
    register_coordinator(&bus, tally.clone()).await?;

    let mut accepted = 0;
    for i in 0..task_count {
        let agent = &agents[i % agents.len()];
        let mut data = json!({
            "required_capabilities": ["compute"],
            "resources": [format!("dataset-{}", i)],
            "steps": 2 + i % 3,
        });
        // Every third task waits on its predecessor
        if i % 3 == 2 {
            data["dependencies"] = json!([format!("task-{}", i - 1)]);
        }
        let request = json!({ "type": "task_request", "task_id": format!("task-{}", i), "data": data });

        match bus
            .send_request(COORDINATOR, agent.id(), request, config.bus.default_request_timeout())
            .await
        {
            Some(reply) if reply.content["accepted"] == json!(true) => accepted += 1,
            Some(reply) => warn!(task = i, reason = %reply.content["reason"], "Task declined"),
            None => warn!(task = i, agent_id = %agent.id(), "Task request timed out"),
        }
    }
    info!(accepted, submitted = task_count, "Tasks submitted");

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = ticker.tick() => {
                // Kick queued tasks whose dependencies have finished
                for agent in &agents {
                    agent.supervise().await;
                }
                if tally.completed.load(Ordering::SeqCst) >= accepted {
                    break;
                }
            }
        }
    }

    println!();
    println!("{}", serde_json::to_string_pretty(&scheduler.summary().await)?);
    for agent in &agents {
        let metrics = agent.get_metrics().await;
        println!(
            "{:<10} tasks={} ok={} failed={} rate={:.2}",
            metrics.agent_id,
            metrics.total_tasks,
            metrics.success_count,
            metrics.error_count,
            metrics.success_rate
        );
    }
    for alert in BusMonitor::check(&bus).await {
        println!("alert: {}", serde_json::to_string(&alert)?);
    }
    let stats = memory.stats().await?;
    println!(
        "memory: working={} episodic={} semantic={} procedural={}",
        stats.working, stats.episodic, stats.semantic, stats.procedural
    );
    println!(
        "completed={} rejected={}",
        tally.completed.load(Ordering::SeqCst),
        tally.rejected.load(Ordering::SeqCst)
    );

    futures::future::join_all(agents.iter().map(|a| a.stop())).await;
    let _ = shutdown_tx.send(());
    for handle in services {
        let _ = handle.await;
    }
    if let Err(e) = memory.consolidate().await {
        warn!(error = %e, "Final consolidation failed");
    }
    Ok(())
}

/// Registers the submitting endpoint and drains its mailbox in the background,
/// counting completion and rejection broadcasts.
async fn register_coordinator(bus: &Arc<MessageBus>, tally: Arc<Tally>) -> anyhow::Result<()> {
    bus.register_agent(COORDINATOR).await?;
    bus.register_handler(
        COORDINATOR,
        MessageCategory::Notification,
        handler_fn(move |message| {
            let tally = tally.clone();
            async move {
                match message.content.get("type").and_then(Value::as_str) {
                    Some("task_completed") => {
                        tally.completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Some("task_rejected") => {
                        tally.rejected.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {}
                }
                Ok(None)
            }
        }),
    )
    .await?;

    let bus = bus.clone();
    tokio::spawn(async move {
        loop {
            let registered = tokio::select! {
                registered = bus.wait_for_mail(COORDINATOR) => registered,
                _ = tokio::time::sleep(Duration::from_millis(100)) => true,
            };
            if !registered || bus.process_messages(COORDINATOR).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}
