use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;

/// Congestion and responsiveness findings. These are log events, never errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusAlert {
    /// Mailbox depth at or above the bottleneck threshold.
    Bottleneck { agent_id: String, depth: usize },
    /// Recent dispatch latencies exceed the response-time threshold.
    Unresponsive { agent_id: String, avg_latency_ms: f64 },
    /// Requests between the pair keep timing out.
    CommunicationLoop {
        sender_id: String,
        receiver_id: String,
        timeouts: u32,
    },
}

/// Periodic bus inspection.
pub struct BusMonitor;

impl BusMonitor {
    pub async fn check(bus: &MessageBus) -> Vec<BusAlert> {
        let config = bus.config();
        let mut alerts = Vec::new();

        for agent_id in bus.agent_ids().await {
            let Some(metrics) = bus.get_communication_metrics(&agent_id).await else {
                continue;
            };
            if metrics.mailbox_depth >= config.bottleneck_threshold {
                alerts.push(BusAlert::Bottleneck {
                    agent_id: agent_id.clone(),
                    depth: metrics.mailbox_depth,
                });
            }
            if !metrics.responsive {
                alerts.push(BusAlert::Unresponsive {
                    agent_id,
                    avg_latency_ms: metrics.avg_latency_ms,
                });
            }
        }

        for (sender_id, receiver_id, timeouts) in bus.request_timeout_counts() {
            if timeouts >= config.loop_timeout_threshold {
                alerts.push(BusAlert::CommunicationLoop {
                    sender_id,
                    receiver_id,
                    timeouts,
                });
            }
        }
        alerts
    }

    pub async fn run_monitor_loop(bus: Arc<MessageBus>, mut shutdown: broadcast::Receiver<()>) {
        let period = bus.config().monitor_interval();
        info!(interval_secs = period.as_secs(), "Bus monitor started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let alerts = Self::check(&bus).await;
                    if alerts.is_empty() {
                        debug!("Bus healthy");
                    }
                    for alert in alerts {
                        match alert {
                            BusAlert::Bottleneck { agent_id, depth } => {
                                warn!(agent_id = %agent_id, depth, "Mailbox bottleneck");
                            }
                            BusAlert::Unresponsive { agent_id, avg_latency_ms } => {
                                warn!(agent_id = %agent_id, avg_latency_ms, "Agent unresponsive");
                            }
                            BusAlert::CommunicationLoop { sender_id, receiver_id, timeouts } => {
                                warn!(sender = %sender_id, receiver = %receiver_id, timeouts, "Possible communication loop");
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Bus monitor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::{BusConfig, Message};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bottleneck_detected() {
        let bus = MessageBus::new(BusConfig {
            bottleneck_threshold: 3,
            ..Default::default()
        });
        bus.register_agent("a").await.unwrap();
        bus.register_agent("b").await.unwrap();
        for i in 0..3 {
            bus.send(Message::notification("a", "b", json!(i))).await;
        }

        let alerts = BusMonitor::check(&bus).await;
        assert_eq!(
            alerts,
            vec![BusAlert::Bottleneck {
                agent_id: "b".into(),
                depth: 3
            }]
        );
    }

    #[tokio::test]
    async fn test_repeated_timeouts_flag_loop() {
        let bus = MessageBus::new(BusConfig {
            loop_timeout_threshold: 2,
            ..Default::default()
        });
        bus.register_agent("a").await.unwrap();
        bus.register_agent("b").await.unwrap();

        bus.send_request("a", "b", json!(1), Duration::from_millis(20)).await;
        assert!(BusMonitor::check(&bus)
            .await
            .iter()
            .all(|a| !matches!(a, BusAlert::CommunicationLoop { .. })));

        bus.send_request("a", "b", json!(2), Duration::from_millis(20)).await;
        let alerts = BusMonitor::check(&bus).await;
        assert!(alerts.contains(&BusAlert::CommunicationLoop {
            sender_id: "a".into(),
            receiver_id: "b".into(),
            timeouts: 2,
        }));
    }

    #[tokio::test]
    async fn test_quiet_bus_has_no_alerts() {
        let bus = MessageBus::new(BusConfig::default());
        bus.register_agent("a").await.unwrap();
        assert!(BusMonitor::check(&bus).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_loop_leaves_mail_and_stops_on_shutdown() {
        let bus = Arc::new(MessageBus::new(BusConfig {
            bottleneck_threshold: 1,
            monitor_interval_secs: 1,
            ..Default::default()
        }));
        bus.register_agent("a").await.unwrap();
        bus.register_agent("b").await.unwrap();
        bus.send(Message::notification("a", "b", json!(1))).await;

        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = tokio::spawn(BusMonitor::run_monitor_loop(bus.clone(), shutdown_tx.subscribe()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(bus.mailbox_depth("b").await, Some(1));

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor loop did not stop")
            .unwrap();
    }
}
