use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conclave_core::{
    BusConfig, Error, Message, MessageCategory, OverflowPolicy, Result, BROADCAST, SYSTEM_SENDER,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::context::{AgentContext, ConversationLog};

/// Latencies considered by the responsiveness flag.
const RESPONSIVE_WINDOW: usize = 5;

/// Per-agent, per-category message callback.
///
/// Returning `Some(content)` for a `Query` sends a correlated `Response` back
/// to the sender. An error becomes an `Error` message to the sender.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<Option<Value>>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Value>>> + Send,
{
    async fn handle(&self, message: &Message) -> Result<Option<Value>> {
        (self.f)(message.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Global observer, called synchronously whenever a message of its category is accepted.
pub type Subscriber = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

/// Counters exposed per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationMetrics {
    pub agent_id: String,
    /// Messages received, by category.
    pub messages_by_category: BTreeMap<MessageCategory, u64>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_processed: u64,
    pub avg_latency_ms: f64,
    pub error_count: u64,
    pub dropped_count: u64,
    pub timeout_count: u64,
    pub mailbox_depth: usize,
    /// True iff the last five dispatch latencies were all below the response-time threshold.
    pub responsive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub agent_id: String,
    pub mailbox_depth: usize,
    pub active_threads: Vec<String>,
    pub message_count: u64,
    pub last_active: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub responsive: bool,
}

#[derive(Default)]
struct Counters {
    by_category: BTreeMap<MessageCategory, u64>,
    sent: u64,
    received: u64,
    processed: u64,
    errors: u64,
    dropped: u64,
    timeouts: u64,
    latencies: VecDeque<Duration>,
}

#[derive(Default)]
struct ChannelState {
    context: AgentContext,
    counters: Counters,
    last_heartbeat: Option<DateTime<Utc>>,
}

struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
    /// One drainer at a time, so dispatch order matches mailbox order.
    dispatch: tokio::sync::Mutex<()>,
}

struct AgentChannel {
    mailbox: Mailbox,
    state: Mutex<ChannelState>,
    handlers: std::sync::RwLock<HashMap<MessageCategory, Vec<Arc<dyn MessageHandler>>>>,
}

impl AgentChannel {
    fn new() -> Self {
        Self {
            mailbox: Mailbox {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                dispatch: tokio::sync::Mutex::new(()),
            },
            state: Mutex::new(ChannelState::default()),
            handlers: std::sync::RwLock::new(HashMap::new()),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.mailbox.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn handlers_for(&self, category: MessageCategory) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&category)
            .cloned()
            .unwrap_or_default()
    }

    fn depth(&self) -> usize {
        self.queue().len()
    }
}

/// Agent-to-agent message bus: mailboxes, handler dispatch, pub/sub and
/// request/response correlation.
///
/// The mailbox set, the conversation log, pending requests and subscribers are
/// each behind their own lock. Dispatch is pulled by the owning agent through
/// `process_messages`.
pub struct MessageBus {
    config: BusConfig,
    agents: RwLock<HashMap<String, Arc<AgentChannel>>>,
    conversations: Mutex<ConversationLog>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    subscribers: std::sync::RwLock<Vec<(SubscriptionId, MessageCategory, Subscriber)>>,
    next_subscription: AtomicU64,
    /// Consecutive request timeouts per (sender, receiver).
    request_timeouts: Mutex<HashMap<(String, String), u32>>,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        let history_limit = config.history_limit;
        Self {
            config,
            agents: RwLock::new(HashMap::new()),
            conversations: Mutex::new(ConversationLog::new(history_limit)),
            pending: Mutex::new(HashMap::new()),
            subscribers: std::sync::RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            request_timeouts: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn conversations(&self) -> MutexGuard<'_, ConversationLog> {
        self.conversations.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Message>>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn request_timeouts(&self) -> MutexGuard<'_, HashMap<(String, String), u32>> {
        self.request_timeouts.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn channel(&self, agent_id: &str) -> Option<Arc<AgentChannel>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// Create the agent's mailbox and context record.
    pub async fn register_agent(&self, agent_id: &str) -> Result<()> {
        if agent_id.trim().is_empty() || agent_id == BROADCAST || agent_id == SYSTEM_SENDER {
            return Err(Error::Validation(format!("'{}' is not a valid agent id", agent_id)));
        }
        let mut agents = self.agents.write().await;
        if agents.contains_key(agent_id) {
            return Err(Error::AlreadyRegistered(agent_id.to_string()));
        }
        agents.insert(agent_id.to_string(), Arc::new(AgentChannel::new()));
        info!(agent_id = %agent_id, "Agent registered on bus");
        Ok(())
    }

    /// Remove the agent, its handlers and its context. Returns how many queued
    /// messages were discarded.
    pub async fn deregister_agent(&self, agent_id: &str) -> Result<usize> {
        let channel = self
            .agents
            .write()
            .await
            .remove(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent '{}'", agent_id)))?;

        let discarded = {
            let mut queue = channel.queue();
            let n = queue.len();
            queue.clear();
            n
        };
        channel.mailbox.notify.notify_waiters();
        self.request_timeouts()
            .retain(|(s, r), _| s != agent_id && r != agent_id);

        info!(agent_id = %agent_id, discarded, "Agent deregistered from bus");
        Ok(discarded)
    }

    pub async fn is_registered(&self, agent_id: &str) -> bool {
        self.agents.read().await.contains_key(agent_id)
    }

    pub async fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Handlers for the same agent and category run in registration order.
    pub async fn register_handler(
        &self,
        agent_id: &str,
        category: MessageCategory,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let channel = self
            .channel(agent_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("agent '{}'", agent_id)))?;
        channel
            .handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(category)
            .or_default()
            .push(handler);
        debug!(agent_id = %agent_id, category = %category, "Handler registered");
        Ok(())
    }

    pub fn subscribe(&self, category: MessageCategory, callback: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, category, callback));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(|p| p.into_inner());
        let before = subs.len();
        subs.retain(|(sid, _, _)| *sid != id);
        subs.len() != before
    }

    fn notify_subscribers(&self, message: &Message) {
        let matching: Vec<Subscriber> = self
            .subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(_, category, _)| *category == message.category)
            .map(|(_, _, cb)| cb.clone())
            .collect();
        for cb in matching {
            cb(message);
        }
    }

    /// Apply the overflow policy and enqueue. `false` if the message was refused.
    fn enqueue(&self, channel: &AgentChannel, mut message: Message) -> bool {
        message.enqueued_at = Some(Utc::now());
        let category = message.category;
        let capacity = self.config.mailbox_capacity;
        {
            let mut queue = channel.queue();
            if capacity > 0 && queue.len() >= capacity {
                match self.config.overflow_policy {
                    OverflowPolicy::Reject => {
                        drop(queue);
                        channel.state().counters.dropped += 1;
                        warn!(
                            receiver = %message.receiver_id,
                            message_id = %message.id,
                            capacity,
                            "Mailbox full, message rejected"
                        );
                        return false;
                    }
                    OverflowPolicy::DropOldest => {
                        if let Some(old) = queue.pop_front() {
                            debug!(receiver = %message.receiver_id, dropped = %old.id, "Mailbox full, oldest message dropped");
                        }
                        channel.state().counters.dropped += 1;
                    }
                }
            }
            queue.push_back(message);
        }

        let mut state = channel.state();
        state.counters.received += 1;
        *state.counters.by_category.entry(category).or_default() += 1;
        drop(state);

        channel.mailbox.notify.notify_one();
        true
    }

    /// Validate endpoints, merge context and enqueue. Never waits for processing.
    ///
    /// A `Response` answering an outstanding `send_request` goes straight to the
    /// waiting caller. A receiver of `"broadcast"` fans out to every other agent.
    pub async fn send(&self, mut message: Message) -> bool {
        let sender = if message.sender_id == SYSTEM_SENDER {
            None
        } else {
            match self.channel(&message.sender_id).await {
                Some(c) => Some(c),
                None => {
                    warn!(sender = %message.sender_id, "Send from unregistered agent rejected");
                    return false;
                }
            }
        };

        if message.is_broadcast() {
            self.fan_out(message, sender.as_deref()).await;
            return true;
        }

        let Some(receiver) = self.channel(&message.receiver_id).await else {
            warn!(receiver = %message.receiver_id, "Send to unregistered agent rejected");
            return false;
        };

        let now = Utc::now();
        if let Some(sender) = &sender {
            self.prepare(&mut message, sender);
        } else {
            self.conversations().merge_into(&mut message, None);
        }

        if message.category == MessageCategory::Response {
            let waiter = message
                .reply_to
                .as_deref()
                .and_then(|id| self.pending().remove(id));
            if let Some(waiter) = waiter {
                let snapshot = message.clone();
                match waiter.send(message) {
                    Ok(()) => {
                        self.conversations().append(&snapshot);
                        receiver.state().context.touch(&snapshot.thread_id, now);
                        self.notify_subscribers(&snapshot);
                        debug!(request_id = ?snapshot.reply_to, "Response handed to waiting requester");
                        return true;
                    }
                    // Requester gave up; deliver as ordinary mail
                    Err(late) => message = late,
                }
            }
        }

        let thread_id = message.thread_id.clone();
        let snapshot = message.clone();
        if !self.enqueue(&receiver, message) {
            return false;
        }
        self.conversations().append(&snapshot);
        receiver.state().context.touch(&thread_id, now);
        self.notify_subscribers(&snapshot);

        debug!(
            message_id = %snapshot.id,
            category = %snapshot.category,
            sender = %snapshot.sender_id,
            receiver = %snapshot.receiver_id,
            "Message enqueued"
        );
        true
    }

    /// Merge thread and sender context into the message and update the sender's record.
    fn prepare(&self, message: &mut Message, sender: &AgentChannel) {
        let now = Utc::now();
        let sender_ctx = {
            let mut state = sender.state();
            state.context.touch(&message.thread_id, now);
            state.counters.sent += 1;
            state.context.clone()
        };
        self.conversations().merge_into(message, Some(&sender_ctx));
    }

    /// Copy the message into every mailbox except the sender's. Returns deliveries.
    async fn fan_out(&self, mut message: Message, sender: Option<&AgentChannel>) -> usize {
        let recipients: Vec<(String, Arc<AgentChannel>)> = self
            .agents
            .read()
            .await
            .iter()
            .filter(|(id, _)| **id != message.sender_id)
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();

        match sender {
            Some(s) => self.prepare(&mut message, s),
            None => self.conversations().merge_into(&mut message, None),
        }
        message.context.insert("_broadcast".into(), json!(true));
        self.conversations().append(&message);

        let now = Utc::now();
        let mut delivered = 0;
        for (id, channel) in recipients {
            let mut copy = message.clone();
            copy.receiver_id = id;
            if self.enqueue(&channel, copy) {
                channel.state().context.touch(&message.thread_id, now);
                delivered += 1;
            }
        }
        self.notify_subscribers(&message);
        debug!(message_id = %message.id, sender = %message.sender_id, delivered, "Broadcast delivered");
        delivered
    }

    /// Send a `Query` and wait for the correlated `Response`. `None` on timeout
    /// or if the query could not be sent.
    pub async fn send_request(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: Value,
        timeout: Duration,
    ) -> Option<Message> {
        let query = Message::query(sender_id, receiver_id, content).with_timeout(timeout);
        let request_id = query.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id.clone(), tx);

        if !self.send(query).await {
            self.pending().remove(&request_id);
            return None;
        }

        let key = (sender_id.to_string(), receiver_id.to_string());
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                self.request_timeouts().remove(&key);
                Some(response)
            }
            _ => {
                self.pending().remove(&request_id);
                let consecutive = {
                    let mut timeouts = self.request_timeouts();
                    let n = timeouts.entry(key).or_default();
                    *n += 1;
                    *n
                };
                if let Some(sender) = self.channel(sender_id).await {
                    sender.state().counters.timeouts += 1;
                }
                warn!(
                    sender = %sender_id,
                    receiver = %receiver_id,
                    request_id = %request_id,
                    consecutive,
                    "Request timed out"
                );
                None
            }
        }
    }

    /// Fan a `Notification` out to every registered agent except the sender.
    pub async fn broadcast_notification(&self, sender_id: &str, content: Value) -> usize {
        let sender = if sender_id == SYSTEM_SENDER {
            None
        } else {
            match self.channel(sender_id).await {
                Some(c) => Some(c),
                None => {
                    warn!(sender = %sender_id, "Broadcast from unregistered agent rejected");
                    return 0;
                }
            }
        };
        let message = Message::notification(sender_id, BROADCAST, content);
        self.fan_out(message, sender.as_deref()).await
    }

    /// Enqueue a `Heartbeat` into every mailbox.
    pub async fn broadcast_heartbeat(&self) -> usize {
        let channels: Vec<(String, Arc<AgentChannel>)> = self
            .agents
            .read()
            .await
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();
        channels
            .into_iter()
            .filter(|(id, channel)| self.enqueue(channel, Message::heartbeat(id)))
            .count()
    }

    /// Drain the agent's mailbox, dispatching each message to its handlers.
    /// Returns the number of messages dispatched.
    ///
    /// Handler errors are answered with an `Error` message to the sender and
    /// never abort the drain. A failure while handling an `Error` message is
    /// only logged, so two failing peers cannot bounce errors forever. A
    /// handler must not call `process_messages` for its own agent.
    pub async fn process_messages(&self, agent_id: &str) -> Result<usize> {
        let channel = self
            .channel(agent_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("agent '{}'", agent_id)))?;
        let _drain = channel.mailbox.dispatch.lock().await;

        let mut dispatched = 0;
        loop {
            let next = channel.queue().pop_front();
            let Some(mut message) = next else { break };

            let started = Utc::now();
            if message.is_expired_at(started) {
                {
                    let mut state = channel.state();
                    state.counters.dropped += 1;
                    state.counters.timeouts += 1;
                }
                warn!(agent_id = %agent_id, message_id = %message.id, "Expired message dropped");
                continue;
            }
            message.processing_started_at = Some(started);

            if message.category == MessageCategory::Heartbeat {
                channel.state().last_heartbeat = Some(started);
            }

            for handler in channel.handlers_for(message.category) {
                match handler.handle(&message).await {
                    Ok(Some(content)) if message.category == MessageCategory::Query => {
                        let reply = Message::reply(&message, MessageCategory::Response, content);
                        if !self.send(reply).await {
                            debug!(agent_id = %agent_id, message_id = %message.id, "Response could not be delivered");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        channel.state().counters.errors += 1;
                        warn!(
                            agent_id = %agent_id,
                            message_id = %message.id,
                            category = %message.category,
                            error = %e,
                            "Message handler failed"
                        );
                        if message.sender_id != SYSTEM_SENDER
                            && message.category != MessageCategory::Error
                        {
                            let reply = Message::reply(
                                &message,
                                MessageCategory::Error,
                                json!({
                                    "error": e.to_string(),
                                    "category": message.category,
                                    "message_id": message.id,
                                }),
                            );
                            self.send(reply).await;
                        }
                    }
                }
            }

            let finished = Utc::now();
            message.processed_at = Some(finished);
            let latency = (finished - started).to_std().unwrap_or(Duration::ZERO);
            {
                let mut state = channel.state();
                let counters = &mut state.counters;
                counters.processed += 1;
                counters.latencies.push_back(latency);
                while counters.latencies.len() > self.config.latency_window.max(RESPONSIVE_WINDOW) {
                    counters.latencies.pop_front();
                }
                state.context.last_active = Some(finished);
            }
            dispatched += 1;
        }

        if dispatched > 0 {
            debug!(agent_id = %agent_id, dispatched, "Mailbox drained");
        }
        Ok(dispatched)
    }

    /// Wait until the agent has mail. Returns immediately if the mailbox is not
    /// empty, and `false` if the agent is not registered.
    pub async fn wait_for_mail(&self, agent_id: &str) -> bool {
        let Some(channel) = self.channel(agent_id).await else {
            return false;
        };
        if channel.depth() > 0 {
            return true;
        }
        channel.mailbox.notify.notified().await;
        true
    }

    pub async fn mailbox_depth(&self, agent_id: &str) -> Option<usize> {
        self.channel(agent_id).await.map(|c| c.depth())
    }

    pub async fn get_communication_metrics(&self, agent_id: &str) -> Option<CommunicationMetrics> {
        let channel = self.channel(agent_id).await?;
        let depth = channel.depth();
        let state = channel.state();
        let c = &state.counters;

        let avg_latency_ms = if c.latencies.is_empty() {
            0.0
        } else {
            c.latencies.iter().map(|d| d.as_secs_f64() * 1000.0).sum::<f64>() / c.latencies.len() as f64
        };

        Some(CommunicationMetrics {
            agent_id: agent_id.to_string(),
            messages_by_category: c.by_category.clone(),
            messages_sent: c.sent,
            messages_received: c.received,
            messages_processed: c.processed,
            avg_latency_ms,
            error_count: c.errors,
            dropped_count: c.dropped,
            timeout_count: c.timeouts,
            mailbox_depth: depth,
            responsive: self.is_responsive(&c.latencies),
        })
    }

    fn is_responsive(&self, latencies: &VecDeque<Duration>) -> bool {
        let threshold = self.config.response_time_threshold();
        latencies
            .iter()
            .rev()
            .take(RESPONSIVE_WINDOW)
            .all(|l| *l < threshold)
    }

    pub async fn get_agent_status(&self, agent_id: &str) -> Option<ChannelStatus> {
        let channel = self.channel(agent_id).await?;
        let depth = channel.depth();
        let state = channel.state();
        Some(ChannelStatus {
            agent_id: agent_id.to_string(),
            mailbox_depth: depth,
            active_threads: state.context.active_threads.iter().cloned().collect(),
            message_count: state.context.message_count,
            last_active: state.context.last_active,
            last_heartbeat: state.last_heartbeat,
            responsive: self.is_responsive(&state.counters.latencies),
        })
    }

    pub fn thread_history(&self, thread_id: &str) -> Vec<Message> {
        self.conversations().history(thread_id)
    }

    /// `(sender, receiver, consecutive timeouts)` for every pair with at least one timeout.
    pub fn request_timeout_counts(&self) -> Vec<(String, String, u32)> {
        let mut out: Vec<(String, String, u32)> = self
            .request_timeouts()
            .iter()
            .map(|((s, r), n)| (s.clone(), r.clone(), *n))
            .collect();
        out.sort();
        out
    }

    pub async fn run_heartbeat_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.heartbeat_interval();
        info!(interval_secs = period.as_secs(), "Bus heartbeat started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let delivered = self.broadcast_heartbeat().await;
                    debug!(delivered, "Heartbeat broadcast");
                }
                _ = shutdown.recv() => {
                    info!("Bus heartbeat shutting down");
                    break;
                }
            }
        }
    }
}
