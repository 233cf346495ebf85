use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::{AppConfig, EventBusConfig};
use weft_core::error::{Result, WeftError};
use weft_core::topic::TopicPattern;

use crate::entry::{EventDraft, EventLogEntry};
use crate::log::EventLog;
use crate::partition::partition_for;
use crate::subscription::{Counters, EventHandler, SubscribeOptions, Subscription, SubscriptionStats};
use crate::transaction::{Transaction, TransactionStatus};

/// Metadata key marking events produced by dead-lettering.
pub const DEAD_LETTER_KEY: &str = "weft.deadLetter";
/// Producer id stamped on dead-letter events.
pub const DEAD_LETTER_PRODUCER: &str = "weft.dead-letter";

type SubscriptionList = Arc<Vec<Arc<Subscription>>>;

/// Durable entries plus the subscriptions registered when they became durable.
struct DeliveryBatch {
    entries: Vec<EventLogEntry>,
    subscriptions: SubscriptionList,
}

/// Sequencing state guarded by one lock.
struct BusState {
    next_sequence: u64,
    next_offsets: Vec<u64>,
    pending: VecDeque<EventLogEntry>,
}

/// Partitioned, durable event bus.
///
/// `publish` routes a topic to its partition, assigns the next sequence
/// number and partition offset, and buffers the entry. The buffer is written
/// through the [`EventLog`] when it reaches `max_batch_size` or on the flush
/// timer. Only after a batch is durable is it handed to the delivery task,
/// which calls matching subscriptions in registration order.
///
/// Lock order: `flush_lock` before `state`.
pub struct EventBus {
    config: EventBusConfig,
    log: EventLog,
    state: tokio::sync::Mutex<BusState>,
    /// Serializes log writes and reads, so readers never see half a commit.
    flush_lock: tokio::sync::Mutex<()>,
    /// Latest durable offset per partition.
    high_water: Mutex<Vec<Option<u64>>>,
    subscriptions: RwLock<SubscriptionList>,
    transactions: Mutex<HashMap<String, Transaction>>,
    deliveries: mpsc::UnboundedSender<DeliveryBatch>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl EventBus {
    /// Open the log described by `config` and build a bus on top of it.
    pub async fn from_config(config: &AppConfig) -> Result<Arc<Self>> {
        let log = EventLog::open(config.log.clone()).await?;
        Self::open(log, config.bus.clone()).await
    }

    /// Build a bus over an opened log, recovering positions with one full scan.
    pub async fn open(log: EventLog, config: EventBusConfig) -> Result<Arc<Self>> {
        if config.max_batch_size == 0 {
            return Err(WeftError::Config("bus.max_batch_size must be at least 1".into()));
        }
        let positions = log.recover_positions().await?;
        let next_offsets = positions
            .latest_offsets
            .iter()
            .map(|o| o.map_or(0, |o| o + 1))
            .collect();
        let next_sequence = positions.max_sequence.map_or(0, |s| s + 1);
        info!(
            partitions = log.partitions(),
            next_sequence,
            "Event bus recovered positions"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Arc::new(Self {
            config,
            state: tokio::sync::Mutex::new(BusState {
                next_sequence,
                next_offsets,
                pending: VecDeque::new(),
            }),
            high_water: Mutex::new(positions.latest_offsets),
            log,
            flush_lock: tokio::sync::Mutex::new(()),
            subscriptions: RwLock::new(Arc::new(Vec::new())),
            transactions: Mutex::new(HashMap::new()),
            deliveries: tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(run_delivery(Arc::downgrade(&bus), rx));
        Ok(bus)
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn partitions(&self) -> usize {
        self.log.partitions()
    }

    /// Partition a topic is routed to.
    pub fn partition_for(&self, topic: &str) -> usize {
        partition_for(topic, self.partitions())
    }

    /// Spawn the periodic flush timer and retention sweeper.
    pub fn start(self: &Arc<Self>) {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(bus.config.flush_interval_ms.max(1)));
            loop {
                tokio::select! {
                    _ = bus.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = bus.flush().await {
                            error!(error = %e, "Background flush failed, retrying next tick");
                        }
                    }
                }
            }
            debug!("Flush timer stopped");
        });

        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_secs(bus.config.retention_check_interval_secs.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = bus.cancel.cancelled() => break,
                    _ = ticker.tick() => match bus.log.cleanup().await {
                        Ok(0) => {}
                        Ok(n) => info!(removed = n, "Retention sweep removed segments"),
                        Err(e) => warn!(error = %e, "Retention sweep failed"),
                    },
                }
            }
            debug!("Retention sweeper stopped");
        });

        info!(
            flush_interval_ms = self.config.flush_interval_ms,
            max_batch_size = self.config.max_batch_size,
            "Event bus started"
        );
    }

    /// Stop background tasks, flush the buffer, and persist the index.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        let flushed = self.flush().await;
        self.log.close().await?;
        info!("Event bus shut down");
        flushed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WeftError::BusClosed);
        }
        Ok(())
    }

    /// Publish one event. Durability follows on the next flush.
    pub async fn publish(
        &self,
        topic: &str,
        event_type: &str,
        data: serde_json::Value,
        metadata: BTreeMap<String, String>,
        producer_id: &str,
    ) -> Result<EventLogEntry> {
        let draft = EventDraft {
            topic: topic.to_string(),
            event_type: event_type.to_string(),
            data,
            metadata,
        };
        self.publish_draft(draft, producer_id).await
    }

    pub async fn publish_draft(&self, draft: EventDraft, producer_id: &str) -> Result<EventLogEntry> {
        self.ensure_open()?;
        let partition = self.partition_for(&draft.topic);

        let (entry, batch_full) = {
            let mut state = self.state.lock().await;
            let sequence = state.next_sequence;
            let offset = state.next_offsets[partition];
            state.next_sequence += 1;
            state.next_offsets[partition] += 1;

            let entry = draft.into_entry(
                producer_id,
                sequence,
                partition,
                offset,
                self.config.replication_factor,
            );
            state.pending.push_back(entry.clone());
            (entry, state.pending.len() >= self.config.max_batch_size)
        };
        debug!(
            topic = %entry.topic,
            partition,
            offset = entry.offset,
            sequence = entry.sequence_number,
            "Event buffered"
        );

        if batch_full {
            if let Err(e) = self.flush().await {
                warn!(error = %e, "Inline flush failed, events stay buffered");
            }
        }
        Ok(entry)
    }

    /// Write the pending buffer. Entries of a partition whose write failed are
    /// re-queued ahead of newer entries and the first error is returned.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        self.flush_locked().await
    }

    async fn flush_locked(&self) -> Result<()> {
        let drained: Vec<EventLogEntry> = {
            let mut state = self.state.lock().await;
            state.pending.drain(..).collect()
        };
        if drained.is_empty() {
            return Ok(());
        }

        let mut groups: BTreeMap<usize, Vec<EventLogEntry>> = BTreeMap::new();
        for entry in drained {
            groups.entry(entry.partition).or_default().push(entry);
        }

        let mut written = Vec::new();
        let mut failed = Vec::new();
        let mut first_error = None;
        for (partition, batch) in groups {
            match self.log.write_batch(partition, &batch).await {
                Ok(_) => written.extend(batch),
                Err(e) => {
                    error!(partition, count = batch.len(), error = %e, "Failed to write batch");
                    failed.extend(batch);
                    first_error.get_or_insert(e);
                }
            }
        }

        if !failed.is_empty() {
            let mut state = self.state.lock().await;
            for entry in failed.into_iter().rev() {
                state.pending.push_front(entry);
            }
        }

        self.mark_durable(written);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Advance high-water marks and hand entries to the delivery task.
    /// Must be called with `flush_lock` held so delivery order matches write order.
    fn mark_durable(&self, mut entries: Vec<EventLogEntry>) {
        if entries.is_empty() {
            return;
        }
        entries.sort_by_key(|e| e.sequence_number);
        {
            let mut hw = self.high_water.lock().unwrap_or_else(PoisonError::into_inner);
            for entry in &entries {
                let slot = &mut hw[entry.partition];
                *slot = Some(slot.map_or(entry.offset, |o| o.max(entry.offset)));
            }
        }
        let batch = DeliveryBatch {
            entries,
            subscriptions: self.subscription_snapshot(),
        };
        if self.deliveries.send(batch).is_err() {
            warn!("Delivery task gone, dropping notifications");
        }
    }

    fn subscription_snapshot(&self) -> SubscriptionList {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Transactions ────────────────────────────────────────────

    /// Open a transaction that auto-aborts after `timeout` (bus default when `None`).
    pub fn begin_transaction(self: &Arc<Self>, producer_id: &str, timeout: Option<Duration>) -> Result<String> {
        self.ensure_open()?;
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_millis(self.config.transaction_timeout_ms));
        let tx = Transaction::new(producer_id, timeout);
        let id = tx.id.clone();
        {
            let mut txs = self.transactions.lock().unwrap_or_else(PoisonError::into_inner);
            // Forget finished transactions once their timeout window has passed.
            txs.retain(|_, t| t.status == TransactionStatus::Active || !t.is_expired());
            txs.insert(id.clone(), tx);
        }

        let weak = Arc::downgrade(self);
        let tx_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(bus) = weak.upgrade() {
                bus.expire_transaction(&tx_id);
            }
        });

        debug!(transaction = %id, timeout_ms = timeout.as_millis() as u64, "Transaction started");
        Ok(id)
    }

    fn expire_transaction(&self, id: &str) {
        let mut txs = self.transactions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = txs.get_mut(id) {
            if tx.status == TransactionStatus::Active {
                tx.status = TransactionStatus::Aborted;
                tx.events.clear();
                warn!(transaction = %id, "Transaction timed out, aborted");
            }
        }
    }

    /// Stage an event in an active transaction.
    pub fn add_to_transaction(&self, id: &str, draft: EventDraft) -> Result<()> {
        let mut txs = self.transactions.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = txs
            .get_mut(id)
            .ok_or_else(|| WeftError::TransactionNotFound(id.to_string()))?;
        if tx.status != TransactionStatus::Active {
            return Err(WeftError::TransactionNotActive {
                id: id.to_string(),
                status: tx.status.to_string(),
            });
        }
        if tx.is_expired() {
            tx.status = TransactionStatus::Aborted;
            tx.events.clear();
            return Err(WeftError::TransactionTimeout(id.to_string()));
        }
        tx.events.push(draft);
        Ok(())
    }

    pub fn abort_transaction(&self, id: &str) -> Result<()> {
        let mut txs = self.transactions.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = txs
            .get_mut(id)
            .ok_or_else(|| WeftError::TransactionNotFound(id.to_string()))?;
        if tx.status != TransactionStatus::Active {
            return Err(WeftError::TransactionNotActive {
                id: id.to_string(),
                status: tx.status.to_string(),
            });
        }
        tx.status = TransactionStatus::Aborted;
        tx.events.clear();
        info!(transaction = %id, "Transaction aborted");
        Ok(())
    }

    pub fn transaction_status(&self, id: &str) -> Option<TransactionStatus> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|t| t.status)
    }

    fn finish_transaction(&self, id: &str, status: TransactionStatus) {
        let mut txs = self.transactions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = txs.get_mut(id) {
            tx.status = status;
            tx.events.clear();
        }
    }

    /// Commit all staged events or none of them.
    ///
    /// The pending buffer is flushed first so partition files stay in offset
    /// order. Every partition write is rolled back if any of them fails, and
    /// subscribers are only notified once all writes succeeded.
    pub async fn commit_transaction(&self, id: &str) -> Result<Vec<EventLogEntry>> {
        self.ensure_open()?;
        let (producer_id, drafts) = {
            let mut txs = self.transactions.lock().unwrap_or_else(PoisonError::into_inner);
            let tx = txs
                .get_mut(id)
                .ok_or_else(|| WeftError::TransactionNotFound(id.to_string()))?;
            if tx.status != TransactionStatus::Active {
                return Err(WeftError::TransactionNotActive {
                    id: id.to_string(),
                    status: tx.status.to_string(),
                });
            }
            if tx.is_expired() {
                tx.status = TransactionStatus::Aborted;
                tx.events.clear();
                return Err(WeftError::TransactionTimeout(id.to_string()));
            }
            // Claimed: the timeout task ignores non-active transactions.
            tx.status = TransactionStatus::Committed;
            (tx.producer_id.clone(), std::mem::take(&mut tx.events))
        };

        let _guard = self.flush_lock.lock().await;
        if let Err(e) = self.flush_locked().await {
            self.finish_transaction(id, TransactionStatus::Aborted);
            return Err(e);
        }

        let mut state = self.state.lock().await;
        let saved_sequence = state.next_sequence;
        let saved_offsets = state.next_offsets.clone();

        let mut groups: BTreeMap<usize, Vec<EventLogEntry>> = BTreeMap::new();
        for draft in drafts {
            let partition = self.partition_for(&draft.topic);
            let entry = draft.into_entry(
                &producer_id,
                state.next_sequence,
                partition,
                state.next_offsets[partition],
                self.config.replication_factor,
            );
            state.next_sequence += 1;
            state.next_offsets[partition] += 1;
            groups.entry(partition).or_default().push(entry);
        }

        let mut marks = Vec::with_capacity(groups.len());
        for (partition, batch) in &groups {
            match self.log.append_batch(*partition, batch).await {
                Ok(mark) => marks.push(mark),
                Err(e) => {
                    for mark in marks.iter().rev() {
                        if let Err(re) = self.log.rollback(mark).await {
                            error!(partition = mark.partition, error = %re, "Rollback failed, partial commit may be visible");
                        }
                    }
                    state.next_sequence = saved_sequence;
                    state.next_offsets = saved_offsets;
                    drop(state);
                    self.finish_transaction(id, TransactionStatus::Aborted);
                    error!(transaction = %id, partition, error = %e, "Commit failed, transaction aborted");
                    return Err(e);
                }
            }
        }
        drop(state);

        let committed: Vec<EventLogEntry> = groups.into_values().flatten().collect();
        self.log.record_batch(&committed);
        self.mark_durable(committed.clone());
        info!(transaction = %id, count = committed.len(), "Transaction committed");

        let mut committed = committed;
        committed.sort_by_key(|e| e.sequence_number);
        Ok(committed)
    }

    /// Publish several events atomically.
    pub async fn publish_batch(self: &Arc<Self>, drafts: Vec<EventDraft>, producer_id: &str) -> Result<Vec<EventLogEntry>> {
        let id = self.begin_transaction(producer_id, None)?;
        for draft in drafts {
            if let Err(e) = self.add_to_transaction(&id, draft) {
                let _ = self.abort_transaction(&id);
                return Err(e);
            }
        }
        self.commit_transaction(&id).await
    }

    // ── Subscriptions ───────────────────────────────────────────

    /// Register a subscription. With `start_offset` set, past matching events
    /// up to the current high-water mark are replayed before this returns;
    /// everything that becomes durable afterwards is delivered live.
    pub async fn subscribe(
        self: &Arc<Self>,
        subscriber_id: &str,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<String> {
        let pattern = TopicPattern::parse(topic)?;
        if let Some(p) = options.partition {
            if p >= self.partitions() {
                return Err(WeftError::Validation(format!("partition {} out of range", p)));
            }
        }

        let sub = Arc::new(Subscription {
            id: weft_core::types::new_id(),
            subscriber_id: subscriber_id.to_string(),
            pattern,
            partition: options.partition,
            filter: options.filter.clone(),
            ack_mode: options.ack_mode,
            max_retries: options.max_retries.unwrap_or(self.config.default_max_retries),
            retry_delay: options
                .retry_delay
                .unwrap_or_else(|| Duration::from_millis(self.config.default_retry_delay_ms)),
            backoff: options.backoff,
            dead_letter_topic: options.dead_letter_topic.clone(),
            handler,
            active: AtomicBool::new(true),
            counters: Counters::default(),
        });

        let replay_bounds = {
            let _guard = self.flush_lock.lock().await;
            if let Err(e) = self.flush_locked().await {
                warn!(error = %e, "Flush before subscribe failed");
            }
            let mut subs = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
            let mut next: Vec<Arc<Subscription>> = subs.as_ref().clone();
            next.push(Arc::clone(&sub));
            *subs = Arc::new(next);
            self.high_water.lock().unwrap_or_else(PoisonError::into_inner).clone()
        };

        info!(
            subscription = %sub.id,
            subscriber = %sub.subscriber_id,
            topic = %sub.pattern,
            "Subscription registered"
        );

        if let Some(start) = options.start_offset {
            self.replay(&sub, start, options.end_offset, &replay_bounds).await;
        }
        Ok(sub.id.clone())
    }

    async fn replay(
        self: &Arc<Self>,
        sub: &Arc<Subscription>,
        start: u64,
        end: Option<u64>,
        bounds: &[Option<u64>],
    ) {
        let partitions: Vec<usize> = match (sub.partition, sub.pattern.exact()) {
            (Some(p), _) => vec![p],
            (None, Some(topic)) => vec![self.partition_for(topic)],
            (None, None) => (0..self.partitions()).collect(),
        };

        let mut events = Vec::new();
        for p in partitions {
            let Some(bound) = bounds.get(p).copied().flatten() else { continue };
            let upper = end.map_or(bound, |e| e.min(bound));
            if upper < start {
                continue;
            }
            let mut stream = self.log.read_events(start, Some(upper), Some(p));
            while let Some(item) = stream.next().await {
                match item {
                    Ok(entry) if sub.accepts(&entry) => events.push(entry),
                    Ok(_) => {}
                    Err(e) => warn!(subscription = %sub.id, partition = p, error = %e, "Skipping unreadable event during replay"),
                }
            }
        }
        events.sort_by_key(|e| e.sequence_number);

        info!(subscription = %sub.id, count = events.len(), from = start, "Replaying events");
        for entry in events {
            self.deliver(sub, entry).await;
        }
    }

    /// Remove a subscription. Retries already in flight stop at their next attempt.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut subs = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        let Some(pos) = subs.iter().position(|s| s.id == subscription_id) else {
            return false;
        };
        let mut next: Vec<Arc<Subscription>> = subs.as_ref().clone();
        let removed = next.remove(pos);
        removed.active.store(false, Ordering::SeqCst);
        *subs = Arc::new(next);
        info!(subscription = %subscription_id, "Subscription removed");
        true
    }

    pub fn subscription_stats(&self, subscription_id: &str) -> Option<SubscriptionStats> {
        self.subscription_snapshot()
            .iter()
            .find(|s| s.id == subscription_id)
            .map(|s| s.counters.snapshot())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscription_snapshot().len()
    }

    async fn dispatch_batch(self: &Arc<Self>, batch: DeliveryBatch) {
        for entry in batch.entries {
            for sub in batch.subscriptions.iter() {
                if sub.active.load(Ordering::SeqCst) && sub.accepts(&entry) {
                    self.deliver(sub, entry.clone()).await;
                }
            }
        }
    }

    /// First attempt inline; retries run in their own task so a failing
    /// subscriber never holds up the others.
    async fn deliver(self: &Arc<Self>, sub: &Arc<Subscription>, entry: EventLogEntry) {
        match sub.handler.handle(entry.clone()).await {
            Ok(()) => sub.counters.delivered(),
            Err(e) => {
                sub.counters.failed();
                warn!(
                    subscription = %sub.id,
                    subscriber = %sub.subscriber_id,
                    event = %entry.id,
                    error = %e,
                    "Delivery failed"
                );
                if sub.max_retries == 0 {
                    self.dead_letter(sub, &entry, &e.to_string(), 1).await;
                    return;
                }
                let bus = Arc::clone(self);
                let sub = Arc::clone(sub);
                tokio::spawn(async move {
                    bus.retry_delivery(sub, entry, e.to_string()).await;
                });
            }
        }
    }

    async fn retry_delivery(self: Arc<Self>, sub: Arc<Subscription>, entry: EventLogEntry, first_error: String) {
        let mut last_error = first_error;
        for attempt in 1..=sub.max_retries {
            let delay = sub.backoff.delay(sub.retry_delay, attempt);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if !sub.active.load(Ordering::SeqCst) {
                debug!(subscription = %sub.id, "Subscription removed, abandoning retries");
                return;
            }
            match sub.handler.handle(entry.clone()).await {
                Ok(()) => {
                    sub.counters.delivered();
                    debug!(subscription = %sub.id, event = %entry.id, attempt, "Delivery succeeded on retry");
                    return;
                }
                Err(e) => {
                    sub.counters.failed();
                    warn!(
                        subscription = %sub.id,
                        event = %entry.id,
                        attempt,
                        max_retries = sub.max_retries,
                        error = %e,
                        "Delivery retry failed"
                    );
                    last_error = e.to_string();
                }
            }
        }
        self.dead_letter(&sub, &entry, &last_error, sub.max_retries + 1).await;
    }

    /// Divert an undeliverable event to the subscription's dead-letter topic.
    ///
    /// Events that are themselves dead letters are dropped instead of being
    /// diverted again.
    async fn dead_letter(&self, sub: &Subscription, entry: &EventLogEntry, error: &str, attempts: u32) {
        let Some(topic) = sub.dead_letter_topic.as_deref() else {
            error!(subscription = %sub.id, event = %entry.id, attempts, "Delivery failed permanently, no dead-letter topic");
            return;
        };
        if entry.metadata.contains_key(DEAD_LETTER_KEY) {
            error!(subscription = %sub.id, event = %entry.id, "Dead-letter event failed delivery, dropping");
            return;
        }

        let draft = EventDraft::new(
            topic,
            "dead_letter",
            serde_json::json!({
                "originalEvent": entry,
                "error": error,
                "subscriptionId": sub.id,
                "subscriberId": sub.subscriber_id,
                "attempts": attempts,
            }),
        )
        .with_metadata(DEAD_LETTER_KEY, "true")
        .with_metadata("originalTopic", entry.topic.clone());

        match self.publish_draft(draft, DEAD_LETTER_PRODUCER).await {
            Ok(dl) => {
                sub.counters.dead_lettered();
                warn!(subscription = %sub.id, event = %entry.id, topic, dead_letter = %dl.id, "Event dead-lettered");
            }
            Err(e) => error!(subscription = %sub.id, event = %entry.id, error = %e, "Failed to publish dead letter"),
        }
    }

    // ── Reads ───────────────────────────────────────────────────

    /// Read durable events, sorted by sequence number.
    ///
    /// `topic` may be an exact name or a pattern. Buffered events are flushed
    /// first, so callers always see their own earlier publishes.
    pub async fn get_events(
        &self,
        topic: Option<&str>,
        start_offset: Option<u64>,
        end_offset: Option<u64>,
        partition: Option<usize>,
    ) -> Result<Vec<EventLogEntry>> {
        let pattern = topic.map(TopicPattern::parse).transpose()?;
        let partition = match (partition, pattern.as_ref().and_then(|p| p.exact())) {
            (Some(p), Some(t)) if p != self.partition_for(t) => return Ok(vec![]),
            (Some(p), _) => Some(p),
            (None, Some(t)) => Some(self.partition_for(t)),
            (None, None) => None,
        };

        let _guard = self.flush_lock.lock().await;
        if let Err(e) = self.flush_locked().await {
            warn!(error = %e, "Flush before read failed, buffered events not visible");
        }

        let mut events = Vec::new();
        let mut stream = self.log.read_events(start_offset.unwrap_or(0), end_offset, partition);
        while let Some(item) = stream.next().await {
            let entry = item?;
            if pattern.as_ref().map_or(true, |p| p.matches(&entry.topic)) {
                events.push(entry);
            }
        }
        events.sort_by_key(|e| e.sequence_number);
        Ok(events)
    }

    /// Latest durable offset of a partition, or the highest across all
    /// partitions. Served from the in-memory high-water marks.
    pub fn get_latest_offset(&self, partition: Option<usize>) -> Option<u64> {
        let hw = self.high_water.lock().unwrap_or_else(PoisonError::into_inner);
        match partition {
            Some(p) => hw.get(p).copied().flatten(),
            None => hw.iter().flatten().copied().max(),
        }
    }

    /// Number of buffered, not yet durable events.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

async fn run_delivery(bus: Weak<EventBus>, mut rx: mpsc::UnboundedReceiver<DeliveryBatch>) {
    while let Some(batch) = rx.recv().await {
        let Some(bus) = bus.upgrade() else { break };
        bus.dispatch_batch(batch).await;
    }
    debug!("Delivery task stopped");
}
