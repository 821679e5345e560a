//! Consumer loop.
//!
//! One `Consumer` is one consumer identity inside the shared group. It owns its
//! subscription registry and a dedicated group reader, and repeatedly:
//!
//! 1. claims a batch (own pending entries first, then new records),
//! 2. decodes and dispatches each record under the retry policy,
//! 3. acknowledges records that were processed, or dead-letters and then
//!    acknowledges records whose processing was exhausted.
//!
//! Handler errors never fail processing. Transport errors drop the reader,
//! reconnect the shared connection and resume from the pending list, so an
//! in-flight record is never counted as a failed attempt because of them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use agilebus_events::{EventType, SharedHandler, SubscriptionRegistry, decode_record};

use crate::broker::{BrokerError, GroupReader, ReadFrom, StreamBroker, StreamEntry};
use crate::config::BusConfig;
use crate::connection::ConnectionManager;
use crate::dead_letter::DeadLetterStore;
use crate::error::{ConnectError, ProcessError};
use crate::retry::retry;

/// Counters accumulated by one consumer loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    /// Records settled (acknowledged or dead-lettered).
    pub processed: u64,
    pub acked: u64,
    pub dead_lettered: u64,
    pub handlers_invoked: u64,
    pub handler_failures: u64,
}

/// Cooperative stop flag, checked at the top of every loop iteration.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
enum LoopError {
    Connection(String),
    Other(String),
}

impl From<BrokerError> for LoopError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Connection(msg) => LoopError::Connection(msg),
            other => LoopError::Other(other.to_string()),
        }
    }
}

impl From<ConnectError> for LoopError {
    fn from(e: ConnectError) -> Self {
        LoopError::Connection(e.to_string())
    }
}

/// How a claimed record left the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Acked,
    DeadLettered,
    /// Dead-letter append was rejected; the record stays pending.
    LeftPending,
}

pub struct Consumer {
    name: String,
    registry: SubscriptionRegistry,
    connection: Arc<ConnectionManager>,
    dead_letters: DeadLetterStore,
    config: BusConfig,
    stop: StopSignal,
    stats: ConsumerStats,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("registry", &self.registry)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    /// `name` defaults to `consumer_<8 hex chars>`.
    pub fn new(
        connection: Arc<ConnectionManager>,
        config: BusConfig,
        name: Option<String>,
    ) -> Self {
        let name = name.unwrap_or_else(default_consumer_name);
        let dead_letters = DeadLetterStore::new(config.dlq_stream.clone());
        Self {
            name,
            registry: SubscriptionRegistry::new(),
            connection,
            dead_letters,
            config,
            stop: StopSignal::default(),
            stats: ConsumerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Register `handler` for `event_types`; returns this consumer's name.
    pub fn subscribe(&mut self, event_types: &[EventType], handler: SharedHandler) -> &str {
        self.registry.subscribe(event_types, handler);
        &self.name
    }

    pub fn unsubscribe(&mut self, event_type: EventType, handler: &SharedHandler) -> bool {
        self.registry.unsubscribe(event_type, handler)
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Run the loop in a background task.
    pub fn spawn(mut self) -> ConsumerHandle {
        let stop = self.stop.clone();
        let name = self.name.clone();
        let join = tokio::spawn(async move { self.run().await });
        ConsumerHandle { name, stop, join }
    }

    /// Run until the stop signal is raised; returns the accumulated counters.
    ///
    /// The current batch is finished before the loop exits.
    #[instrument(skip(self), fields(consumer = %self.name))]
    pub async fn run(&mut self) -> ConsumerStats {
        info!(types = ?self.registry.subscribed_types(), "consumer started");

        let mut reader: Option<Box<dyn GroupReader>> = None;
        let mut from = ReadFrom::Pending;

        while !self.stop.is_stopped() {
            match self.poll(&mut reader, &mut from).await {
                Ok(()) => {}
                Err(LoopError::Connection(e)) => {
                    warn!(error = %e, "consumer lost broker connection");
                    reader = None;
                    from = ReadFrom::Pending;
                    if let Err(e) = self.connection.reconnect().await {
                        error!(error = %e, "reconnect failed");
                        tokio::time::sleep(self.connection.reconnect_delay() * 2).await;
                    }
                }
                Err(LoopError::Other(e)) => {
                    error!(error = %e, "consumer loop error");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }

        info!(
            processed = self.stats.processed,
            acked = self.stats.acked,
            dead_lettered = self.stats.dead_lettered,
            handler_failures = self.stats.handler_failures,
            "consumer stopped"
        );
        self.stats
    }

    async fn poll(
        &mut self,
        reader: &mut Option<Box<dyn GroupReader>>,
        from: &mut ReadFrom,
    ) -> Result<(), LoopError> {
        let broker = self.connection.broker().await?;
        if reader.is_none() {
            *reader = Some(broker.reader().await?);
        }
        let Some(reader) = reader.as_mut() else {
            return Ok(());
        };

        let batch = reader
            .read(
                &self.config.stream,
                &self.config.group,
                &self.name,
                *from,
                self.config.batch_size,
                self.config.block_timeout,
            )
            .await?;
        let claimed = batch.len();

        let mut all_acked = true;
        for entry in batch {
            let settlement = self.settle(broker.as_ref(), entry).await?;
            all_acked &= settlement != Settlement::LeftPending;
        }

        // Keep draining the pending list only while it is making progress;
        // anything left behind is retried after the next reconnect.
        if *from == ReadFrom::Pending && (claimed < self.config.batch_size || !all_acked) {
            debug!("pending list drained, switching to new records");
            *from = ReadFrom::New;
        }
        Ok(())
    }

    /// Process one claimed record and acknowledge or dead-letter it.
    async fn settle(
        &mut self,
        broker: &dyn StreamBroker,
        entry: StreamEntry,
    ) -> Result<Settlement, LoopError> {
        let registry = &self.registry;
        let record = &entry;
        let processed = retry(&self.config.retry, "process", |_| async move {
            let envelope = decode_record(&record.fields).map_err(ProcessError::from)?;
            Ok::<_, ProcessError>(registry.dispatch(&record.id, &envelope).await)
        })
        .await;

        let settlement = match processed {
            Ok(report) => {
                self.stats.handlers_invoked += report.invoked as u64;
                self.stats.handler_failures += report.failed as u64;
                self.ack(broker, &entry.id).await?;
                Settlement::Acked
            }
            Err(exhausted) => {
                let recorded = self
                    .dead_letters
                    .record_failed_message(
                        broker,
                        &entry.id,
                        &entry.fields,
                        &exhausted.last_error.to_string(),
                        exhausted.attempts,
                    )
                    .await;
                match recorded {
                    Ok(_) => {
                        self.ack(broker, &entry.id).await?;
                        self.stats.dead_lettered += 1;
                        Settlement::DeadLettered
                    }
                    Err(e) if e.is_connection() => return Err(e.into()),
                    Err(e) => {
                        error!(message_id = %entry.id, error = %e, "record left pending");
                        Settlement::LeftPending
                    }
                }
            }
        };

        if settlement != Settlement::LeftPending {
            self.stats.processed += 1;
        }
        Ok(settlement)
    }

    async fn ack(&mut self, broker: &dyn StreamBroker, message_id: &str) -> Result<(), LoopError> {
        broker
            .ack(&self.config.stream, &self.config.group, &[message_id.to_string()])
            .await?;
        self.stats.acked += 1;
        Ok(())
    }
}

fn default_consumer_name() -> String {
    let id = Uuid::now_v7().simple().to_string();
    format!("consumer_{}", &id[id.len() - 8..])
}

/// Handle to a consumer running in a background task.
#[derive(Debug)]
pub struct ConsumerHandle {
    name: String,
    stop: StopSignal,
    join: JoinHandle<ConsumerStats>,
}

impl ConsumerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the loop to stop after its current batch.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) -> Result<ConsumerStats, tokio::task::JoinError> {
        self.stop();
        self.join.await
    }
}
