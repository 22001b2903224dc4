use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::kafka::acks::AckGroupManager;
use crate::kafka::buffer::InMemoryBuffer;
use crate::kafka::client::KafkaTransport;
use crate::kafka::consumer::{KafkaSourceConsumer, SourceState};
use crate::kafka::transport::ConsumerTransport;

/// The ingest service: N consumer workers feeding one bounded buffer, plus a
/// drain task that hands buffered events to their sink and releases their
/// acknowledgement handles.
pub struct IngestService {
    config: Config,
    buffer: Arc<InMemoryBuffer>,
    shutdown: Arc<AtomicBool>,
}

impl IngestService {
    pub fn new(config: Config) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "configuration invalid for topic '{}' and group '{}'",
                config.kafka_consumer_topic, config.kafka_consumer_group
            )
        })?;
        let buffer = Arc::new(InMemoryBuffer::new(config.buffer_capacity));
        Ok(Self {
            config,
            buffer,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The downstream buffer, for embedding the source into a larger
    /// pipeline.
    pub fn buffer(&self) -> Arc<InMemoryBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run until a shutdown signal arrives, then drain to a final commit.
    pub async fn run(self) -> Result<()> {
        let mut workers = Vec::with_capacity(self.config.consumer_workers);
        let mut transports = Vec::with_capacity(self.config.consumer_workers);
        for worker in 0..self.config.consumer_workers {
            let (handle, transport) = self.spawn_worker(worker)?;
            workers.push(handle);
            transports.push(transport);
        }

        let drain = self.spawn_drain_task();

        {
            let shutdown = Arc::clone(&self.shutdown);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    shutdown.store(true, Ordering::Release);
                    for transport in &transports {
                        transport.wake();
                    }
                }
            });
        }

        for (worker, handle) in workers.into_iter().enumerate() {
            handle
                .await
                .with_context(|| format!("consumer worker {worker} panicked"))??;
        }

        // Workers are done; let the drain task flush what's left and stop.
        self.shutdown.store(true, Ordering::Release);
        drain.await.ok();
        info!("ingest service stopped");
        Ok(())
    }

    fn spawn_worker(
        &self,
        worker: usize,
    ) -> Result<(JoinHandle<Result<()>>, Arc<dyn ConsumerTransport>)> {
        let (state, listener) = SourceState::shared(
            self.config.commit_interval(),
            self.config.kafka_consumer_auto_commit,
        );
        let transport: Arc<dyn ConsumerTransport> = Arc::new(
            KafkaTransport::new(
                self.config.build_client_config(),
                listener,
                self.config.max_batch_size,
            )
            .with_context(|| format!("failed to create transport for worker {worker}"))?,
        );
        let decoder = self.config.build_decoder()?;
        let acks = self.config.acknowledgments.then(|| {
            AckGroupManager::new(Handle::current(), self.config.acknowledgment_timeout())
        });
        let consumer = KafkaSourceConsumer::new(
            Arc::clone(&transport),
            state,
            self.buffer(),
            decoder,
            acks,
            self.config.to_consumer_config(),
            Arc::clone(&self.shutdown),
        );

        let handle = tokio::task::spawn_blocking(move || {
            let result = consumer.run();
            if let Err(e) = &result {
                error!(worker, error = format!("{e:#}"), "consumer worker failed");
            }
            result
        });
        Ok((handle, transport))
    }

    /// Standalone sink: log each event and release its acknowledgement. An
    /// embedding pipeline replaces this by draining `buffer()` itself.
    fn spawn_drain_task(&self) -> JoinHandle<()> {
        let buffer = self.buffer();
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            loop {
                match buffer.pop() {
                    Some(record) => {
                        debug!(attributes = ?record.event.attributes(), "drained event");
                        if let Some(ack) = record.ack {
                            ack.ack();
                        }
                    }
                    None => {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(25)).await;
                    }
                }
            }
        })
    }
}
