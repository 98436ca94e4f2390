//! Service wiring
//!
//! Builds the shared state once and spawns one task per channel, the
//! aggregator and the stream control server.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::channel::{channels_from_config, run_with_retry, Channel, ChannelListener};
use crate::config::Config;
use crate::grid::{Aggregator, GridError};
use crate::metrics::Metrics;
use crate::sink::FileSink;
use crate::store::SnapshotStore;
use crate::stream::{spawn_control, SubscriptionManager};

/// The telemetry grid service
pub struct TelemetryGrid {
    config: Config,
    channels: Vec<Channel>,
    store: Arc<SnapshotStore>,
    metrics: Arc<Metrics>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Handles to a started grid
pub struct RunningGrid {
    /// Bound address per channel, `None` while its bind is being retried
    pub ingest_addrs: Vec<(String, Option<SocketAddr>)>,

    /// Stream socket address, if streaming is active
    pub stream_addr: Option<SocketAddr>,

    pub stream: Option<Arc<SubscriptionManager>>,

    handles: Vec<JoinHandle<()>>,
}

impl TelemetryGrid {
    pub fn new(config: Config) -> Self {
        let channels = channels_from_config(&config.ingest);
        let store = Arc::new(SnapshotStore::new(channels.len()));
        let metrics = Arc::new(Metrics::new(channels.iter().map(|c| c.name.clone())));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            channels,
            store,
            metrics,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn store(&self) -> Arc<SnapshotStore> {
        self.store.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Sender that stops every task when fired
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind sockets, open the log and spawn every task
    ///
    /// Failing to open the frame log is the only fatal error. A stream
    /// socket that cannot be bound disables streaming; an ingest port that
    /// cannot be bound is retried in the background.
    pub async fn start(&self) -> Result<RunningGrid, GridError> {
        let log_path = self.config.grid.log_path.clone();
        let sink = FileSink::append(&log_path).map_err(|source| GridError::OpenLog {
            path: log_path.clone(),
            source,
        })?;
        tracing::info!(
            "Logging flat frames to {} (dt={}ms)",
            log_path.display(),
            self.config.grid.frame_interval_ms
        );

        let mut handles = Vec::new();

        // Stream socket
        let stream = if self.config.stream.enabled {
            let cfg = &self.config.stream;
            match SubscriptionManager::bind(&cfg.host, cfg.port, cfg.max_subscribers, cfg.subscriber_ttl())
                .await
            {
                Ok(manager) => {
                    let manager = Arc::new(
                        manager
                            .with_static_targets(cfg.static_targets.clone())
                            .with_metrics(self.metrics.clone()),
                    );
                    handles.push(spawn_control(manager.clone(), &self.shutdown_tx));
                    Some(manager)
                }
                Err(e) => {
                    tracing::error!("{}; streaming disabled", e);
                    None
                }
            }
        } else {
            None
        };
        let stream_addr = stream.as_ref().and_then(|s| s.local_addr().ok());

        // Ingest channels
        let ingest = &self.config.ingest;
        let mut ingest_addrs = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            match ChannelListener::bind(
                channel.clone(),
                &ingest.host,
                self.store.clone(),
                self.metrics.clone(),
            )
            .await
            {
                Ok(listener) => {
                    ingest_addrs.push((channel.name.clone(), listener.local_addr().ok()));
                    let listener = listener
                        .with_buffer_size(ingest.recv_buffer_bytes)
                        .with_shutdown(&self.shutdown_tx);
                    handles.push(tokio::spawn(listener.run()));
                }
                Err(e) => {
                    tracing::error!(channel = %channel.name, "{}, retrying in background", e);
                    ingest_addrs.push((channel.name.clone(), None));
                    handles.push(tokio::spawn(run_with_retry(
                        channel.clone(),
                        ingest.clone(),
                        self.store.clone(),
                        self.metrics.clone(),
                        self.shutdown_tx.clone(),
                    )));
                }
            }
        }

        // Aggregator
        let mut aggregator = Aggregator::new(
            self.channels.clone(),
            self.store.clone(),
            self.metrics.clone(),
            Box::new(sink),
            self.config.grid.frame_interval(),
        )
        .with_identity_field(ingest.identity_field())
        .with_stats_every(self.config.grid.stats_every_frames)
        .with_shutdown(&self.shutdown_tx);
        if let Some(stream) = &stream {
            aggregator = aggregator.with_stream(stream.clone());
        }
        handles.push(tokio::spawn(async move {
            if let Err(e) = aggregator.run().await {
                tracing::error!("Aggregator error: {}", e);
            }
        }));

        tracing::info!(
            channels = self.channels.len(),
            streaming = stream.is_some(),
            "All listeners started"
        );

        Ok(RunningGrid {
            ingest_addrs,
            stream_addr,
            stream,
            handles,
        })
    }

    /// Fire the shutdown signal
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl RunningGrid {
    /// Bound ingest address of a channel
    pub fn ingest_addr(&self, channel: &str) -> Option<SocketAddr> {
        self.ingest_addrs
            .iter()
            .find(|(name, _)| name == channel)
            .and_then(|(_, addr)| *addr)
    }

    /// Wait for every task to finish
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Task failed: {}", e);
            }
        }
    }
}
