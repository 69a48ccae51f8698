//! Master-side coordination: owns the node registry, the exception
//! aggregator, the snapshot cache and the selected transport, and wires
//! inbound worker messages to them.
//!
//! Construction and teardown are tied to run start/stop by whoever embeds
//! [`Master`]; nothing here lives in global state.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{CachedReport, LoadFactor, SnapshotCache};
use crate::exceptions::{ExceptionAggregator, ExceptionRecord};
use crate::registry::NodeRegistry;
use crate::runner::RunnerView;
use crate::stats::StatsAggregator;
use crate::transport::{
    CommandPayload, ExceptionPayload, HeartbeatPayload, Message, MessageKind, ReportPayload,
    Transport, TransportConfig, TransportError,
};

/// Statistics master: accepts worker reports over the selected transport and
/// serves merged aggregate reports to the presentation layer.
pub struct Master {
    registry: Arc<NodeRegistry>,
    exceptions: Arc<ExceptionAggregator>,
    cache: SnapshotCache,
    transport: Box<dyn Transport>,
    runner: Arc<dyn RunnerView>,
}

impl Master {
    pub fn new(transport: Box<dyn Transport>, runner: Arc<dyn RunnerView>) -> Self {
        Self {
            registry: Arc::new(NodeRegistry::new()),
            exceptions: Arc::new(ExceptionAggregator::new()),
            cache: SnapshotCache::new(),
            transport,
            runner,
        }
    }

    /// Start listening for worker connections.
    pub async fn bind(&mut self, config: &TransportConfig) -> Result<()> {
        self.transport.bind(config).await?;
        info!(
            "Master listening via {} transport on {:?}",
            self.transport.name(),
            self.transport.local_addr()
        );
        Ok(())
    }

    /// Bound address of the underlying transport, once bound.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    pub fn registry(&self) -> Arc<NodeRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn worker_count(&self) -> usize {
        self.registry.len()
    }

    /// Receive and dispatch inbound messages until the transport closes.
    ///
    /// Handler failures for a single message (e.g. a report from an unknown
    /// node) are logged and do not stop the loop; transport failures end it.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            match self.transport.receive().await {
                Ok(message) => {
                    if let Err(e) = self.handle_message(message).await {
                        warn!("Failed to handle worker message: {}", e);
                    }
                }
                Err(TransportError::Timeout(_)) => continue,
                Err(e) => {
                    info!("Transport stopped: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Receive and dispatch a single envelope, propagating any failure.
    pub async fn process_one(&mut self) -> Result<()> {
        let message = self.transport.receive().await?;
        self.handle_message(message).await
    }

    /// Dispatch one inbound envelope to the owning component.
    pub async fn handle_message(&mut self, message: Message) -> Result<()> {
        match message.kind {
            MessageKind::NodeReady => {
                self.registry.register(&message.node_id);
            }
            MessageKind::Report => {
                let payload: ReportPayload = message.decode_payload()?;
                self.registry.report(&message.node_id, payload.snapshot)?;
            }
            MessageKind::Exception => {
                let payload: ExceptionPayload = message.decode_payload()?;
                self.exceptions
                    .record(&payload.msg, &payload.traceback, &message.node_id);
            }
            MessageKind::Heartbeat => {
                let payload: HeartbeatPayload = message.decode_payload()?;
                self.registry
                    .heartbeat(&message.node_id, payload.state, payload.user_count)?;
            }
            MessageKind::NodeQuit => {
                self.registry.remove(&message.node_id);
                self.transport.disconnect(&message.node_id).await?;
            }
            MessageKind::Command => {
                // Commands flow master -> worker only.
                debug!("Ignoring inbound command from {}", message.node_id);
            }
        }
        Ok(())
    }

    /// The current aggregate report, served from the snapshot cache.
    ///
    /// Recomputation is throttled harder as load grows; see
    /// [`crate::cache::default_ttl_policy`].
    pub async fn report(&self, base_ttl: Duration) -> Result<CachedReport> {
        let registry = Arc::clone(&self.registry);
        let runner = Arc::clone(&self.runner);

        let snapshots = registry.snapshots();
        let load = LoadFactor {
            worker_count: snapshots.len(),
            total_requests: snapshots
                .iter()
                .flat_map(|s| s.stats.values())
                .map(|e| e.num_requests)
                .sum(),
        };
        drop(snapshots);

        self.cache
            .get_or_compute(base_ttl, load, move || {
                let snapshots = registry.snapshots();
                Ok(StatsAggregator::build_report(
                    snapshots.iter().map(|s| &s.stats),
                    runner.state(),
                    snapshots.len(),
                    runner.user_count(),
                ))
            })
            .await
    }

    /// Deduplicated exception records for reporting and export.
    pub fn exceptions(&self) -> Vec<ExceptionRecord> {
        self.exceptions.list()
    }

    /// Clear all endpoint statistics and exception records; the next report
    /// is recomputed from the cleared state.
    pub async fn reset_all(&self) {
        self.registry.reset();
        self.exceptions.reset();
        self.cache.invalidate().await;
        info!("All statistics reset");
    }

    /// Forward a control command to one worker node.
    pub async fn send_command(&mut self, node_id: &str, command: CommandPayload) -> Result<()> {
        let message = Message::with_payload(MessageKind::Command, "master", &command)?;
        self.transport.send(node_id, &message).await?;
        Ok(())
    }

    /// Close the transport; in-flight worker operations are abandoned.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.transport.close().await?;
        Ok(())
    }
}
