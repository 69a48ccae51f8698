use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use swarmstats::master::Master;
use swarmstats::registry::NodeSnapshot;
use swarmstats::runner::{RunState, StaticRunner};
use swarmstats::stats::{EndpointKey, EndpointStats};
use swarmstats::transport::{
    select_with, BackendKind, Message, MessageKind, PlainSocketTransport, ReportPayload,
    Transport, TransportConfig,
};

/// When the preferred backend is unavailable the selector must fall back to
/// the plain socket backend, and the system must still exchange a
/// round-tripped message end to end.
#[tokio::test]
async fn fallback_selection_still_exchanges_messages() -> Result<()> {
    let (transport, kind) = select_with(false);
    assert_eq!(kind, BackendKind::PlainSocket);

    let runner = Arc::new(StaticRunner::new(RunState::Running, 5));
    let mut master = Master::new(transport, runner);
    master
        .bind(&TransportConfig {
            port: 0,
            ..Default::default()
        })
        .await?;
    let port = master.local_addr().unwrap().port();

    let mut worker = PlainSocketTransport::new();
    worker
        .connect(&TransportConfig {
            port,
            ..Default::default()
        })
        .await?;

    worker
        .send(
            "master",
            &Message::new(MessageKind::NodeReady, "worker-1", vec![]),
        )
        .await?;

    let mut stats = BTreeMap::new();
    let mut entry = EndpointStats::new();
    entry.log(42, 128);
    stats.insert(EndpointKey::new("GET", "/ping"), entry);
    worker
        .send(
            "master",
            &Message::with_payload(
                MessageKind::Report,
                "worker-1",
                &ReportPayload {
                    snapshot: NodeSnapshot::new("worker-1", stats),
                },
            )?,
        )
        .await?;

    master.process_one().await?;
    master.process_one().await?;

    let cached = master.report(Duration::from_secs(2)).await?;
    assert_eq!(cached.report.worker_count, 1);
    assert_eq!(cached.report.stats[0].num_requests, 1);
    assert_eq!(cached.report.stats[0].name, "/ping");

    worker.close().await?;
    master.shutdown().await?;
    Ok(())
}
