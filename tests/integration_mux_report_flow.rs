#![cfg(feature = "mux-transport")]

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use swarmstats::master::Master;
use swarmstats::registry::NodeSnapshot;
use swarmstats::runner::{RunState, StaticRunner};
use swarmstats::stats::{EndpointKey, EndpointStats};
use swarmstats::transport::{
    generate_node_id, select_transport, BackendKind, CommandPayload, Message, MessageKind,
    MuxTransport, ReportPayload, Transport, TransportConfig,
};

fn snapshot(node_id: &str, requests: u64, response_time: u64) -> ReportPayload {
    let mut stats = BTreeMap::new();
    let mut entry = EndpointStats::new();
    for _ in 0..requests {
        entry.log(response_time, 64);
    }
    stats.insert(EndpointKey::new("GET", "/x"), entry);
    ReportPayload {
        snapshot: NodeSnapshot::new(node_id, stats),
    }
}

/// Full master/worker exchange over the preferred multiplexing backend:
/// worker announces itself, streams a statistics report, the master
/// aggregates it and routes a command back.
#[tokio::test]
async fn mux_master_worker_report_flow() -> Result<()> {
    let (transport, kind) = select_transport();
    assert_eq!(kind, BackendKind::Mux);

    let runner = Arc::new(StaticRunner::new(RunState::Running, 25));
    let mut master = Master::new(transport, runner);
    master
        .bind(&TransportConfig {
            port: 0,
            ..Default::default()
        })
        .await?;
    let port = master.local_addr().unwrap().port();

    let mut worker = MuxTransport::new();
    worker
        .connect(&TransportConfig {
            port,
            ..Default::default()
        })
        .await?;

    let node_id = generate_node_id();
    worker
        .send(
            "master",
            &Message::new(MessageKind::NodeReady, node_id.as_str(), vec![]),
        )
        .await?;
    worker
        .send(
            "master",
            &Message::with_payload(
                MessageKind::Report,
                node_id.as_str(),
                &snapshot(&node_id, 12, 80),
            )?,
        )
        .await?;

    master.process_one().await?; // NodeReady
    master.process_one().await?; // Report

    let cached = master.report(Duration::from_secs(2)).await?;
    assert_eq!(cached.report.worker_count, 1);
    assert_eq!(cached.report.user_count, 25);
    assert_eq!(cached.report.stats.len(), 1);
    assert_eq!(cached.report.stats[0].num_requests, 12);
    assert_eq!(cached.report.total.num_requests, 12);

    // The master can route a command back to the identified worker.
    master
        .send_command(
            &node_id,
            CommandPayload {
                command: "stop".to_string(),
                data: vec![],
            },
        )
        .await?;
    let command = worker.receive().await?;
    assert_eq!(command.kind, MessageKind::Command);

    worker.close().await?;
    master.shutdown().await?;
    Ok(())
}

/// Two workers reporting the same endpoint merge into one row with exact
/// counts and a weight-dominated median.
#[tokio::test]
async fn mux_two_workers_merge() -> Result<()> {
    let (transport, _) = select_transport();
    let runner = Arc::new(StaticRunner::new(RunState::Running, 40));
    let mut master = Master::new(transport, runner);
    master
        .bind(&TransportConfig {
            port: 0,
            ..Default::default()
        })
        .await?;
    let port = master.local_addr().unwrap().port();

    for (node_id, requests, response_time) in
        [("worker-a", 10u64, 100u64), ("worker-b", 30, 150)]
    {
        let mut worker = MuxTransport::new();
        worker
            .connect(&TransportConfig {
                port,
                ..Default::default()
            })
            .await?;
        worker
            .send(
                "master",
                &Message::new(MessageKind::NodeReady, node_id, vec![]),
            )
            .await?;
        worker
            .send(
                "master",
                &Message::with_payload(
                    MessageKind::Report,
                    node_id,
                    &snapshot(node_id, requests, response_time),
                )?,
            )
            .await?;
        master.process_one().await?;
        master.process_one().await?;
        worker.close().await?;
    }

    let cached = master.report(Duration::from_secs(2)).await?;
    let row = &cached.report.stats[0];
    assert_eq!(row.num_requests, 40);
    assert_eq!(row.median_response_time, Some(150));
    assert_eq!(row.min_response_time, Some(100));

    master.shutdown().await?;
    Ok(())
}
