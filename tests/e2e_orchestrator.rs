//! Orchestrator end-to-end behavior: ordering, truncation, failure folding.
//!
//! These runs use nodes whose TCP probe cannot succeed, so no working engine
//! binary is required; the pool warms up with a no-op command that exits.

use subprobe::config::Config;
use subprobe::subscription::Node;
use subprobe::tester::{TestOrchestrator, TestStatus};

fn test_config() -> Config {
    let mut config = Config::default();
    // `false` exits immediately, so pool init finds zero live workers and the
    // run proceeds on probe results alone
    config.proxy.engine = "false".to_string();
    config.proxy.port_range.start = 22800;
    config.proxy.port_range.end = 22810;
    config.proxy.startup.parallel_limit = 2;
    config.proxy.startup.warmup_time = 0.05;
    config.proxy.startup.health_check = false;
    config.test.timeout.connect = 1;
    config
}

fn unreachable_node(i: usize) -> Node {
    let mut node = Node::empty(
        format!("node-{}", i),
        "vless".to_string(),
        // TEST-NET-1: guaranteed unroutable
        format!("203.0.113.{}", i + 1),
        1,
    );
    node.uuid = Some("00000000-0000-0000-0000-000000000000".to_string());
    node
}

fn orchestrator(config: Config) -> TestOrchestrator {
    let work_dir = tempfile::tempdir().unwrap().keep();
    TestOrchestrator::with_work_dir(config, work_dir)
}

#[tokio::test]
async fn empty_input_yields_empty_results() {
    let results = orchestrator(test_config()).run(Vec::new()).await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn unreachable_node_fails_with_tcp_error() {
    let results = orchestrator(test_config())
        .run(vec![unreachable_node(0)])
        .await;

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.status, TestStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("TCP connect failed"));
    assert_eq!(result.tcp_latency, None);
    assert_eq!(result.http_latency, None);
    assert_eq!(result.download_speed, None);
    assert_eq!(result.server, "203.0.113.1");
}

#[tokio::test]
async fn results_are_truncated_and_ordered() {
    let mut config = test_config();
    config.test.max_nodes = 3;

    let nodes: Vec<Node> = (0..10).map(unreachable_node).collect();
    let results = orchestrator(config).run(nodes).await;

    assert_eq!(results.len(), 3);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.name, format!("node-{}", i));
    }
}

#[tokio::test]
async fn truncation_is_a_noop_when_limit_exceeds_input() {
    let mut config = test_config();
    config.test.max_nodes = 50;

    let nodes: Vec<Node> = (0..4).map(unreachable_node).collect();
    let results = orchestrator(config).run(nodes).await;

    assert_eq!(results.len(), 4);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.name, format!("node-{}", i));
    }
}

#[tokio::test]
async fn status_invariant_holds_for_every_result() {
    let nodes: Vec<Node> = (0..5).map(unreachable_node).collect();
    let results = orchestrator(test_config()).run(nodes).await;

    for result in &results {
        let has_measurement = result.http_latency.is_some() || result.download_speed.is_some();
        assert_eq!(result.status == TestStatus::Success, has_measurement);
        if result.status == TestStatus::Failed {
            assert!(result.error.is_some());
        }
    }
}
