//! 节点测试流水线与并发调度
//!
//! 每个节点按 TCP → 租约 → HTTP 延迟 → 速度 的顺序测试，全程限时；
//! 调度器用信号量限制并发的测试数，并按提交顺序聚合结果。

pub mod probes;
pub mod report;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::{Lease, ProxyPool};
use crate::subscription::Node;

pub use report::{TestResult, TestStatus};

/// 单节点测试器
pub struct NodeTester {
    pool: Arc<ProxyPool>,
    config: Arc<Config>,
}

impl NodeTester {
    pub fn new(pool: Arc<ProxyPool>, config: Arc<Config>) -> Self {
        Self { pool, config }
    }

    /// 测试单个节点，任何失败都折叠进结果记录，不向外抛
    pub async fn test_node(&self, node: &Node) -> TestResult {
        let mut result = TestResult::from_node(node);

        result.tcp_latency =
            probes::tcp_latency(&node.server, node.port, self.config.connect_timeout()).await;
        if result.tcp_latency.is_none() {
            result.error = Some("TCP connect failed".to_string());
            return result;
        }

        let lease = match self.pool.acquire(node).await {
            Ok(lease) => lease,
            Err(e) => {
                result.error = Some(format!("proxy acquire failed: {}", e.kind()));
                return result;
            }
        };

        // 租约必须归还：代理探测的结果先落到 result 里，随后无条件 release
        self.run_proxied_probes(&lease, &mut result).await;
        self.pool.release(lease).await;

        result.finalize();
        if result.status == TestStatus::Failed && result.error.is_none() {
            result.error = Some("HTTP probes failed".to_string());
        }
        result
    }

    async fn run_proxied_probes(&self, lease: &Lease, result: &mut TestResult) {
        let client = match probes::proxied_client(&lease.socks5_url()) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "failed to build proxied client");
                return;
            }
        };

        result.http_latency = probes::http_latency(
            &client,
            &probes::LATENCY_ENDPOINTS,
            self.config.latency_timeout(),
        )
        .await;

        // 连 204 都打不通就不必测速了
        if result.http_latency.is_some() {
            result.download_speed = probes::download_speed(
                &client,
                &probes::SPEED_ENDPOINTS,
                &self.config.test.speed,
                self.config.speed_timeout(),
            )
            .await;
        }
    }
}

/// 并发测试调度器
pub struct TestOrchestrator {
    config: Arc<Config>,
    pool: Arc<ProxyPool>,
}

impl TestOrchestrator {
    pub fn new(config: Config) -> Self {
        let work_dir =
            std::env::temp_dir().join(format!("subprobe-{}", std::process::id()));
        Self::with_work_dir(config, work_dir)
    }

    pub fn with_work_dir(config: Config, work_dir: PathBuf) -> Self {
        let pool = Arc::new(ProxyPool::new(&config, work_dir));
        Self {
            config: Arc::new(config),
            pool,
        }
    }

    /// 测试一批节点，结果与（截断后的）输入同序
    pub async fn run(&self, mut nodes: Vec<Node>) -> Vec<TestResult> {
        if nodes.is_empty() {
            return Vec::new();
        }

        let max_nodes = self.config.test.max_nodes;
        if nodes.len() > max_nodes {
            info!(max_nodes, "too many nodes, truncating");
            nodes.truncate(max_nodes);
        }

        let concurrency = self.config.optimal_concurrency();
        self.pool.initialize().await;
        info!(nodes = nodes.len(), concurrency, "starting node tests");

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut handles = Vec::with_capacity(nodes.len());
        for node in nodes.iter().cloned() {
            let semaphore = semaphore.clone();
            let tester = NodeTester::new(self.pool.clone(), self.config.clone());
            handles.push(tokio::spawn(async move {
                // the semaphore is never closed while tasks are in flight
                let _permit = semaphore.acquire_owned().await.ok();
                tester.test_node(&node).await
            }));
        }

        let mut results = Vec::with_capacity(nodes.len());
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(node = %nodes[i].name, error = %e, "test task died");
                    results.push(TestResult::failed(
                        &nodes[i],
                        format!("test task failed: {}", e),
                    ));
                }
            }
        }

        self.pool.shutdown().await;

        let success = results
            .iter()
            .filter(|r| r.status == TestStatus::Success)
            .count();
        info!(success, total = results.len(), "node tests finished");
        results
    }
}
