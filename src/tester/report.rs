//! 测试结果记录与输出

use std::path::Path;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::subscription::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub server: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub node_type: String,
    pub tcp_latency: Option<f64>,
    pub http_latency: Option<f64>,
    pub download_speed: Option<f64>,
    pub status: TestStatus,
    pub error: Option<String>,
    pub test_time: String,
}

impl TestResult {
    pub fn from_node(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            server: node.server.clone(),
            port: node.port,
            node_type: node.node_type.clone(),
            tcp_latency: None,
            http_latency: None,
            download_speed: None,
            status: TestStatus::Failed,
            error: None,
            test_time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn failed(node: &Node, error: impl Into<String>) -> Self {
        let mut result = Self::from_node(node);
        result.error = Some(error.into());
        result
    }

    /// 结果不变式：有 HTTP 延迟或速度样本才算成功
    pub fn finalize(&mut self) {
        if self.http_latency.is_some() || self.download_speed.is_some() {
            self.status = TestStatus::Success;
            self.error = None;
        } else {
            self.status = TestStatus::Failed;
        }
    }

    /// 排序用延迟：优先 HTTP，退回 TCP，都没有按最差排
    pub fn sort_latency(&self) -> f64 {
        self.http_latency
            .or(self.tcp_latency)
            .unwrap_or(9999.0)
    }
}

/// 把结果数组写为 UTF-8 JSON 文件，按提交顺序
pub fn write_results(path: &str, results: &[TestResult]) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(results)?)?;
    Ok(())
}

/// 控制台汇总：成功率 + 按延迟排序的前 N 名
pub fn print_summary(results: &[TestResult], top: usize) {
    let success: Vec<&TestResult> = results
        .iter()
        .filter(|r| r.status == TestStatus::Success)
        .collect();

    println!("\n=== Test complete ===");
    println!("successful nodes: {}/{}", success.len(), results.len());

    if success.is_empty() {
        println!("no successful nodes");
        return;
    }

    let mut sorted = success;
    sorted.sort_by(|a, b| {
        a.sort_latency()
            .partial_cmp(&b.sort_latency())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    println!("\n=== Best nodes (top {}) ===", top);
    for (i, result) in sorted.iter().take(top).enumerate() {
        let name: String = result.name.chars().take(30).collect();
        let latency = result
            .sort_latency()
            .to_string();
        let speed = result
            .download_speed
            .map(|s| format!("{:.2}", s))
            .unwrap_or_else(|| "N/A".to_string());
        println!("{:2}. {:30} {:>8}ms {:>8}Mbps", i + 1, name, latency, speed);
    }
}
