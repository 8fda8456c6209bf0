//! 配置文档的类型化视图
//!
//! 所有字段都有默认值，校验从不报错：非法值回退到默认并记录警告。

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub network: NetworkConfig,
    pub test: TestConfig,
    pub proxy: ProxyConfig,
    pub github_proxy: GithubProxyConfig,
    pub subscription: SubscriptionConfig,
}

impl Config {
    /// 校验并修正配置，返回被修正的条目数
    pub fn sanitize(&mut self) -> usize {
        let mut fixed = 0;

        if self.network.user_bandwidth == 0 {
            warn!("user_bandwidth must be positive, falling back to 100 Mbps");
            self.network.user_bandwidth = default_bandwidth();
            fixed += 1;
        }

        let range = &self.proxy.port_range;
        if range.start >= range.end || range.start < 1024 {
            warn!(
                start = range.start,
                end = range.end,
                "invalid proxy port range, falling back to default"
            );
            self.proxy.port_range = PortRange::default();
            fixed += 1;
        }

        if self.proxy.startup.parallel_limit == 0 {
            warn!("parallel_limit must be at least 1");
            self.proxy.startup.parallel_limit = 1;
            fixed += 1;
        }

        fixed
    }

    /// 基于带宽计算最优并发数
    ///
    /// 假设每个并发测速连接平均占用 5 Mbps，链路利用率 80%。
    pub fn optimal_concurrency(&self) -> usize {
        if !self.network.auto_concurrent {
            return self.network.manual_concurrent.max(1);
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(0);
        optimal_concurrency_for(self.network.user_bandwidth, cpus)
    }

    pub fn port_pool(&self) -> RangeInclusive<u16> {
        self.proxy.port_range.start..=self.proxy.port_range.end
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.test.timeout.connect)
    }

    pub fn latency_timeout(&self) -> Duration {
        Duration::from_secs(self.test.timeout.latency)
    }

    pub fn speed_timeout(&self) -> Duration {
        Duration::from_secs(self.test.timeout.speed)
    }

    pub fn warmup_time(&self) -> Duration {
        Duration::from_secs_f64(self.proxy.startup.warmup_time)
    }
}

pub(crate) fn optimal_concurrency_for(bandwidth_mbps: u64, cpus: usize) -> usize {
    let by_bandwidth = ((bandwidth_mbps as f64 * 0.8) / 5.0) as usize;
    let upper = if cpus > 0 { (cpus * 4).min(50) } else { 20 };
    by_bandwidth.clamp(1, upper)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// 用户出口带宽（Mbps）
    pub user_bandwidth: u64,
    pub auto_concurrent: bool,
    pub manual_concurrent: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_bandwidth: default_bandwidth(),
            auto_concurrent: true,
            manual_concurrent: 3,
        }
    }
}

fn default_bandwidth() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    pub max_nodes: usize,
    pub timeout: TimeoutConfig,
    pub speed: SpeedConfig,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            max_nodes: 50,
            timeout: TimeoutConfig::default(),
            speed: SpeedConfig::default(),
        }
    }
}

/// 各阶段超时（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect: u64,
    pub latency: u64,
    pub speed: u64,
    pub proxy_start: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: 8,
            latency: 5,
            speed: 15,
            proxy_start: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeedConfig {
    /// 单个端点最长测试时间（秒）
    pub test_duration: u64,
    /// 样本计入统计所需的最小字节数
    pub min_size: u64,
    pub endpoints_limit: usize,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            test_duration: 8,
            min_size: 1024 * 1024,
            endpoints_limit: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub port_range: PortRange,
    pub startup: StartupConfig,
    /// 外部引擎可执行文件，按 `<engine> -config <file>` 方式调用
    pub engine: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            startup: StartupConfig::default(),
            engine: "xray".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 10800,
            end: 10900,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// 预启动的空闲 worker 数量
    pub parallel_limit: usize,
    /// 进程启动后的预热时间（秒）
    pub warmup_time: f64,
    pub health_check: bool,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            parallel_limit: 10,
            warmup_time: 1.0,
            health_check: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GithubProxyConfig {
    pub enabled: bool,
    pub mirrors: Vec<String>,
}

impl Default for GithubProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mirrors: vec![
                "https://ghfast.top/".to_string(),
                "https://gh-proxy.com/".to_string(),
                "https://ghproxy.net/".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub cache: CacheConfig,
    pub concurrent_parse: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            concurrent_parse: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// 缓存有效期（秒）
    pub duration: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duration: 1800,
        }
    }
}
