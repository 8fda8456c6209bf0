//! 订阅获取与节点汇总
//!
//! 负责从 URL 列表拉取订阅文档（带磁盘缓存与 GitHub 镜像加速）、解析为
//! 节点并按 (server, port, type) 去重。单个订阅源失败不影响整批。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info, warn};

pub mod node;
pub mod parser;

pub use node::Node;

use crate::config::Config;

/// 镜像可用性探测用的 canary 地址，200 或 404 都说明镜像在转发
const MIRROR_CANARY: &str = "https://raw.githubusercontent.com/test/test/main/test.txt";

pub struct SubscriptionFetcher {
    client: reqwest::Client,
    cache_dir: PathBuf,
    cache_enabled: bool,
    cache_duration: Duration,
    mirrors_enabled: bool,
    mirrors: Vec<String>,
    concurrent_parse: usize,
    selected_mirror: OnceCell<String>,
}

impl SubscriptionFetcher {
    pub fn new(config: &Config, cache_dir: PathBuf) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("subprobe/0.1")
            .build()?;
        Ok(Self {
            client,
            cache_dir,
            cache_enabled: config.subscription.cache.enabled,
            cache_duration: Duration::from_secs(config.subscription.cache.duration),
            mirrors_enabled: config.github_proxy.enabled,
            mirrors: config.github_proxy.mirrors.clone(),
            concurrent_parse: config.subscription.concurrent_parse.max(1),
            selected_mirror: OnceCell::new(),
        })
    }

    /// 并发解析多个订阅源，按输入顺序汇总并去重
    pub async fn parse_many(&self, urls: &[String]) -> Vec<Node> {
        let semaphore = Semaphore::new(self.concurrent_parse);

        let tasks = urls.iter().map(|url| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.ok();
                match self.fetch_and_parse(url).await {
                    Ok(nodes) => {
                        info!(%url, count = nodes.len(), "subscription parsed");
                        nodes
                    }
                    Err(e) => {
                        warn!(%url, error = %e, "subscription failed, skipping");
                        Vec::new()
                    }
                }
            }
        });

        let all: Vec<Node> = join_all(tasks).await.into_iter().flatten().collect();
        let unique = dedup_nodes(all);
        info!(count = unique.len(), "unique nodes collected");
        unique
    }

    pub async fn fetch_and_parse(&self, url: &str) -> Result<Vec<Node>> {
        let content = self.fetch(url).await?;
        parser::parse_subscription(&content)
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let cache_path = self.cache_path(url);
        if self.cache_enabled && self.cache_valid(&cache_path) {
            if let Ok(content) = std::fs::read_to_string(&cache_path) {
                debug!(url, "using cached subscription");
                return Ok(content);
            }
        }

        let fetch_url = self.rewrite_url(url).await;
        let resp = self.client.get(&fetch_url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("HTTP {} fetching {}", resp.status(), fetch_url);
        }
        let content = resp.text().await?;

        if self.cache_enabled {
            if let Err(e) = std::fs::create_dir_all(&self.cache_dir)
                .and_then(|_| std::fs::write(&cache_path, &content))
            {
                debug!(error = %e, "failed to write subscription cache");
            }
        }

        debug!(url, bytes = content.len(), "subscription fetched");
        Ok(content)
    }

    /// GitHub 地址改写为镜像地址，其余原样返回
    async fn rewrite_url(&self, url: &str) -> String {
        if !self.mirrors_enabled || !is_github_url(url) {
            return url.to_string();
        }
        let prefix = self
            .selected_mirror
            .get_or_init(|| self.probe_mirrors())
            .await;
        if prefix.is_empty() || url.starts_with(prefix.as_str()) {
            url.to_string()
        } else {
            format!("{}{}", prefix, url)
        }
    }

    /// 依次探测镜像，第一个返回 200/404 的获胜；全部失败则直连
    async fn probe_mirrors(&self) -> String {
        for mirror in &self.mirrors {
            let probe = format!("{}{}", mirror, MIRROR_CANARY);
            let ok = match self
                .client
                .get(&probe)
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                Ok(resp) => {
                    resp.status() == reqwest::StatusCode::OK
                        || resp.status() == reqwest::StatusCode::NOT_FOUND
                }
                Err(_) => false,
            };
            if ok {
                info!(%mirror, "github mirror selected");
                return mirror.clone();
            }
        }
        warn!("no working github mirror, fetching directly");
        String::new()
    }

    fn cache_path(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        let short: String = digest
            .iter()
            .take(8)
            .map(|b| format!("{:02x}", b))
            .collect();
        self.cache_dir.join(format!("sub_{}.cache", short))
    }

    fn cache_valid(&self, path: &Path) -> bool {
        let Ok(meta) = path.metadata() else {
            return false;
        };
        let Ok(mtime) = meta.modified() else {
            return false;
        };
        SystemTime::now()
            .duration_since(mtime)
            .map(|age| age < self.cache_duration)
            .unwrap_or(false)
    }
}

fn is_github_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    lower.contains("github.com") || lower.contains("raw.githubusercontent.com")
}

/// 按 (server, port, type) 去重，保留首个出现的节点
pub fn dedup_nodes(nodes: Vec<Node>) -> Vec<Node> {
    let mut seen = HashSet::new();
    nodes
        .into_iter()
        .filter(|n| seen.insert(n.dedup_key()))
        .collect()
}

/// 把节点列表写为 UTF-8 JSON 文件
pub fn write_nodes(path: &str, nodes: &[Node]) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(nodes)?)?;
    Ok(())
}

/// 读取订阅 URL 列表文件，一行一个，`#` 开头为注释
pub fn read_urls_file(path: &str) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(server: &str, port: u16, node_type: &str) -> Node {
        Node::empty(
            format!("{}-{}", server, port),
            node_type.to_string(),
            server.to_string(),
            port,
        )
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let mut a = node("s.com", 443, "vless");
        a.name = "keep".to_string();
        let mut b = node("s.com", 443, "vless");
        b.name = "drop".to_string();
        let c = node("s.com", 443, "trojan");

        let unique = dedup_nodes(vec![a, b, c]);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].name, "keep");
    }

    #[test]
    fn read_urls_file_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs.txt");
        std::fs::write(&path, "# header\nhttps://a.com/sub\n\n  https://b.com/sub  \n").unwrap();
        let urls = read_urls_file(path.to_str().unwrap()).unwrap();
        assert_eq!(urls, vec!["https://a.com/sub", "https://b.com/sub"]);
    }

    #[test]
    fn github_url_detection() {
        assert!(is_github_url("https://raw.githubusercontent.com/a/b/main/sub"));
        assert!(is_github_url("https://GitHub.com/a/b"));
        assert!(!is_github_url("https://example.com/sub"));
    }

    #[test]
    fn cache_path_is_stable_per_url() {
        let config = crate::config::Config::default();
        let fetcher =
            SubscriptionFetcher::new(&config, PathBuf::from("/tmp/cache")).unwrap();
        let a = fetcher.cache_path("https://a.com/sub");
        assert_eq!(a, fetcher.cache_path("https://a.com/sub"));
        assert_ne!(a, fetcher.cache_path("https://b.com/sub"));
    }

    #[tokio::test]
    async fn fetch_serves_fresh_cache_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::Config::default();
        let fetcher =
            SubscriptionFetcher::new(&config, dir.path().to_path_buf()).unwrap();

        let url = "https://unreachable.invalid/sub";
        std::fs::write(fetcher.cache_path(url), "vless://u@a.com:443#Cached").unwrap();

        let nodes = fetcher.fetch_and_parse(url).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "Cached");
    }

    #[tokio::test]
    async fn fetch_ignores_stale_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::Config::default();
        config.subscription.cache.duration = 0;
        let fetcher =
            SubscriptionFetcher::new(&config, dir.path().to_path_buf()).unwrap();

        let url = "https://unreachable.invalid/sub";
        std::fs::write(fetcher.cache_path(url), "vless://u@a.com:443#Cached").unwrap();

        // zero-duration cache is always stale, so the fetch must hit the
        // network and fail on the unreachable host
        assert!(fetcher.fetch_and_parse(url).await.is_err());
    }
}
