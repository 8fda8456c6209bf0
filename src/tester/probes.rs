//! 单项探测
//!
//! 三种探测都把网络错误吸收为 `None`，超过总预算即中止并返回 `None`。

use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::types::SpeedConfig;

pub const LATENCY_ENDPOINTS: [&str; 3] = [
    "http://www.gstatic.com/generate_204",
    "http://cp.cloudflare.com/generate_204",
    "http://detectportal.firefox.com/success.txt",
];

pub const SPEED_ENDPOINTS: [&str; 3] = [
    "http://cachefly.cachefly.net/10mb.test",
    "http://speedtest.tele2.net/10MB.zip",
    "https://speed.cloudflare.com/__down?bytes=10485760",
];

/// 所有代理探测共用的客户端，出口固定走租约的 SOCKS5 端点
pub fn proxied_client(socks5_url: &str) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(socks5_url)?)
        .build()?;
    Ok(client)
}

/// TCP 连接延迟（毫秒，保留两位小数）
pub async fn tcp_latency(server: &str, port: u16, connect_timeout: Duration) -> Option<f64> {
    let start = Instant::now();
    match timeout(connect_timeout, TcpStream::connect((server, port))).await {
        Ok(Ok(_stream)) => Some(round2(start.elapsed().as_secs_f64() * 1000.0)),
        Ok(Err(e)) => {
            debug!(server, port, error = %e, "tcp probe failed");
            None
        }
        Err(_) => {
            debug!(server, port, "tcp probe timed out");
            None
        }
    }
}

/// HTTP 延迟：对前两个 204 端点各发一次 GET（含读完响应体），
/// 取成功样本的算术平均
pub async fn http_latency(
    client: &reqwest::Client,
    endpoints: &[&str],
    budget: Duration,
) -> Option<f64> {
    let mut latencies = Vec::new();

    for endpoint in endpoints.iter().take(2) {
        let start = Instant::now();
        let attempt = async {
            let resp = client.get(*endpoint).send().await?;
            let status = resp.status().as_u16();
            resp.bytes().await?;
            Ok::<u16, reqwest::Error>(status)
        };
        match timeout(budget, attempt).await {
            Ok(Ok(status)) if status == 200 || status == 204 => {
                latencies.push(start.elapsed().as_secs_f64() * 1000.0);
            }
            Ok(Ok(status)) => debug!(endpoint, status, "latency probe rejected"),
            Ok(Err(e)) => debug!(endpoint, error = %e, "latency probe failed"),
            Err(_) => debug!(endpoint, "latency probe timed out"),
        }
    }

    mean(&latencies).map(round2)
}

/// 下载速度（Mbps）：逐端点尝试，第一个合格样本即停；
/// 读流直到时间或字节数达到上限，不足 min_size 的样本不计
pub async fn download_speed(
    client: &reqwest::Client,
    endpoints: &[&str],
    speed: &SpeedConfig,
    budget: Duration,
) -> Option<f64> {
    let mut speeds = Vec::new();

    for endpoint in endpoints.iter().take(speed.endpoints_limit) {
        match timeout(budget, download_once(client, endpoint, speed)).await {
            Ok(Some(mbps)) => {
                speeds.push(mbps);
                break;
            }
            Ok(None) => continue,
            Err(_) => {
                debug!(endpoint, "speed probe timed out");
                continue;
            }
        }
    }

    speeds
        .into_iter()
        .fold(None::<f64>, |best, v| Some(best.map_or(v, |b| b.max(v))))
        .map(round2)
}

async fn download_once(
    client: &reqwest::Client,
    endpoint: &str,
    speed: &SpeedConfig,
) -> Option<f64> {
    let start = Instant::now();
    let test_duration = Duration::from_secs(speed.test_duration);

    let resp = match client.get(endpoint).send().await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(endpoint, error = %e, "speed probe request failed");
            return None;
        }
    };
    if resp.status().as_u16() != 200 {
        debug!(endpoint, status = resp.status().as_u16(), "speed probe rejected");
        return None;
    }

    let mut downloaded: u64 = 0;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => downloaded += bytes.len() as u64,
            Err(e) => {
                debug!(endpoint, error = %e, "speed probe stream error");
                break;
            }
        }
        if start.elapsed() >= test_duration || downloaded >= speed.min_size {
            break;
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    if elapsed > 0.0 && downloaded >= speed.min_size {
        Some((downloaded as f64 * 8.0) / elapsed / (1024.0 * 1024.0))
    } else {
        debug!(endpoint, downloaded, "speed sample below minimum size");
        None
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round2_truncates_to_two_decimals() {
        assert_eq!(round2(12.3456), 12.35);
        assert_eq!(round2(0.004), 0.0);
    }

    #[test]
    fn mean_of_empty_is_none() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[10.0, 20.0]), Some(15.0));
    }

    #[tokio::test]
    async fn tcp_latency_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let latency = tcp_latency("127.0.0.1", addr.port(), Duration::from_secs(2)).await;
        let latency = latency.expect("local connect should succeed");
        assert!(latency >= 0.0 && latency < 2000.0);
    }

    #[tokio::test]
    async fn tcp_latency_refused_port_is_none() {
        // bind-then-drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert_eq!(
            tcp_latency("127.0.0.1", port, Duration::from_secs(2)).await,
            None
        );
    }
}
