//! 引擎进程池
//!
//! 预启动一批空闲引擎 worker 来摊销进程启动成本。测试某个节点时优先
//! 复用空闲 worker（改写配置文件 + 重载），队列等待超时才退回到临时
//! 进程。worker 状态机：
//!
//! ```text
//! [spawned] --warmup ok--> [idle] --acquire--> [active] --release--> [idle]
//!                                                \-- temp lease ---> [destroyed]
//! [any]     --engine dies--> [dead] --> [destroyed]
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::Error;
use crate::config::Config;
use crate::engine::config::{build_engine_config, build_idle_config};
use crate::subscription::node::SUPPORTED_TYPES;
use crate::subscription::Node;

const ACQUIRE_WAIT: Duration = Duration::from_secs(5);
const RELOAD_SETTLE: Duration = Duration::from_millis(500);
const GRACEFUL_STOP: Duration = Duration::from_secs(3);
const HEALTH_CHECK_URL: &str = "http://www.gstatic.com/generate_204";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Active,
    Temporary,
    Dead,
}

struct Worker {
    port: u16,
    process: Child,
    config_path: PathBuf,
    state: WorkerState,
    bound: Option<String>,
}

/// 对某个端口上已配置好节点的 worker 的独占租约
#[derive(Debug)]
pub struct Lease {
    port: u16,
    temporary: bool,
}

impl Lease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socks5_url(&self) -> String {
        format!("socks5://127.0.0.1:{}", self.port)
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<u16, Worker>,
    /// 正在重配或临时启动中的端口，避免并发占用
    reserved: HashSet<u16>,
}

pub struct ProxyPool {
    engine: String,
    ports: Vec<u16>,
    pool_size: usize,
    warmup: Duration,
    health_check: bool,
    health_budget: Duration,
    work_dir: PathBuf,
    state: Mutex<PoolState>,
    idle_tx: mpsc::UnboundedSender<u16>,
    idle_rx: Mutex<mpsc::UnboundedReceiver<u16>>,
    cancel: CancellationToken,
}

impl ProxyPool {
    pub fn new(config: &Config, work_dir: PathBuf) -> Self {
        let ports: Vec<u16> = config.port_pool().collect();
        let pool_size = config.proxy.startup.parallel_limit.min(ports.len());
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        Self {
            engine: config.proxy.engine.clone(),
            ports,
            pool_size,
            warmup: config.warmup_time(),
            health_check: config.proxy.startup.health_check,
            health_budget: Duration::from_secs(config.test.timeout.proxy_start),
            work_dir,
            state: Mutex::new(PoolState::default()),
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// 预启动空闲 worker，返回存活数量
    pub async fn initialize(&self) -> usize {
        info!(count = self.pool_size, "initializing proxy pool");
        std::fs::create_dir_all(&self.work_dir).ok();

        let ports: Vec<u16> = self.ports.iter().take(self.pool_size).copied().collect();
        let results = join_all(ports.iter().map(|&p| self.start_idle_worker(p))).await;
        let live = results.iter().filter(|ok| **ok).count();

        if live == 0 {
            warn!("no idle workers survived warmup, relying on temporary workers");
        } else {
            info!(live, total = ports.len(), "proxy pool initialized");
        }
        live
    }

    async fn start_idle_worker(&self, port: u16) -> bool {
        let config_path = self.work_dir.join(format!("idle_{}.json", port));
        let payload = build_idle_config(port);
        if let Err(e) = write_engine_config(&config_path, &payload) {
            warn!(port, error = %e, "failed to write idle config");
            return false;
        }

        let mut process = match self.spawn_engine(&config_path) {
            Ok(p) => p,
            Err(e) => {
                warn!(port, error = %e, "failed to spawn engine");
                let _ = std::fs::remove_file(&config_path);
                return false;
            }
        };

        tokio::time::sleep(self.warmup).await;

        if let Ok(Some(status)) = process.try_wait() {
            warn!(port, %status, "engine exited during warmup");
            let _ = std::fs::remove_file(&config_path);
            return false;
        }

        let worker = Worker {
            port,
            process,
            config_path,
            state: WorkerState::Idle,
            bound: None,
        };
        self.state.lock().await.workers.insert(port, worker);
        let _ = self.idle_tx.send(port);
        debug!(port, "idle worker ready");
        true
    }

    fn spawn_engine(&self, config_path: &Path) -> std::io::Result<Child> {
        Command::new(&self.engine)
            .arg("-config")
            .arg(config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }

    /// 为节点取得一个已配置好的 SOCKS5 端点
    ///
    /// 最多等待 5 秒取空闲 worker 并重配；等待超时则退回到临时 worker；
    /// 没有空闲端口时返回 `PoolExhausted`。
    pub async fn acquire(&self, node: &Node) -> Result<Lease, Error> {
        if !SUPPORTED_TYPES.contains(&node.node_type.as_str()) {
            return Err(Error::UnsupportedProtocol(node.node_type.clone()));
        }

        match self.acquire_idle(node).await {
            Err(Error::PoolTimeout) => {
                warn!(node = %node.name, "idle queue timed out, creating temporary worker");
                self.create_temporary(node).await
            }
            other => other,
        }
    }

    async fn acquire_idle(&self, node: &Node) -> Result<Lease, Error> {
        let recv = async {
            let mut rx = self.idle_rx.lock().await;
            rx.recv().await
        };
        let port = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(Error::Timeout("pool is shutting down".to_string()));
            }
            port = timeout(ACQUIRE_WAIT, recv) => match port {
                Ok(Some(port)) => port,
                Ok(None) => return Err(Error::Timeout("pool is shutting down".to_string())),
                Err(_) => return Err(Error::PoolTimeout),
            },
        };
        self.reconfigure(port, node).await
    }

    /// 把空闲 worker 改写为节点配置并重载引擎
    ///
    /// 失败时 worker 被销毁而不是放回队列，端口回到空闲端口集合。
    async fn reconfigure(&self, port: u16, node: &Node) -> Result<Lease, Error> {
        let mut worker = {
            let mut state = self.state.lock().await;
            let Some(worker) = state.workers.remove(&port) else {
                return Err(Error::EngineReconfigFailed(format!(
                    "worker on port {} disappeared",
                    port
                )));
            };
            state.reserved.insert(port);
            worker
        };

        match self.reconfigure_inner(&mut worker, node).await {
            Ok(()) => {
                worker.state = WorkerState::Active;
                worker.bound = Some(node.name.clone());
                let mut state = self.state.lock().await;
                state.reserved.remove(&port);
                state.workers.insert(port, worker);
                debug!(port, node = %node.name, "worker reconfigured");
                Ok(Lease {
                    port,
                    temporary: false,
                })
            }
            Err(e) => {
                warn!(port, node = %node.name, error = %e, "reconfigure failed, destroying worker");
                worker.state = WorkerState::Dead;
                stop_worker(worker).await;
                self.state.lock().await.reserved.remove(&port);
                Err(e)
            }
        }
    }

    async fn reconfigure_inner(&self, worker: &mut Worker, node: &Node) -> Result<(), Error> {
        let payload = build_engine_config(node, worker.port)?;
        write_engine_config(&worker.config_path, &payload)
            .map_err(|e| Error::EngineReconfigFailed(e.to_string()))?;

        self.reload_engine(worker).await?;
        tokio::time::sleep(RELOAD_SETTLE).await;

        if let Ok(Some(status)) = worker.process.try_wait() {
            return Err(Error::EngineReconfigFailed(format!(
                "engine exited on reload: {}",
                status
            )));
        }

        if self.health_check && !self.health_check_socks(worker.port).await {
            return Err(Error::EngineReconfigFailed(
                "health check through SOCKS5 failed".to_string(),
            ));
        }
        Ok(())
    }

    /// 让引擎重读配置文件：unix 上发 SIGHUP，其它平台原端口重启
    async fn reload_engine(&self, worker: &mut Worker) -> Result<(), Error> {
        #[cfg(unix)]
        {
            let Some(pid) = worker.process.id() else {
                return Err(Error::EngineReconfigFailed(
                    "engine process already exited".to_string(),
                ));
            };
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGHUP) };
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = worker.process.start_kill();
            let _ = worker.process.wait().await;
            worker.process = self
                .spawn_engine(&worker.config_path)
                .map_err(|e| Error::EngineReconfigFailed(e.to_string()))?;
            tokio::time::sleep(self.warmup).await;
            Ok(())
        }
    }

    async fn health_check_socks(&self, port: u16) -> bool {
        let client = match reqwest::Proxy::all(format!("socks5://127.0.0.1:{}", port))
            .and_then(|proxy| {
                reqwest::Client::builder()
                    .proxy(proxy)
                    .timeout(self.health_budget)
                    .build()
            }) {
            Ok(client) => client,
            Err(_) => return false,
        };
        match client.get(HEALTH_CHECK_URL).send().await {
            Ok(resp) => {
                let code = resp.status().as_u16();
                code == 200 || code == 204
            }
            Err(_) => false,
        }
    }

    /// 在任意空闲端口上为节点启动一个一次性引擎进程
    async fn create_temporary(&self, node: &Node) -> Result<Lease, Error> {
        let mut last_err: Option<Error> = None;
        let mut tried = HashSet::new();

        loop {
            let port = {
                let mut state = self.state.lock().await;
                let free = self.ports.iter().copied().find(|p| {
                    !tried.contains(p)
                        && !state.workers.contains_key(p)
                        && !state.reserved.contains(p)
                });
                match free {
                    Some(port) => {
                        state.reserved.insert(port);
                        tried.insert(port);
                        port
                    }
                    None => return Err(last_err.unwrap_or(Error::PoolExhausted)),
                }
            };

            match self.start_temporary_worker(port, node).await {
                Ok(lease) => return Ok(lease),
                Err(e) => {
                    warn!(port, error = %e, "temporary worker failed");
                    self.state.lock().await.reserved.remove(&port);
                    last_err = Some(e);
                }
            }
        }
    }

    async fn start_temporary_worker(&self, port: u16, node: &Node) -> Result<Lease, Error> {
        let payload = build_engine_config(node, port)?;
        let config_path = self.work_dir.join(format!("temp_{}.json", port));
        write_engine_config(&config_path, &payload)?;

        let mut process = self.spawn_engine(&config_path).map_err(|e| {
            let _ = std::fs::remove_file(&config_path);
            Error::EngineSpawnFailed(e.to_string())
        })?;

        tokio::time::sleep(self.warmup).await;

        if let Ok(Some(status)) = process.try_wait() {
            let _ = std::fs::remove_file(&config_path);
            return Err(Error::EngineSpawnFailed(format!(
                "engine exited during warmup: {}",
                status
            )));
        }

        let worker = Worker {
            port,
            process,
            config_path,
            state: WorkerState::Temporary,
            bound: Some(node.name.clone()),
        };
        let mut state = self.state.lock().await;
        state.reserved.remove(&port);
        state.workers.insert(port, worker);
        debug!(port, node = %node.name, "temporary worker started");
        Ok(Lease {
            port,
            temporary: true,
        })
    }

    /// 归还租约：临时 worker 销毁，空闲来源的 worker 回到队列
    ///
    /// 从不失败；异常只记录日志。
    pub async fn release(&self, lease: Lease) {
        let Some(mut worker) = self.state.lock().await.workers.remove(&lease.port) else {
            debug!(port = lease.port, "released worker already gone");
            return;
        };

        if lease.temporary {
            stop_worker(worker).await;
            debug!(port = lease.port, "temporary worker destroyed");
            return;
        }

        // 死掉的 worker 不回收，端口回到空闲端口集合
        if let Ok(Some(status)) = worker.process.try_wait() {
            warn!(port = lease.port, node = ?worker.bound, %status, "worker died while leased, destroying");
            worker.state = WorkerState::Dead;
            stop_worker(worker).await;
            return;
        }

        worker.state = WorkerState::Idle;
        worker.bound = None;
        let port = worker.port;
        self.state.lock().await.workers.insert(port, worker);
        let _ = self.idle_tx.send(port);
    }

    /// 停掉所有 worker 并清理配置文件
    pub async fn shutdown(&self) {
        info!("shutting down proxy pool");
        self.cancel.cancel();

        // 清空队列，防止停机后的端口再被租出
        {
            let mut rx = self.idle_rx.lock().await;
            while rx.try_recv().is_ok() {}
        }

        let workers: Vec<Worker> = {
            let mut state = self.state.lock().await;
            state.reserved.clear();
            state.workers.drain().map(|(_, w)| w).collect()
        };
        join_all(workers.into_iter().map(stop_worker)).await;

        if let Ok(entries) = std::fs::read_dir(&self.work_dir) {
            for entry in entries.flatten() {
                if entry.path().extension().is_some_and(|ext| ext == "json") {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        let _ = std::fs::remove_dir(&self.work_dir);
    }

    pub async fn live_worker_count(&self) -> usize {
        self.state.lock().await.workers.len()
    }

    pub async fn idle_worker_count(&self) -> usize {
        self.state
            .lock()
            .await
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Idle)
            .count()
    }

    pub async fn idle_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .state
            .lock()
            .await
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Idle)
            .map(|w| w.port)
            .collect();
        ports.sort_unstable();
        ports
    }
}

fn write_engine_config(path: &Path, payload: &serde_json::Value) -> std::io::Result<()> {
    std::fs::write(path, serde_json::to_vec(payload)?)
}

/// 优雅停止：先 TERM，超时后 KILL，最后删除配置文件
async fn stop_worker(mut worker: Worker) {
    #[cfg(unix)]
    {
        if let Some(pid) = worker.process.id() {
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if timeout(GRACEFUL_STOP, worker.process.wait()).await.is_err() {
                warn!(port = worker.port, "graceful stop timed out, killing");
                let _ = worker.process.kill().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = worker.process.kill().await;
    }

    if let Err(e) = std::fs::remove_file(&worker.config_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(port = worker.port, error = %e, "failed to remove engine config");
        }
    }
}
