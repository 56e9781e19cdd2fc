use crate::traits::Prober;
use crate::types::{ProbeResult, ProxyNode};
use indicatif::ProgressBar;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::error;

/// 固定数量的并发 worker, 每个 worker 在一轮中独占端口 `base_port + index`
pub struct WorkerPool {
    prober: Arc<dyn Prober>,
    concurrency: usize,
    base_port: u16,
    progress: ProgressBar,
}

impl WorkerPool {
    /// worker 数量会被限制在 `base_port..=65535` 之内
    pub fn new(prober: Arc<dyn Prober>, concurrency: usize, base_port: u16) -> Self {
        let available = usize::from(u16::MAX - base_port) + 1;
        Self {
            prober,
            concurrency: concurrency.clamp(1, available),
            base_port,
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &ProgressBar {
        &self.progress
    }

    /// `worker` 超出端口范围时返回 None
    pub fn port_for(&self, worker: usize) -> Option<u16> {
        u16::try_from(worker)
            .ok()
            .and_then(|offset| self.base_port.checked_add(offset))
    }

    /// 执行一轮: 每个节点恰好被一个 worker 探测一次
    ///
    /// 所有 worker 结束后才返回; 结果顺序不定, 以节点名对应
    pub async fn run_round(&self, nodes: Arc<[ProxyNode]>, round: u32) -> Vec<ProbeResult> {
        if nodes.is_empty() {
            return Vec::new();
        }

        self.progress.set_length(nodes.len() as u64);
        self.progress.set_position(0);

        let cursor = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();

        for worker in 0..self.concurrency.min(nodes.len()) {
            let Some(port) = self.port_for(worker) else {
                break;
            };
            let nodes = nodes.clone();
            let cursor = cursor.clone();
            let prober = self.prober.clone();
            let progress = self.progress.clone();
            let tx = tx.clone();

            workers.spawn(async move {
                loop {
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(node) = nodes.get(index) else {
                        break;
                    };
                    let result = prober.probe(node, port, round).await;
                    progress.inc(1);
                    if tx.send(result).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(nodes.len());
        while let Some(result) = rx.recv().await {
            results.push(result);
        }

        // join point
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker crashed in round {}: {}", round, e);
            }
        }

        results
    }
}
