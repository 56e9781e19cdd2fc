use crate::config::ProbeSettings;
use crate::error::{CheckError, Result};
use crate::traits::Prober;
use crate::tunnel::Tunnel;
use crate::types::{ProbeResult, ProxyNode};
use async_trait::async_trait;
use reqwest::{Client, Proxy};
use std::time::{Duration, Instant};
use tracing::debug;

/// 一次下载测速的结果
#[derive(Debug, Clone, Copy)]
pub struct Transfer {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl Transfer {
    /// 字节/秒
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }
}

/// 通过本地隧道端口访问的 Client
///
/// socks5h: 域名交给隧道远端解析; 上游由运营者信任, 不校验证书
pub fn tunnel_client(port: u16) -> Result<Client> {
    Ok(Client::builder()
        .proxy(Proxy::all(format!("socks5h://127.0.0.1:{}", port))?)
        .danger_accept_invalid_certs(true)
        .build()?)
}

fn classify(e: reqwest::Error, stage: &'static str) -> CheckError {
    if e.is_timeout() {
        CheckError::ProbeTimeout(stage)
    } else {
        CheckError::Http(e)
    }
}

/// 连通性检查, 返回延迟 (毫秒)
///
/// 收到任何非 5xx 响应即视为连通
pub async fn check_latency(client: &Client, url: &str, timeout: Duration) -> Result<u64> {
    let start = Instant::now();

    let resp = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify(e, "latency check"))?;

    let latency_ms = start.elapsed().as_millis() as u64;

    if resp.status().is_server_error() {
        return Err(CheckError::Custom(format!(
            "health check returned {}",
            resp.status()
        )));
    }

    Ok(latency_ms)
}

/// 下载测速: 读满 `cap` 字节后提前结束, 整个过程受 `window` 限制
pub async fn measure_throughput(
    client: &Client,
    url: &str,
    cap: u64,
    window: Duration,
) -> Result<Transfer> {
    let start = Instant::now();

    let transfer = async {
        let mut resp = client.get(url).send().await?.error_for_status()?;
        let mut received: u64 = 0;
        while let Some(chunk) = resp.chunk().await? {
            received += chunk.len() as u64;
            if received >= cap {
                break;
            }
        }
        Ok::<u64, reqwest::Error>(received)
    };

    let bytes = tokio::time::timeout(window, transfer)
        .await
        .map_err(|_| CheckError::ProbeTimeout("throughput measurement"))?
        .map_err(|e| classify(e, "throughput measurement"))?;

    Ok(Transfer {
        bytes,
        elapsed: start.elapsed(),
    })
}

/// ProbeRunner: 启动独立隧道, 测延迟与速度, 无论结果如何都清理隧道
pub struct ProbeRunner {
    settings: ProbeSettings,
}

impl ProbeRunner {
    pub fn new(settings: ProbeSettings) -> Self {
        Self { settings }
    }

    /// 返回 (延迟毫秒, 速度字节/秒)
    async fn run(&self, node: &ProxyNode, port: u16) -> Result<(u64, f64)> {
        let tunnel = Tunnel::launch(&self.settings, node, port).await?;

        let budget = self
            .settings
            .deadline()
            .saturating_sub(self.settings.startup_grace());
        let measured = tokio::time::timeout(budget, self.measure(port)).await;

        tunnel.shutdown().await;

        measured.map_err(|_| CheckError::ProbeTimeout("probe deadline"))?
    }

    async fn measure(&self, port: u16) -> Result<(u64, f64)> {
        let client = tunnel_client(port)?;

        let latency_ms = check_latency(
            &client,
            &self.settings.health_url,
            self.settings.latency_timeout(),
        )
        .await?;

        // 只有连通的节点才测速
        let throughput = if self.settings.throughput {
            measure_throughput(
                &client,
                &self.settings.throughput_url,
                self.settings.throughput_cap_bytes,
                self.settings.throughput_timeout(),
            )
            .await?
            .rate()
        } else {
            0.0
        };

        Ok((latency_ms, throughput))
    }
}

#[async_trait]
impl Prober for ProbeRunner {
    async fn probe(&self, node: &ProxyNode, port: u16, round: u32) -> ProbeResult {
        match self.run(node, port).await {
            Ok((latency_ms, throughput)) => {
                ProbeResult::passed(&node.name, round, latency_ms, throughput)
            }
            Err(e) => {
                debug!(
                    "Probe failed: node='{}' port={} round={}: {}",
                    node.name, port, round, e
                );
                ProbeResult::failed(&node.name, round)
            }
        }
    }
}
