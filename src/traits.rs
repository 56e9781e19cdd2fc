use crate::types::{ProbeResult, ProxyNode};
use async_trait::async_trait;

/// Prober: 对单个节点执行一次探测
///
/// 实现必须自行吞掉所有错误并返回失败结果, 不得 panic 或无限阻塞;
/// `port` 在调用期间由调用方独占分配。
#[async_trait]
pub trait Prober: Sync + Send {
    async fn probe(&self, node: &ProxyNode, port: u16, round: u32) -> ProbeResult;
}
