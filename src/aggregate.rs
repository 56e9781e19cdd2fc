use crate::pool::WorkerPool;
use crate::types::{NodeStats, ProxyNode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// 多轮探测的累计结果
#[derive(Debug, Clone)]
pub struct Aggregation {
    /// 合并顺序的节点列表
    pub nodes: Arc<[ProxyNode]>,
    /// 节点名 -> 累计统计, 只由聚合层修改
    pub stats: HashMap<String, NodeStats>,
    pub rounds: u32,
}

impl Aggregation {
    /// 必须每一轮都成功
    #[cfg(test)]
    pub fn admitted(&self, name: &str) -> bool {
        self.stats
            .get(name)
            .is_some_and(|s| s.passed_all(self.rounds))
    }
}

/// RoundAggregator: 重复执行 R 轮, 轮与轮之间是硬屏障
pub struct RoundAggregator {
    pool: WorkerPool,
    rounds: u32,
}

impl RoundAggregator {
    pub fn new(pool: WorkerPool, rounds: u32) -> Self {
        Self { pool, rounds }
    }

    pub async fn run(&self, nodes: Vec<ProxyNode>) -> Aggregation {
        let nodes: Arc<[ProxyNode]> = nodes.into();
        let mut stats: HashMap<String, NodeStats> = nodes
            .iter()
            .enumerate()
            .map(|(order, node)| (node.name.clone(), NodeStats::new(order)))
            .collect();

        for round in 1..=self.rounds {
            self.pool
                .progress()
                .set_message(format!("Round {}/{}", round, self.rounds));

            // run_round 返回时本轮所有探测都已结束, 端口可以复用
            let results = self.pool.run_round(nodes.clone(), round).await;

            let mut passed = 0;
            for result in &results {
                match stats.get_mut(&result.name) {
                    Some(entry) if result.round == round => {
                        entry.record(result);
                        passed += usize::from(result.success);
                    }
                    _ => warn!(
                        "Discarding unexpected result for '{}' (round {})",
                        result.name, result.round
                    ),
                }
            }

            let alive = stats
                .values()
                .filter(|s| s.passed_all(round))
                .count();
            info!(
                "Round {}/{}: {}/{} passed, {} still passed every round",
                round,
                self.rounds,
                passed,
                nodes.len(),
                alive
            );
        }

        Aggregation {
            nodes,
            stats,
            rounds: self.rounds,
        }
    }
}
