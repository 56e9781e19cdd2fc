use crate::aggregate::Aggregation;
use crate::error::{CheckError, Result};
use crate::types::{NodeStats, ProxyNode, RankMode, RankedNode};
use std::cmp::Ordering;
use std::collections::HashMap;

/// 选出每轮都成功的节点 (`NodeStats::passed_all`) 并排序
///
/// - Speed: 速度降序, 再按延迟升序
/// - Latency: 延迟升序
///
/// 所有条件都相同时保持合并顺序
pub fn rank(
    nodes: &[ProxyNode],
    stats: &HashMap<String, NodeStats>,
    rounds: u32,
    mode: RankMode,
) -> Vec<RankedNode> {
    let denominator = f64::from(rounds.max(1));

    let mut admitted: Vec<(usize, RankedNode)> = nodes
        .iter()
        .filter_map(|node| {
            let s = stats.get(&node.name)?;
            s.passed_all(rounds).then(|| {
                (
                    s.order,
                    RankedNode {
                        node: node.clone(),
                        avg_latency_ms: s.latency_sum_ms as f64 / denominator,
                        avg_throughput_bps: s.throughput_sum_bps / denominator,
                    },
                )
            })
        })
        .collect();

    admitted.sort_by(|(order_a, a), (order_b, b)| {
        compare(a, b, mode).then(order_a.cmp(order_b))
    });

    admitted.into_iter().map(|(_, ranked)| ranked).collect()
}

fn compare(a: &RankedNode, b: &RankedNode, mode: RankMode) -> Ordering {
    let by_latency = a.avg_latency_ms.total_cmp(&b.avg_latency_ms);
    match mode {
        RankMode::Speed => b
            .avg_throughput_bps
            .total_cmp(&a.avg_throughput_bps)
            .then(by_latency),
        RankMode::Latency => by_latency,
    }
}

impl Aggregation {
    /// 排序后的幸存节点; 一个都没有时返回 NoSurvivors
    pub fn rank(&self, mode: RankMode) -> Result<Vec<RankedNode>> {
        let ranked = rank(&self.nodes, &self.stats, self.rounds, mode);
        if ranked.is_empty() {
            return Err(CheckError::NoSurvivors {
                rounds: self.rounds,
            });
        }
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::node;
    use proptest::prelude::*;
    use std::sync::Arc;

    /// (name, success_count, latency per round, throughput per round)
    fn setup(entries: &[(&str, u32, u64, f64)], rounds: u32) -> (Vec<ProxyNode>, HashMap<String, NodeStats>) {
        let nodes: Vec<_> = entries.iter().map(|(name, ..)| node(name)).collect();
        let stats = entries
            .iter()
            .enumerate()
            .map(|(order, &(name, ok, latency, speed))| {
                let stats = NodeStats {
                    order,
                    success_count: ok,
                    latency_sum_ms: u128::from(latency) * u128::from(rounds),
                    throughput_sum_bps: speed * f64::from(rounds),
                };
                (name.to_string(), stats)
            })
            .collect();
        (nodes, stats)
    }

    fn names(ranked: &[RankedNode]) -> Vec<&str> {
        ranked.iter().map(|r| r.node.name.as_str()).collect()
    }

    #[test]
    fn test_speed_first_breaks_ties_by_latency() {
        let (nodes, stats) = setup(&[("a", 1, 100, 5.0), ("b", 1, 50, 5.0), ("c", 1, 10, 3.0)], 1);
        let ranked = rank(&nodes, &stats, 1, RankMode::Speed);
        assert_eq!(names(&ranked), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_latency_only() {
        let (nodes, stats) = setup(&[("a", 1, 100, 5.0), ("b", 1, 50, 5.0), ("c", 1, 10, 3.0)], 1);
        let ranked = rank(&nodes, &stats, 1, RankMode::Latency);
        assert_eq!(names(&ranked), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_full_ties_keep_merge_order() {
        let (nodes, stats) = setup(&[("z", 2, 80, 1.0), ("y", 2, 80, 1.0), ("x", 2, 80, 1.0)], 2);
        assert_eq!(names(&rank(&nodes, &stats, 2, RankMode::Speed)), vec!["z", "y", "x"]);
        assert_eq!(names(&rank(&nodes, &stats, 2, RankMode::Latency)), vec!["z", "y", "x"]);
    }

    #[test]
    fn test_only_nodes_passing_every_round() {
        let (nodes, stats) = setup(&[("good", 3, 300, 1.0), ("flaky", 2, 1, 100.0), ("dead", 0, 0, 0.0)], 3);
        let ranked = rank(&nodes, &stats, 3, RankMode::Speed);
        assert_eq!(names(&ranked), vec!["good"]);
        assert_eq!(ranked[0].avg_latency_ms, 300.0);
        assert_eq!(ranked[0].avg_throughput_bps, 1.0);
    }

    #[test]
    fn test_averages_are_means_over_rounds() {
        let nodes = vec![node("a")];
        let mut stats = HashMap::new();
        stats.insert(
            "a".to_string(),
            NodeStats {
                order: 0,
                success_count: 3,
                latency_sum_ms: 100 + 200 + 330,
                throughput_sum_bps: 1.0 + 2.0 + 6.0,
            },
        );
        let ranked = rank(&nodes, &stats, 3, RankMode::Speed);
        assert_eq!(ranked[0].avg_latency_ms, 210.0);
        assert_eq!(ranked[0].avg_throughput_bps, 3.0);
    }

    #[test]
    fn test_no_survivors() {
        let (nodes, stats) = setup(&[("a", 1, 10, 1.0)], 2);
        let agg = Aggregation {
            nodes: Arc::from(nodes),
            stats,
            rounds: 2,
        };
        assert!(matches!(
            agg.rank(RankMode::Speed),
            Err(CheckError::NoSurvivors { rounds: 2 })
        ));
    }

    #[test]
    fn test_ranking_agrees_with_admission() {
        let (nodes, stats) = setup(
            &[("a", 3, 10, 1.0), ("b", 2, 10, 1.0), ("c", 3, 20, 1.0), ("d", 4, 5, 9.0)],
            3,
        );
        let agg = Aggregation {
            nodes: Arc::from(nodes),
            stats,
            rounds: 3,
        };

        let ranked = agg.rank(RankMode::Latency).unwrap();
        let expected: Vec<&str> = agg
            .nodes
            .iter()
            .map(|n| n.name.as_str())
            .filter(|name| agg.admitted(name))
            .collect();
        assert_eq!(names(&ranked), expected);
        assert_eq!(expected, vec!["a", "c"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn ranking_is_a_total_order(
            entries in prop::collection::vec((0u32..=2, 1u64..500, 0u32..20), 0..30),
            speed_first in any::<bool>(),
        ) {
            let rounds = 2;
            let names: Vec<String> = (0..entries.len()).map(|i| format!("n{}", i)).collect();
            let rows: Vec<(&str, u32, u64, f64)> = entries
                .iter()
                .zip(&names)
                .map(|(&(ok, latency, speed), name)| (name.as_str(), ok, latency, f64::from(speed)))
                .collect();
            let (nodes, stats) = setup(&rows, rounds);
            let mode = if speed_first { RankMode::Speed } else { RankMode::Latency };

            let ranked = rank(&nodes, &stats, rounds, mode);

            let expected = rows.iter().filter(|e| e.1 == rounds).count();
            prop_assert_eq!(ranked.len(), expected);

            for pair in ranked.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                let key = |r: &RankedNode| {
                    let order = stats[&r.node.name].order;
                    match mode {
                        RankMode::Speed => (-(r.avg_throughput_bps as i64), r.avg_latency_ms as u64, order),
                        RankMode::Latency => (0, r.avg_latency_ms as u64, order),
                    }
                };
                prop_assert!(key(a) < key(b));
            }

            // identical input, identical output
            let again = rank(&nodes, &stats, rounds, mode);
            prop_assert_eq!(again, ranked);
        }
    }
}
