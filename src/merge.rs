use crate::types::ProxyNode;
use serde_yaml::Mapping;
use std::collections::HashSet;

/// 合并多个订阅源的节点
///
/// - `None` 表示该源拉取或解析失败, 直接跳过
/// - 同名节点按出现顺序重命名: 首个保留原名, 之后依次尝试 `name_1`, `name_2`, ...
/// - 数字等标量 name 按字符串处理; 缺失或非标量 name 的记录无法去重, 丢弃
pub fn merge_sources(sources: Vec<Option<Vec<Mapping>>>) -> Vec<ProxyNode> {
    let mut taken: HashSet<String> = HashSet::new();
    let mut merged = Vec::new();

    for records in sources.into_iter().flatten() {
        for record in records {
            let Some(mut node) = ProxyNode::from_record(record) else {
                continue;
            };

            let unique = unique_name(&node.name, &taken);
            if unique != node.name {
                node.rename(unique.clone());
            }
            taken.insert(unique);
            merged.push(node);
        }
    }

    merged
}

fn unique_name(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    (1u64..)
        .map(|counter| format!("{}_{}", base, counter))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}
