use crate::error::{CheckError, Result};
use serde_yaml::{Mapping, Value};

/// 解析 Clash 订阅文档, 返回 `proxies` 下的全部节点记录
///
/// 缺少 `proxies` 或其不是列表视为无效文档; 列表中非 mapping 的条目被丢弃。
pub fn parse_document(text: &str) -> Result<Vec<Mapping>> {
    let doc: Value = serde_yaml::from_str(text)?;

    let proxies = doc
        .get("proxies")
        .and_then(Value::as_sequence)
        .ok_or_else(|| CheckError::Custom("document has no 'proxies' list".to_string()))?;

    Ok(proxies
        .iter()
        .filter_map(|entry| entry.as_mapping().cloned())
        .collect())
}
