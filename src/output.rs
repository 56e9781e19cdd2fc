use crate::config::OutputSettings;
use crate::error::{CheckError, Result};
use crate::types::RankedNode;
use crate::utils;
use serde_yaml::{Mapping, Value};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

/// 把排序后的节点合并进模板并写出
///
/// 1. 读取模板 (不存在则从空文档开始)
/// 2. 追加节点到 `proxies`
/// 3. 把节点名单写入指定的策略组
/// 4. 备份旧的输出文件后写入
pub async fn write_output(ranked: &[RankedNode], settings: &OutputSettings) -> Result<()> {
    let mut doc = load_template(&settings.template).await?;
    merge_nodes(&mut doc, ranked, &settings.groups)?;

    if let Some(parent) = settings.path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    utils::backup_file(&settings.path).await?;

    fs::write(&settings.path, serde_yaml::to_string(&doc)?).await?;
    info!("Wrote {} nodes to {:?}", ranked.len(), settings.path);
    Ok(())
}

pub async fn restore_output(settings: &OutputSettings) -> Result<()> {
    utils::restore_latest_backup(&settings.path).await
}

async fn load_template(path: &Path) -> Result<Value> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        warn!("Template {:?} not found, starting from an empty document", path);
        return Ok(Value::Mapping(Mapping::new()));
    }
    let content = fs::read_to_string(path).await?;
    Ok(match serde_yaml::from_str(&content)? {
        Value::Null => Value::Mapping(Mapping::new()),
        doc => doc,
    })
}

fn merge_nodes(doc: &mut Value, ranked: &[RankedNode], groups: &[String]) -> Result<()> {
    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| CheckError::Custom("Template root must be a mapping".to_string()))?;

    let proxies = root
        .entry(Value::from("proxies"))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    if !proxies.is_sequence() {
        *proxies = Value::Sequence(Vec::new());
    }
    if let Some(list) = proxies.as_sequence_mut() {
        list.extend(ranked.iter().map(|r| Value::Mapping(r.node.attrs.clone())));
    }

    let names: Vec<Value> = ranked
        .iter()
        .map(|r| Value::from(r.node.name.as_str()))
        .collect();

    if let Some(list) = root.get_mut("proxy-groups").and_then(Value::as_sequence_mut) {
        for group in list.iter_mut().filter_map(Value::as_mapping_mut) {
            let selected = group
                .get("name")
                .and_then(Value::as_str)
                .is_some_and(|name| groups.iter().any(|g| g == name));
            if selected {
                group.insert(Value::from("proxies"), Value::Sequence(names.clone()));
            }
        }
    }

    Ok(())
}
