pub mod clash;

use crate::error::{CheckError, Result};
use crate::types::ProxyNode;
use regex::Regex;
use reqwest::Client;
use serde_yaml::Mapping;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

/// 订阅拉取用的 Client, 强制设置超时
pub fn source_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// 并发拉取所有订阅源
///
/// 返回值与输入一一对应; 拉取或解析失败的源为 None (只记录日志, 不中断)
pub async fn fetch_sources(client: &Client, sources: &[String]) -> Vec<Option<Vec<Mapping>>> {
    let tasks = sources.iter().enumerate().map(|(index, source)| {
        let client = client.clone();
        async move {
            match fetch_one(&client, source).await {
                Ok(records) => {
                    info!("Source [{}] parsed: {} nodes", index + 1, records.len());
                    Some(records)
                }
                Err(e) => {
                    let err = CheckError::SourceUnavailable {
                        source_name: source.clone(),
                        reason: e.to_string(),
                    };
                    warn!("{}", err);
                    None
                }
            }
        }
    });

    futures::future::join_all(tasks).await
}

async fn fetch_one(client: &Client, source: &str) -> Result<Vec<Mapping>> {
    let text = if is_remote(source) {
        client
            .get(source)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?
    } else {
        fs::read_to_string(source).await?
    };

    clash::parse_document(&text)
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// 剔除名称匹配的节点 (如 "剩余流量" 之类的信息条目), 保持原有顺序
pub fn filter_excluded(nodes: Vec<ProxyNode>, pattern: Option<&Regex>) -> Vec<ProxyNode> {
    match pattern {
        Some(re) => nodes.into_iter().filter(|n| !re.is_match(&n.name)).collect(),
        None => nodes,
    }
}
