use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

/// 延迟未测得时的哨兵值
pub const LATENCY_UNMEASURED: u64 = u64::MAX;

/// 代理节点定义
///
/// `attrs` 保存订阅中的原始记录 (含重命名后的 name)，输出时原样写回。
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyNode {
    pub name: String,
    pub attrs: Mapping,
}

impl ProxyNode {
    /// 从原始记录构造节点；数字、布尔型的 `name` 转为字符串并写回记录，
    /// 缺失或非标量的 `name` 返回 None
    pub fn from_record(mut attrs: Mapping) -> Option<Self> {
        let name = match attrs.get("name")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return None,
        };
        attrs.insert(Value::from("name"), Value::from(name.as_str()));
        Some(Self { name, attrs })
    }

    /// 重命名节点，同时改写原始记录中的 name
    pub fn rename(&mut self, name: String) {
        self.attrs
            .insert(Value::from("name"), Value::from(name.as_str()));
        self.name = name;
    }

    /// 协议类型 (如 "vless")，仅用于展示
    pub fn kind(&self) -> &str {
        self.attrs
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("?")
    }

    pub fn server(&self) -> String {
        match self.attrs.get("server") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => "-".to_string(),
        }
    }
}

/// 单次探测结果
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub name: String,
    pub round: u32,
    pub success: bool,
    pub latency_ms: u64,     // 延迟 (毫秒), 若失败则为 LATENCY_UNMEASURED
    pub throughput_bps: f64, // 下载速度 (字节/秒), 未测则为 0
}

impl ProbeResult {
    pub fn failed(name: &str, round: u32) -> Self {
        Self {
            name: name.to_string(),
            round,
            success: false,
            latency_ms: LATENCY_UNMEASURED,
            throughput_bps: 0.0,
        }
    }

    pub fn passed(name: &str, round: u32, latency_ms: u64, throughput_bps: f64) -> Self {
        Self {
            name: name.to_string(),
            round,
            success: true,
            latency_ms,
            throughput_bps,
        }
    }
}

/// 每个节点的累计统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeStats {
    /// 节点在合并结果中的下标 (排序的最终决胜条件)
    pub order: usize,
    pub success_count: u32,
    pub latency_sum_ms: u128,
    pub throughput_sum_bps: f64,
}

impl NodeStats {
    pub fn new(order: usize) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    /// 失败结果不计入任何累计值
    pub fn record(&mut self, result: &ProbeResult) {
        if result.success {
            self.success_count += 1;
            self.latency_sum_ms += u128::from(result.latency_ms);
            self.throughput_sum_bps += result.throughput_bps;
        }
    }

    /// 准入条件: 前 `rounds` 轮全部成功
    pub fn passed_all(&self, rounds: u32) -> bool {
        self.success_count == rounds
    }
}

/// 通过全部轮次的节点
#[derive(Debug, Clone, PartialEq)]
pub struct RankedNode {
    pub node: ProxyNode,
    pub avg_latency_ms: f64,
    pub avg_throughput_bps: f64,
}

/// 排序策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RankMode {
    /// 下载速度优先, 延迟作为次要条件
    Speed,
    /// 仅按延迟
    Latency,
}

impl std::fmt::Display for RankMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RankMode::Speed => write!(f, "speed"),
            RankMode::Latency => write!(f, "latency"),
        }
    }
}

#[cfg(test)]
pub(crate) fn node(name: &str) -> ProxyNode {
    let mut attrs = Mapping::new();
    attrs.insert(Value::from("name"), Value::from(name));
    attrs.insert(Value::from("type"), Value::from("trojan"));
    ProxyNode::from_record(attrs).unwrap()
}
