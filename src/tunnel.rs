use crate::config::ProbeSettings;
use crate::error::{CheckError, Result};
use crate::types::ProxyNode;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::{json, Value as Json};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempPath;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// 节点的上游协议及其凭据
#[derive(Debug, Clone, PartialEq)]
pub enum Protocol {
    Vless { uuid: String, flow: String },
    Vmess { uuid: String, alter_id: u32, cipher: String },
    Trojan { password: String },
    Shadowsocks { method: String, password: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transport {
    Tcp,
    Ws { path: String, headers: BTreeMap<String, String> },
    Grpc { service_name: String },
    H2 { path: String, hosts: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Security {
    None,
    Tls { server_name: String },
    Reality {
        public_key: String,
        short_id: String,
        server_name: String,
        fingerprint: String,
    },
}

/// 解析后的节点: 每种协议只携带自己需要的字段
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub server: String,
    pub port: u16,
    pub protocol: Protocol,
    pub transport: Transport,
    pub security: Security,
}

// --- Clash 记录的字段形状 ---

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Upstream {
    server: String,
    #[serde(deserialize_with = "de_port")]
    port: u16,
    network: Option<String>,
    #[serde(default)]
    tls: bool,
    servername: Option<String>,
    sni: Option<String>,
    ws_opts: Option<WsOpts>,
    grpc_opts: Option<GrpcOpts>,
    h2_opts: Option<H2Opts>,
    reality_opts: Option<RealityOpts>,
    client_fingerprint: Option<String>,
}

#[derive(Deserialize, Default)]
struct WsOpts {
    path: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct GrpcOpts {
    grpc_service_name: Option<String>,
}

#[derive(Deserialize, Default)]
struct H2Opts {
    path: Option<String>,
    #[serde(default)]
    host: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RealityOpts {
    public_key: String,
    #[serde(default)]
    short_id: String,
}

#[derive(Deserialize)]
struct VlessFields {
    #[serde(alias = "id")]
    uuid: String,
    flow: Option<String>,
}

#[derive(Deserialize)]
struct VmessFields {
    #[serde(alias = "id")]
    uuid: String,
    #[serde(rename = "alterId", default, deserialize_with = "de_alter_id")]
    alter_id: u32,
    cipher: Option<String>,
}

#[derive(Deserialize)]
struct TrojanFields {
    password: String,
}

#[derive(Deserialize)]
struct ShadowsocksFields {
    cipher: String,
    password: String,
}

/// 端口既可能是数字也可能是字符串
fn de_port<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(de::Error::custom),
    }
}

/// alterId 可选, 数字或字符串均可, 无法解析时取 0
fn de_alter_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()).unwrap_or(0),
        Value::String(text) => text.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

impl NodeSpec {
    pub fn from_node(node: &ProxyNode) -> Result<Self> {
        let record = Value::Mapping(node.attrs.clone());
        let invalid = |e: serde_yaml::Error| CheckError::InvalidNode {
            name: node.name.clone(),
            reason: e.to_string(),
        };

        let protocol = match node.kind() {
            "vless" => {
                let f: VlessFields = serde_yaml::from_value(record.clone()).map_err(invalid)?;
                Protocol::Vless {
                    uuid: f.uuid,
                    flow: f.flow.unwrap_or_default(),
                }
            }
            "vmess" => {
                let f: VmessFields = serde_yaml::from_value(record.clone()).map_err(invalid)?;
                Protocol::Vmess {
                    uuid: f.uuid,
                    alter_id: f.alter_id,
                    cipher: f.cipher.unwrap_or_else(|| "auto".to_string()),
                }
            }
            "trojan" => {
                let f: TrojanFields = serde_yaml::from_value(record.clone()).map_err(invalid)?;
                Protocol::Trojan { password: f.password }
            }
            "ss" => {
                let f: ShadowsocksFields =
                    serde_yaml::from_value(record.clone()).map_err(invalid)?;
                Protocol::Shadowsocks {
                    method: f.cipher,
                    password: f.password,
                }
            }
            other => return Err(CheckError::UnsupportedProtocol(other.to_string())),
        };

        let up: Upstream = serde_yaml::from_value(record).map_err(invalid)?;

        let transport = match up.network.as_deref().unwrap_or("tcp") {
            "tcp" => Transport::Tcp,
            "ws" => {
                let opts = up.ws_opts.unwrap_or_default();
                Transport::Ws {
                    path: opts.path.unwrap_or_else(|| "/".to_string()),
                    headers: opts.headers,
                }
            }
            "grpc" => Transport::Grpc {
                service_name: up
                    .grpc_opts
                    .unwrap_or_default()
                    .grpc_service_name
                    .unwrap_or_default(),
            },
            "h2" => {
                let opts = up.h2_opts.unwrap_or_default();
                Transport::H2 {
                    path: opts.path.unwrap_or_else(|| "/".to_string()),
                    hosts: opts.host,
                }
            }
            other => return Err(CheckError::UnsupportedTransport(other.to_string())),
        };

        let security = if let Some(reality) = up.reality_opts {
            Security::Reality {
                public_key: reality.public_key,
                short_id: reality.short_id,
                server_name: up.servername.unwrap_or_else(|| up.server.clone()),
                fingerprint: up
                    .client_fingerprint
                    .unwrap_or_else(|| "chrome".to_string()),
            }
        } else if up.tls || matches!(protocol, Protocol::Trojan { .. }) {
            Security::Tls {
                server_name: up
                    .servername
                    .or(up.sni)
                    .unwrap_or_else(|| up.server.clone()),
            }
        } else {
            Security::None
        };

        Ok(Self {
            server: up.server,
            port: up.port,
            protocol,
            transport,
            security,
        })
    }

    /// v2ray outbound 配置
    pub fn outbound(&self) -> Json {
        let (protocol, settings) = match &self.protocol {
            Protocol::Vless { uuid, flow } => (
                "vless",
                json!({ "vnext": [{
                    "address": self.server,
                    "port": self.port,
                    "users": [{ "id": uuid, "encryption": "none", "flow": flow }]
                }] }),
            ),
            Protocol::Vmess {
                uuid,
                alter_id,
                cipher,
            } => (
                "vmess",
                json!({ "vnext": [{
                    "address": self.server,
                    "port": self.port,
                    "users": [{ "id": uuid, "alterId": alter_id, "security": cipher }]
                }] }),
            ),
            Protocol::Trojan { password } => (
                "trojan",
                json!({ "servers": [{
                    "address": self.server,
                    "port": self.port,
                    "password": password
                }] }),
            ),
            Protocol::Shadowsocks { method, password } => (
                "shadowsocks",
                json!({ "servers": [{
                    "address": self.server,
                    "port": self.port,
                    "method": method,
                    "password": password
                }] }),
            ),
        };

        let mut stream = serde_json::Map::new();
        let network = match &self.transport {
            Transport::Tcp => "tcp",
            Transport::Ws { path, headers } => {
                stream.insert(
                    "wsSettings".into(),
                    json!({ "path": path, "headers": headers }),
                );
                "ws"
            }
            Transport::Grpc { service_name } => {
                stream.insert("grpcSettings".into(), json!({ "serviceName": service_name }));
                "grpc"
            }
            Transport::H2 { path, hosts } => {
                stream.insert("httpSettings".into(), json!({ "path": path, "host": hosts }));
                "http"
            }
        };
        stream.insert("network".into(), json!(network));

        let security = match &self.security {
            Security::None => "none",
            Security::Tls { server_name } => {
                stream.insert(
                    "tlsSettings".into(),
                    json!({ "serverName": server_name, "allowInsecure": true }),
                );
                "tls"
            }
            Security::Reality {
                public_key,
                short_id,
                server_name,
                fingerprint,
            } => {
                stream.insert(
                    "realitySettings".into(),
                    json!({
                        "publicKey": public_key,
                        "shortId": short_id,
                        "serverName": server_name,
                        "fingerprint": fingerprint
                    }),
                );
                "reality"
            }
        };
        stream.insert("security".into(), json!(security));

        json!({
            "protocol": protocol,
            "settings": settings,
            "streamSettings": Json::Object(stream),
        })
    }
}

/// 完整的隧道配置: 本地 socks 入站 + 节点出站
pub fn tunnel_config(spec: &NodeSpec, port: u16) -> Json {
    json!({
        "log": { "loglevel": "none" },
        "inbounds": [{ "port": port, "listen": "127.0.0.1", "protocol": "socks" }],
        "outbounds": [spec.outbound()]
    })
}

/// 一次探测独占的隧道进程及其临时配置
///
/// `shutdown` 强制结束进程并删除配置; 未调用 `shutdown` 时由 `Drop` 兜底。
/// 两条路径都通过 `Option::take` 保证只执行一次。
pub struct Tunnel {
    child: Option<Child>,
    config: Option<TempPath>,
    kill_timeout: Duration,
}

impl Tunnel {
    /// 写入配置, 启动隧道进程, 并等待启动宽限期
    pub async fn launch(settings: &ProbeSettings, node: &ProxyNode, port: u16) -> Result<Self> {
        let spec = NodeSpec::from_node(node)?;
        let config = write_config(&tunnel_config(&spec, port), &settings.work_dir(), port)?;

        let config_arg = config.to_string_lossy().to_string();
        let args: Vec<String> = settings
            .tunnel_args
            .iter()
            .map(|arg| arg.replace("{config}", &config_arg))
            .collect();

        // config 在这里被 drop 时临时文件随之删除
        let child = Command::new(&settings.tunnel_program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CheckError::ProbeStartup(format!("{:?}: {}", settings.tunnel_program, e))
            })?;

        let mut tunnel = Self {
            child: Some(child),
            config: Some(config),
            kill_timeout: settings.kill_timeout(),
        };
        debug!("Tunnel for '{}' started on port {} (pid {:?})", node.name, port, tunnel.pid());

        tokio::time::sleep(settings.startup_grace()).await;

        if let Some(child) = tunnel.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(CheckError::ProbeStartup(format!(
                    "tunnel exited during startup ({})",
                    status
                )));
            }
        }

        Ok(tunnel)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    #[cfg(test)]
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }

    /// 强制结束进程 (有界等待) 并删除临时配置
    pub async fn shutdown(mut self) {
        if let Some(mut child) = self.child.take() {
            // 进程可能已自行退出
            let _ = child.start_kill();
            if tokio::time::timeout(self.kill_timeout, child.wait())
                .await
                .is_err()
            {
                warn!("Tunnel pid {:?} did not exit within {:?}", child.id(), self.kill_timeout);
            }
        }
        if let Some(config) = self.config.take() {
            if let Err(e) = config.close() {
                warn!("Failed to remove tunnel config: {}", e);
            }
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
        // TempPath 在 drop 时删除文件
        self.config.take();
    }
}

fn write_config(config: &Json, dir: &Path, port: u16) -> Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix(&format!("tunnel-{}-", port))
        .suffix(".json")
        .tempfile_in(dir)?;
    serde_json::to_writer(file.as_file_mut(), config)?;
    file.as_file_mut().flush()?;
    Ok(file.into_temp_path())
}
