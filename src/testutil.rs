//! 测试夹具: 脚本化的 `Prober`, 简易 HTTP 服务, 以及充当隧道的 SOCKS5 端点

use crate::traits::Prober;
use crate::types::{ProbeResult, ProxyNode};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

type Outcome = Box<dyn Fn(&str, u32) -> Option<(u64, f64)> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Call {
    pub name: String,
    pub port: u16,
    pub round: u32,
}

/// 记录每次调用, 并在运行中检查调度约束:
/// 同一端口不会被同时占用, 不会有两轮同时进行
pub struct FakeProber {
    outcome: Outcome,
    calls: Mutex<Vec<Call>>,
    active_ports: Mutex<HashSet<u16>>,
    rounds_in_flight: Mutex<HashMap<u32, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    port_conflict: AtomicBool,
    round_overlap: AtomicBool,
}

impl FakeProber {
    /// `outcome(name, round)` 成功时返回 `Some((延迟毫秒, 速度))`
    pub fn new(outcome: impl Fn(&str, u32) -> Option<(u64, f64)> + Send + Sync + 'static) -> Self {
        Self {
            outcome: Box::new(outcome),
            calls: Mutex::new(Vec::new()),
            active_ports: Mutex::new(HashSet::new()),
            rounds_in_flight: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            port_conflict: AtomicBool::new(false),
            round_overlap: AtomicBool::new(false),
        }
    }

    pub fn passing() -> Self {
        Self::new(|_, _| Some((100, 1000.0)))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn port_conflict(&self) -> bool {
        self.port_conflict.load(Ordering::SeqCst)
    }

    pub fn round_overlap(&self) -> bool {
        self.round_overlap.load(Ordering::SeqCst)
    }

    fn enter(&self, port: u16, round: u32) {
        if !self.active_ports.lock().unwrap().insert(port) {
            self.port_conflict.store(true, Ordering::SeqCst);
        }
        {
            let mut rounds = self.rounds_in_flight.lock().unwrap();
            if rounds.iter().any(|(r, n)| *r != round && *n > 0) {
                self.round_overlap.store(true, Ordering::SeqCst);
            }
            *rounds.entry(round).or_default() += 1;
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self, port: u16, round: u32) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(n) = self.rounds_in_flight.lock().unwrap().get_mut(&round) {
            *n -= 1;
        }
        self.active_ports.lock().unwrap().remove(&port);
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, node: &ProxyNode, port: u16, round: u32) -> ProbeResult {
        self.enter(port, round);
        self.calls.lock().unwrap().push(Call {
            name: node.name.clone(),
            port,
            round,
        });

        // 耗时不均, 让完成顺序打乱
        let jitter = node.name.bytes().map(u64::from).sum::<u64>() % 7;
        tokio::time::sleep(Duration::from_millis(1 + jitter)).await;

        let result = match (self.outcome)(&node.name, round) {
            Some((latency_ms, throughput)) => {
                ProbeResult::passed(&node.name, round, latency_ms, throughput)
            }
            None => ProbeResult::failed(&node.name, round),
        };
        self.leave(port, round);
        result
    }
}

pub const BIG_BODY_LEN: usize = 4 * 1024 * 1024;

/// 路由: `/generate_204`, `/fail` (503), `/big` (4 MiB), `/slow` (挂起), 其他返回 404
pub async fn spawn_http_fixture() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_http(stream));
        }
    });

    addr
}

async fn serve_http(mut stream: TcpStream) {
    let mut buf = vec![0u8; 4096];
    let n = match stream.read(&mut buf).await {
        Ok(n) if n > 0 => n,
        _ => return,
    };
    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

    let head = |status: &str, len: usize| {
        format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status, len
        )
    };

    let _ = match path.as_str() {
        "/generate_204" => stream.write_all(head("204 No Content", 0).as_bytes()).await,
        "/fail" => stream.write_all(head("503 Service Unavailable", 0).as_bytes()).await,
        "/big" => {
            if stream
                .write_all(head("200 OK", BIG_BODY_LEN).as_bytes())
                .await
                .is_err()
            {
                return;
            }
            let chunk = vec![b'x'; 64 * 1024];
            for _ in 0..BIG_BODY_LEN / chunk.len() {
                // 客户端读够后会断开
                if stream.write_all(&chunk).await.is_err() {
                    return;
                }
            }
            Ok(())
        }
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(10)).await;
            stream.write_all(head("200 OK", 0).as_bytes()).await
        }
        _ => stream.write_all(head("404 Not Found", 0).as_bytes()).await,
    };
}

/// 最小 SOCKS5 实现 (无认证, 仅 CONNECT), 返回端口和 CONNECT 计数
pub async fn spawn_socks_fixture() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let _ = serve_socks(stream, counter).await;
            });
        }
    });

    (port, connections)
}

async fn serve_socks(mut client: TcpStream, counter: Arc<AtomicUsize>) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[5, 0]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        1 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        3 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).to_string()
        }
        4 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
        _ => return Ok(()),
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    let mut upstream = TcpStream::connect((host.as_str(), port)).await?;
    counter.fetch_add(1, Ordering::SeqCst);
    client.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;

    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}
