use std::path::PathBuf;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tracekeep_core::config::Config;

use crate::protocol::{ApiEnvelope, ApiResponse};

pub enum QueryClient {
    Uds(BufReader<UnixStream>),
    Tcp(BufReader<TcpStream>),
}

impl QueryClient {
    /// Prefers the unix socket (flag, env, then the default path) and falls
    /// back to TCP.
    pub async fn connect(uds: Option<PathBuf>, addr: Option<String>) -> anyhow::Result<Self> {
        if let Some(path) = uds {
            let stream = UnixStream::connect(&path)
                .await
                .with_context(|| format!("connect UDS query server {}", path.display()))?;
            return Ok(Self::Uds(BufReader::new(stream)));
        }

        if addr.is_none() {
            let path = std::env::var("TRACEKEEP_QUERY_UDS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| Config::default().uds_path);
            if let Ok(stream) = UnixStream::connect(path).await {
                return Ok(Self::Uds(BufReader::new(stream)));
            }
        }

        let addr = addr
            .or_else(|| std::env::var("TRACEKEEP_QUERY_TCP_ADDR").ok())
            .unwrap_or_else(|| Config::default().query_tcp_addr);
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("connect query server TCP {addr}"))?;
        Ok(Self::Tcp(BufReader::new(stream)))
    }

    pub async fn request(&mut self, req: ApiEnvelope) -> anyhow::Result<ApiResponse> {
        let payload = serde_json::to_vec(&req)?;
        match self {
            QueryClient::Uds(stream) => round_trip(stream, &payload).await,
            QueryClient::Tcp(stream) => round_trip(stream, &payload).await,
        }
    }
}

async fn round_trip<T>(stream: &mut BufReader<T>, payload: &[u8]) -> anyhow::Result<ApiResponse>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.get_mut().write_all(payload).await?;
    stream.get_mut().write_all(b"\n").await?;
    stream.get_mut().flush().await?;

    let mut line = String::new();
    let n = stream.read_line(&mut line).await?;
    if n == 0 {
        anyhow::bail!("query server closed the connection");
    }
    serde_json::from_str(&line).context("decode query response")
}
