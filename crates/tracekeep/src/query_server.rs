use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tracekeep_core::query::SessionsResponse;
use tracekeep_store::QueryService;
use tracing::Instrument;

use crate::protocol::{ApiEnvelope, ApiRequest, ApiResponse};

pub async fn run_query_server(
    service: QueryService,
    uds_path: PathBuf,
    tcp_addr: SocketAddr,
) -> anyhow::Result<()> {
    if let Some(parent) = uds_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("create uds parent dir")?;
    }

    if tokio::fs::metadata(&uds_path).await.is_ok() {
        let _ = tokio::fs::remove_file(&uds_path).await;
    }

    let uds_listener = UnixListener::bind(&uds_path).context("bind UDS query listener")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&uds_path).await?.permissions();
        perms.set_mode(0o600);
        tokio::fs::set_permissions(&uds_path, perms).await?;
    }
    let tcp_listener = TcpListener::bind(tcp_addr)
        .await
        .context("bind TCP query listener")?;

    let uds_task = tokio::spawn(run_uds_loop(uds_listener, service.clone()));
    let tcp_task = tokio::spawn(run_tcp_loop(tcp_listener, service));

    tokio::select! {
        res = uds_task => {
            res??;
        }
        res = tcp_task => {
            res??;
        }
    }

    Ok(())
}

async fn run_uds_loop(listener: UnixListener, service: QueryService) -> anyhow::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(BufReader::new(stream), service).await {
                tracing::warn!(error = ?err, "uds client request failed");
            }
        });
    }
}

async fn run_tcp_loop(listener: TcpListener, service: QueryService) -> anyhow::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(BufReader::new(stream), service).await {
                tracing::warn!(error = ?err, "tcp client request failed");
            }
        });
    }
}

async fn handle_stream<T>(mut stream: BufReader<T>, service: QueryService) -> anyhow::Result<()>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut line = String::new();
    let n = stream.read_line(&mut line).await?;
    if n == 0 {
        return Ok(());
    }

    let response = match serde_json::from_str::<ApiEnvelope>(&line) {
        Ok(envelope) => {
            let span = tracing::info_span!("query", kind = envelope.request.kind());
            handle_request(envelope, &service).instrument(span).await
        }
        Err(err) => ApiResponse::Error(format!("invalid request: {err}")),
    };
    let payload = serde_json::to_vec(&response)?;
    stream.get_mut().write_all(&payload).await?;
    stream.get_mut().write_all(b"\n").await?;
    stream.get_mut().flush().await?;
    Ok(())
}

async fn handle_request(envelope: ApiEnvelope, service: &QueryService) -> ApiResponse {
    let timeout = envelope.timeout_ms.map(Duration::from_millis);
    let resp = match envelope.request {
        ApiRequest::Traces(r) => service.list_traces(r, timeout).await.map(ApiResponse::Traces),
        ApiRequest::Trace(r) => service.get_trace(r, timeout).await.map(ApiResponse::Trace),
        ApiRequest::Sessions => service
            .list_sessions(timeout)
            .await
            .map(|sessions| ApiResponse::Sessions(SessionsResponse { sessions })),
        ApiRequest::Status => service.status(timeout).await.map(ApiResponse::Status),
        ApiRequest::Repair => service.repair().await.map(ApiResponse::Index),
        ApiRequest::PurgeSession(r) => service
            .purge_session(&r.session_id)
            .await
            .map(ApiResponse::Purged),
    };

    resp.unwrap_or_else(|e| {
        if e.is_storage() {
            tracing::error!(error = %e, "query failed in storage");
        } else {
            tracing::warn!(error = %e, "query failed");
        }
        ApiResponse::Error(e.to_string())
    })
}
