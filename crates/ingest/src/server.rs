use std::net::SocketAddr;

use tonic::transport::Server;
use tracekeep_core::error::{Result, TracekeepError};

use crate::otlp::grpc::GrpcIngest;
use crate::otlp::http;
use crate::pipeline::Pipeline;

/// Serves OTLP/gRPC and OTLP/HTTP until either listener fails.
pub async fn run_ingest_servers(
    pipeline: Pipeline,
    grpc_addr: SocketAddr,
    http_addr: SocketAddr,
) -> Result<()> {
    let grpc = GrpcIngest::new(pipeline.clone());
    let http_router = http::router(pipeline);

    let grpc_task = tokio::spawn(async move {
        Server::builder()
            .add_service(grpc.traces_service())
            .serve(grpc_addr)
            .await
    });

    let http_task = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(http_addr).await?;
        axum::serve(listener, http_router).await
    });

    tracing::info!(%grpc_addr, %http_addr, "otlp receivers listening");

    tokio::select! {
        res = grpc_task => {
            let inner = res
                .map_err(|e| TracekeepError::Ingest(format!("gRPC task join failed: {e}")))?;
            inner.map_err(|e| TracekeepError::Ingest(format!("gRPC server failed: {e}")))
        }
        res = http_task => {
            let inner = res
                .map_err(|e| TracekeepError::Ingest(format!("HTTP task join failed: {e}")))?;
            inner.map_err(|e| TracekeepError::Ingest(format!("HTTP server failed: {e}")))
        }
    }
}
