mod client;
mod output;
mod protocol;
mod query_server;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracekeep_core::config::Config;
use tracekeep_core::query::{PurgeSessionRequest, TraceRequest, TracesRequest};
use tracekeep_core::time::parse_duration_str;
use tracekeep_ingest::{Ingestor, Pipeline, PipelineConfig};
use tracekeep_store::{QueryService, Store, TraceIndex};

use crate::client::QueryClient;
use crate::output::{
    print_index_human, print_purge_human, print_sessions_human, print_status_human,
    print_trace_human, print_traces_human,
};
use crate::protocol::{ApiEnvelope, ApiRequest, ApiResponse};
use crate::telemetry::{
    SelfObserveMode, TelemetryConfig, init_cli_tracing, init_run_tracing, shutdown_tracing,
};

#[derive(Parser, Debug)]
#[command(name = "tracekeep")]
#[command(about = "Local span store with incrementally maintained trace summaries")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    uds: Option<PathBuf>,

    #[arg(long, global = true)]
    addr: Option<String>,

    #[arg(long, global = true, help = "Read timeout, e.g. 500ms or 5s")]
    timeout: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run ingest and query servers")]
    Run {
        #[arg(long)]
        db_path: Option<PathBuf>,
        #[arg(long)]
        otlp_grpc_addr: Option<String>,
        #[arg(long)]
        otlp_http_addr: Option<String>,
        #[arg(long)]
        query_tcp_addr: Option<String>,
        #[arg(long)]
        query_uds_path: Option<PathBuf>,
    },
    #[command(about = "List trace summaries, newest first")]
    Traces {
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    #[command(about = "Show the spans of one trace")]
    Trace {
        trace_id: String,
        #[arg(long, help = "Only the subtree under this span id")]
        root: Option<String>,
    },
    #[command(about = "List sessions derived from trace correlation")]
    Sessions,
    Status,
    #[command(about = "Verify the trace index and rebuild it if it drifted")]
    Repair,
    #[command(about = "Delete every trace of a session")]
    PurgeSession { session_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let request = match cli.command {
        Commands::Run {
            db_path,
            otlp_grpc_addr,
            otlp_http_addr,
            query_tcp_addr,
            query_uds_path,
        } => {
            let telemetry_cfg = TelemetryConfig {
                self_observe: SelfObserveMode::from_env(),
            };
            return run_server(
                RunOverrides {
                    db_path,
                    otlp_grpc_addr,
                    otlp_http_addr,
                    query_tcp_addr,
                    query_uds_path,
                },
                telemetry_cfg,
            )
            .await;
        }
        Commands::Traces {
            session,
            conversation,
            limit,
        } => ApiRequest::Traces(TracesRequest {
            session_id: session,
            conversation_id: conversation,
            limit,
        }),
        Commands::Trace { trace_id, root } => ApiRequest::Trace(TraceRequest {
            trace_id,
            root_span_id: root,
        }),
        Commands::Sessions => ApiRequest::Sessions,
        Commands::Status => ApiRequest::Status,
        Commands::Repair => ApiRequest::Repair,
        Commands::PurgeSession { session_id } => {
            ApiRequest::PurgeSession(PurgeSessionRequest { session_id })
        }
    };

    init_cli_tracing();
    let timeout_ms = cli
        .timeout
        .as_deref()
        .map(parse_duration_str)
        .transpose()?
        .map(|d| d.as_millis() as u64);
    let mut client = QueryClient::connect(cli.uds, cli.addr).await?;
    let response = client
        .request(ApiEnvelope {
            request,
            timeout_ms,
        })
        .await?;
    print_response(response, cli.json)
}

struct RunOverrides {
    db_path: Option<PathBuf>,
    otlp_grpc_addr: Option<String>,
    otlp_http_addr: Option<String>,
    query_tcp_addr: Option<String>,
    query_uds_path: Option<PathBuf>,
}

impl RunOverrides {
    fn apply(self, cfg: &mut Config) {
        if let Some(v) = self.db_path {
            cfg.db_path = v;
        }
        if let Some(v) = self.otlp_grpc_addr {
            cfg.otlp_grpc_addr = v;
        }
        if let Some(v) = self.otlp_http_addr {
            cfg.otlp_http_addr = v;
        }
        if let Some(v) = self.query_tcp_addr {
            cfg.query_tcp_addr = v;
        }
        if let Some(v) = self.query_uds_path {
            cfg.uds_path = v;
        }
    }
}

async fn run_server(overrides: RunOverrides, telemetry_cfg: TelemetryConfig) -> anyhow::Result<()> {
    let mut cfg = Config::load().context("load config")?;
    overrides.apply(&mut cfg);
    cfg.validate().context("validate config")?;

    let store = Store::open(&cfg.db_path)
        .with_context(|| format!("open store {}", cfg.db_path.display()))?;
    let index = TraceIndex::open(Arc::new(store.clone()), Arc::new(store.clone()))
        .context("open trace index")?;
    let pipeline = Pipeline::new(Ingestor::new(index.clone()), PipelineConfig::from(&cfg));
    init_run_tracing(telemetry_cfg, Some(pipeline.clone()));

    let service = QueryService::new(index, store).with_default_timeout(Some(cfg.query_timeout));

    eprintln!("tracekeep run");
    eprintln!("  db: {}", cfg.db_path.display());
    eprintln!("  ingest grpc: {}", cfg.otlp_grpc_addr);
    eprintln!("  ingest http: {}", cfg.otlp_http_addr);
    eprintln!("  query uds: {}", cfg.uds_path.display());
    eprintln!("  query tcp: {}", cfg.query_tcp_addr);

    let grpc_addr = cfg
        .otlp_grpc_addr
        .parse()
        .with_context(|| format!("parse grpc addr {}", cfg.otlp_grpc_addr))?;
    let http_addr = cfg
        .otlp_http_addr
        .parse()
        .with_context(|| format!("parse http addr {}", cfg.otlp_http_addr))?;
    let query_addr = cfg
        .query_tcp_addr
        .parse()
        .with_context(|| format!("parse query addr {}", cfg.query_tcp_addr))?;

    let ingest_task = tokio::spawn(tracekeep_ingest::server::run_ingest_servers(
        pipeline, grpc_addr, http_addr,
    ));

    let query_task = tokio::spawn(query_server::run_query_server(
        service.clone(),
        cfg.uds_path.clone(),
        query_addr,
    ));

    let audit_task = tokio::spawn(run_index_audit(service, cfg.index_audit_interval));

    tokio::select! {
        res = ingest_task => {
            res??;
        }
        res = query_task => {
            res??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }

    audit_task.abort();
    shutdown_tracing();
    Ok(())
}

/// Periodically compares the index with the span log and rebuilds on drift.
async fn run_index_audit(service: QueryService, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // The index was checked on open; skip the immediate first tick.
    interval.tick().await;
    loop {
        interval.tick().await;
        match service.repair().await {
            Ok(report) if report.rebuilt => {
                tracing::warn!(
                    traces = report.traces,
                    spans = report.spans,
                    "trace index rebuilt by audit"
                );
            }
            Ok(report) => {
                tracing::debug!(
                    traces = report.traces,
                    spans = report.spans,
                    "trace index audit clean"
                );
            }
            Err(err) => tracing::warn!(error = ?err, "trace index audit failed"),
        }
    }
}

fn print_response(response: ApiResponse, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    match response {
        ApiResponse::Traces(v) => print_traces_human(&v),
        ApiResponse::Trace(v) => print_trace_human(&v),
        ApiResponse::Sessions(v) => print_sessions_human(&v),
        ApiResponse::Status(v) => print_status_human(&v),
        ApiResponse::Index(v) => print_index_human(&v),
        ApiResponse::Purged(v) => print_purge_human(&v),
        ApiResponse::Error(e) => anyhow::bail!("{e}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_trace_with_root() {
        let cli = Cli::try_parse_from(["tracekeep", "trace", "abc", "--root", "s1", "--json"])
            .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Trace { trace_id, root } => {
                assert_eq!(trace_id, "abc");
                assert_eq!(root.as_deref(), Some("s1"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_purge_and_timeout() {
        let cli = Cli::try_parse_from(["tracekeep", "purge-session", "s-9", "--timeout", "2s"])
            .unwrap();
        assert_eq!(cli.timeout.as_deref(), Some("2s"));
        assert!(matches!(
            cli.command,
            Commands::PurgeSession { ref session_id } if session_id == "s-9"
        ));
    }

    #[test]
    fn run_overrides_replace_config() {
        let mut cfg = Config::default();
        RunOverrides {
            db_path: Some(PathBuf::from("/tmp/t.duckdb")),
            otlp_grpc_addr: None,
            otlp_http_addr: Some("127.0.0.1:9999".into()),
            query_tcp_addr: None,
            query_uds_path: None,
        }
        .apply(&mut cfg);
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/t.duckdb"));
        assert_eq!(cfg.otlp_http_addr, "127.0.0.1:9999");
        assert_eq!(cfg.otlp_grpc_addr, "127.0.0.1:4317");
    }
}
