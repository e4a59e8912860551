//! varq-server: the query service's TCP surface.
//!
//! One unary operation (`query`) over a length-prefixed JSON frame
//! protocol, plus `health` and `list_ops` conveniences. The engine
//! (registry, thread pool, URL reader) is built once at startup, before
//! the listener accepts traffic, and shared across connections.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use varq_core::{
    FunctionRegistry, GcsReader, LocalFileReader, QueryEngine, QueryError, QueryRequest, UrlReader,
};

const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const DEFAULT_IO_TIMEOUT_MILLIS: u64 = 30_000;
const DEFAULT_MAX_CONNECTIONS: usize = 64;
// Bounds peak memory: at most this many URL scans are in flight, which is
// what makes the worker count a RAM-budget knob on small deployments.
const DEFAULT_NUM_WORKERS: usize = 16;

const OPS: &[&str] = &["query", "health", "list_ops"];

#[derive(Debug, Clone)]
struct ServerConfig {
    port: u16,
    num_workers: usize,
    local_files: bool,
    max_frame_len: usize,
    max_connections: usize,
    io_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Query {
        #[serde(flatten)]
        request: QueryRequest,
    },
    Health,
    ListOps,
}

#[derive(Debug, Serialize)]
struct Response {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipc_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ops: Option<Vec<&'static str>>,
}

impl Default for Response {
    fn default() -> Self {
        Response {
            status: "ok",
            message: None,
            num_rows: None,
            ipc_base64: None,
            ops: None,
        }
    }
}

impl Response {
    fn error(status: &'static str, message: String) -> Self {
        Response {
            status,
            message: Some(message),
            ..Default::default()
        }
    }
}

/// Map engine errors onto transport status strings.
fn map_query_error(err: &QueryError) -> &'static str {
    match err {
        QueryError::InvalidArgument(_) | QueryError::Io(_) => "invalid_argument",
        QueryError::Cancelled(_) => "cancelled",
        QueryError::Internal(_) => "internal",
    }
}

fn main() {
    let log_format = std::env::var("VARQ_LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into()),
            )
            .init();
    }

    let port = match std::env::var("PORT") {
        Ok(value) => match value.parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                eprintln!("failed to parse PORT environment variable: {value}");
                std::process::exit(1);
            }
        },
        Err(_) => {
            eprintln!("PORT environment variable not set");
            std::process::exit(1);
        }
    };

    let cfg = match parse_config(port, std::env::args().skip(1).collect()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to build runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cfg)) {
        error!("server failed: {e}");
        eprintln!("server failed: {e}");
        std::process::exit(1);
    }
}

fn parse_config(port: u16, args: Vec<String>) -> Result<ServerConfig, String> {
    let mut num_workers = DEFAULT_NUM_WORKERS;
    let mut local_files = false;
    let mut max_frame_len = DEFAULT_MAX_FRAME_LEN;
    let mut max_connections = DEFAULT_MAX_CONNECTIONS;
    let mut io_timeout_ms = DEFAULT_IO_TIMEOUT_MILLIS;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--workers" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| "--workers requires a value".to_string())?;
                num_workers = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid --workers value: {value}"))?
                    .max(1);
                i += 1;
            }
            "--local-files" => {
                local_files = true;
            }
            "--max-frame-bytes" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| "--max-frame-bytes requires a value".to_string())?;
                max_frame_len = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid --max-frame-bytes value: {value}"))?
                    .max(1024);
                i += 1;
            }
            "--max-conns" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| "--max-conns requires a value".to_string())?;
                max_connections = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid --max-conns value: {value}"))?
                    .max(1);
                i += 1;
            }
            "--io-timeout-ms" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| "--io-timeout-ms requires a value".to_string())?;
                io_timeout_ms = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid --io-timeout-ms value: {value}"))?
                    .max(1);
                i += 1;
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
        i += 1;
    }

    Ok(ServerConfig {
        port,
        num_workers,
        local_files,
        max_frame_len,
        max_connections,
        io_timeout: Duration::from_millis(io_timeout_ms),
    })
}

async fn run(cfg: ServerConfig) -> Result<(), String> {
    // Register compute functions before the surface accepts traffic.
    let registry = Arc::new(
        FunctionRegistry::with_builtins()
            .map_err(|e| format!("failed to register compute functions: {e}"))?,
    );

    let reader: Arc<dyn UrlReader> = if cfg.local_files {
        Arc::new(LocalFileReader::new())
    } else {
        Arc::new(GcsReader::new().map_err(|e| format!("failed to create GCS reader: {e}"))?)
    };

    let engine = Arc::new(QueryEngine::new(cfg.num_workers, reader, registry));

    let bind_addr = format!("[::]:{}", cfg.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| format!("bind {bind_addr} failed: {e}"))?;

    info!(
        bind_addr = %bind_addr,
        workers = cfg.num_workers,
        max_connections = cfg.max_connections,
        local_files = cfg.local_files,
        "varq-server started"
    );

    let limiter = Arc::new(Semaphore::new(cfg.max_connections));
    let cfg = Arc::new(cfg);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let permit = match limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break Ok(()),
        };

        let engine = engine.clone();
        let cfg = cfg.clone();
        tokio::spawn(async move {
            debug!(peer = %peer, "connection opened");
            if let Err(e) = handle_connection(stream, engine, &cfg).await {
                debug!(peer = %peer, "connection closed: {e}");
            }
            drop(permit);
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    engine: Arc<QueryEngine>,
    cfg: &ServerConfig,
) -> Result<(), String> {
    loop {
        let frame = match read_frame(&mut stream, cfg).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()), // clean EOF
            Err(e) => return Err(e),
        };

        let response = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => handle_request(request, &engine).await,
            Err(e) => Response::error("invalid_argument", format!("bad request: {e}")),
        };

        write_frame(&mut stream, &response, cfg).await?;
    }
}

async fn handle_request(request: Request, engine: &Arc<QueryEngine>) -> Response {
    match request {
        Request::Query { request } => {
            let engine = engine.clone();
            let result =
                tokio::task::spawn_blocking(move || engine.query(&request)).await;
            match result {
                Ok(Ok(response)) => Response {
                    num_rows: Some(response.num_rows),
                    ipc_base64: Some(BASE64.encode(&response.record_batches)),
                    ..Default::default()
                },
                Ok(Err(e)) => Response::error(map_query_error(&e), e.to_string()),
                Err(e) => Response::error("internal", format!("query task failed: {e}")),
            }
        }
        Request::Health => Response::default(),
        Request::ListOps => Response {
            ops: Some(OPS.to_vec()),
            ..Default::default()
        },
    }
}

/// Read one length-prefixed frame; `None` on a clean EOF at a frame
/// boundary.
async fn read_frame(
    stream: &mut TcpStream,
    cfg: &ServerConfig,
) -> Result<Option<Vec<u8>>, String> {
    let mut len_buf = [0u8; 4];
    match timeout(cfg.io_timeout, stream.read_exact(&mut len_buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Ok(Err(e)) => return Err(format!("read failed: {e}")),
        Err(_) => return Err("read timed out".to_string()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > cfg.max_frame_len {
        return Err(format!(
            "frame of {len} bytes exceeds limit of {} bytes",
            cfg.max_frame_len
        ));
    }

    let mut frame = vec![0u8; len];
    match timeout(cfg.io_timeout, stream.read_exact(&mut frame)).await {
        Ok(Ok(_)) => Ok(Some(frame)),
        Ok(Err(e)) => Err(format!("read failed: {e}")),
        Err(_) => Err("read timed out".to_string()),
    }
}

async fn write_frame(
    stream: &mut TcpStream,
    response: &Response,
    cfg: &ServerConfig,
) -> Result<(), String> {
    let payload =
        serde_json::to_vec(response).map_err(|e| format!("encode failed: {e}"))?;
    let len = payload.len() as u32;
    let write = async {
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&payload).await?;
        stream.flush().await
    };
    match timeout(cfg.io_timeout, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("write failed: {e}")),
        Err(_) => Err("write timed out".to_string()),
    }
}
