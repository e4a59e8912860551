//! varq-cli: send queries to a varq-server and inspect the results.

use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use arrow_array::cast::AsArray;
use arrow_array::{Array, RecordBatch};
use arrow_ipc::reader::FileReader;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use varq_core::QueryRequest;

#[derive(Parser)]
#[command(name = "varq-cli")]
#[command(about = "Client for varq-server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a query request read from a JSON file and print the result
    Query {
        /// Server address (host:port)
        #[arg(short = 'H', long, default_value = "localhost:8199")]
        host: String,
        /// Path to a JSON-encoded QueryRequest
        #[arg(short, long)]
        request: PathBuf,
        /// Print the first N result rows
        #[arg(long, default_value_t = 10)]
        preview: usize,
    },
    /// Check that a server is up
    Health {
        #[arg(short = 'H', long, default_value = "localhost:8199")]
        host: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Query {
            host,
            request,
            preview,
        } => query(&host, &request, preview),
        Commands::Health { host } => health(&host),
    }
}

fn send_request(host: &str, request: &Value) -> Result<Value> {
    let mut stream =
        TcpStream::connect(host).with_context(|| format!("failed to connect to {host}"))?;

    let payload = serde_json::to_vec(request)?;
    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&payload)?;
    stream.flush()?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let resp_len = u32::from_be_bytes(len_buf) as usize;
    let mut response = vec![0u8; resp_len];
    stream.read_exact(&mut response)?;

    serde_json::from_slice(&response).context("failed to parse server response")
}

fn health(host: &str) -> Result<()> {
    let response = send_request(host, &json!({"op": "health"}))?;
    if response["status"] != "ok" {
        bail!("server unhealthy: {response}");
    }
    println!("ok");
    Ok(())
}

fn query(host: &str, request_path: &PathBuf, preview: usize) -> Result<()> {
    let request_text = std::fs::read_to_string(request_path)
        .with_context(|| format!("failed to read {}", request_path.display()))?;
    // Parse into the typed request first so malformed files fail here,
    // not at the server.
    let request: QueryRequest =
        serde_json::from_str(&request_text).context("failed to parse query request")?;

    let mut wire = serde_json::to_value(&request)?;
    wire.as_object_mut()
        .ok_or_else(|| anyhow!("request must be a JSON object"))?
        .insert("op".to_string(), json!("query"));

    let response = send_request(host, &wire)?;
    let status = response["status"].as_str().unwrap_or("unknown");
    if status != "ok" {
        bail!(
            "query failed ({status}): {}",
            response["message"].as_str().unwrap_or("no message")
        );
    }

    let num_rows = response["num_rows"].as_u64().unwrap_or(0);
    let ipc = BASE64
        .decode(response["ipc_base64"].as_str().unwrap_or(""))
        .context("failed to decode record batches")?;
    println!("Number of rows: {num_rows}");
    println!("Serialized size: {} bytes", ipc.len());

    if ipc.is_empty() {
        return Ok(());
    }

    let reader = FileReader::try_new(Cursor::new(ipc), None)
        .context("failed to open record batch reader")?;
    let batches: Vec<RecordBatch> = reader
        .collect::<std::result::Result<_, _>>()
        .context("failed to decode record batches")?;

    let decoded_rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    if decoded_rows as u64 != num_rows {
        bail!("decoded {decoded_rows} rows but the server reported {num_rows}");
    }

    print_preview(&batches, preview);
    Ok(())
}

fn print_preview(batches: &[RecordBatch], preview: usize) {
    let Some(first) = batches.first() else {
        return;
    };
    let schema = first.schema();
    let names: Vec<&str> = schema
        .fields()
        .iter()
        .map(|f| f.name().as_str())
        .collect();
    println!("{}", names.join("\t"));

    let mut printed = 0;
    for batch in batches {
        for row in 0..batch.num_rows() {
            if printed >= preview {
                return;
            }
            let cells: Vec<String> = batch
                .columns()
                .iter()
                .map(|col| format_cell(col.as_ref(), row))
                .collect();
            println!("{}", cells.join("\t"));
            printed += 1;
        }
    }
}

fn format_cell(column: &dyn Array, row: usize) -> String {
    use arrow_array::{
        BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array,
    };

    if column.is_null(row) {
        return "null".to_string();
    }
    if let Some(a) = column.as_any().downcast_ref::<Int64Array>() {
        return a.value(row).to_string();
    }
    if let Some(a) = column.as_any().downcast_ref::<Int32Array>() {
        return a.value(row).to_string();
    }
    if let Some(a) = column.as_any().downcast_ref::<Float64Array>() {
        return a.value(row).to_string();
    }
    if let Some(a) = column.as_any().downcast_ref::<Float32Array>() {
        return a.value(row).to_string();
    }
    if let Some(a) = column.as_any().downcast_ref::<BooleanArray>() {
        return a.value(row).to_string();
    }
    if let Some(a) = column.as_string_opt::<i32>() {
        return a.value(row).to_string();
    }
    format!("<{}>", column.data_type())
}
