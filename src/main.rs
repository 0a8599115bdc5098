use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use cid_store::envelope::{Metadata, MetadataValue};
use cid_store::storage::fallback::synthesize_cid;
use cid_store::storage::DownloadedContent;
use cid_store::{ContentId, StorageClient, StorageConfig, StoreError};

#[derive(Parser)]
#[command(name = "cid-store")]
#[command(about = "Content-addressed envelope storage with offline fallback")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment FILEBASE_* overrides it)
    #[arg(long, env = "CID_STORE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit structured JSON logs
    #[arg(long, env = "CID_STORE_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a JSON payload wrapped in an envelope
    Upload {
        /// Envelope kind (e.g. measurement-record)
        #[arg(long)]
        kind: String,
        /// Metadata entry, repeatable
        #[arg(long = "meta", value_parser = parse_meta)]
        meta: Vec<(String, MetadataValue)>,
        /// Payload file, or "-" for stdin
        #[arg(default_value = "-")]
        file: String,
    },
    /// Download content by CID
    Download { cid: String },
    /// Check a CID against the identifier format
    Validate { cid: String },
    /// Print the fallback CID of raw bytes
    Fingerprint {
        #[arg(default_value = "-")]
        file: String,
    },
    /// Print the gateway URL of a CID
    Gateway { cid: String },
}

fn parse_meta(s: &str) -> std::result::Result<(String, MetadataValue), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    let value = match value {
        "true" => MetadataValue::Bool(true),
        "false" => MetadataValue::Bool(false),
        v => v
            .parse::<i64>()
            .map(MetadataValue::Int)
            .unwrap_or_else(|_| MetadataValue::Text(v.to_string())),
    };
    Ok((key.to_string(), value))
}

async fn read_input(file: &str) -> cid_store::Result<Vec<u8>> {
    if file == "-" {
        let mut data = Vec::new();
        tokio::io::stdin().read_to_end(&mut data).await?;
        Ok(data)
    } else {
        Ok(tokio::fs::read(file).await?)
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cid_store=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> cid_store::Result<ExitCode> {
    let config = StorageConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Upload { kind, meta, file } => {
            let data = read_input(&file).await?;
            let payload: serde_json::Value = serde_json::from_slice(&data)?;
            let metadata: Metadata = meta.into_iter().collect();

            let client = StorageClient::from_config(&config).await?;
            let result = client.upload(&payload, &kind, metadata).await?;
            client.persist_index().await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Download { cid } => {
            let client = StorageClient::from_config(&config).await?;
            let result = client.download(&cid).await?;
            eprintln!(
                "{} ({})",
                result.cid,
                if result.is_synthesized() { "synthesized" } else { "retrieved" }
            );
            match result.content {
                DownloadedContent::Envelope(envelope) => {
                    println!("{}", serde_json::to_string_pretty(&envelope)?)
                }
                DownloadedContent::Raw(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
            }
        }
        Commands::Validate { cid } => {
            if !cid_store::is_valid(&cid) {
                println!("invalid");
                return Ok(ExitCode::FAILURE);
            }
            println!("valid");
        }
        Commands::Fingerprint { file } => {
            let data = read_input(&file).await?;
            println!("{}", synthesize_cid(&data));
        }
        Commands::Gateway { cid } => {
            let cid = ContentId::parse(&cid)?;
            println!("{}{cid}", config.gateway_url);
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, kind = ?e.kind(), "Command failed");
            eprintln!("error: {e}");
            if matches!(e, StoreError::Validation(_)) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
