use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use s3sample::Config;
use s3sample::demo::{self, DemoOptions, Walkthrough};
use s3sample::interrupt::{self, Supervised};
use s3sample::s3::transfer::DEFAULT_TRANSFER_CONCURRENCY;
use s3sample::s3::{
    FileSource, MemoryStore, MultipartConfig, ObjectStore, Orchestrator, ProgressCallback,
    S3Client, TransferConfig, TransferManager, TransferProgress, TransferStrategy, UploadError,
    helpers::detect_content_type,
};

const LOCAL_BUCKET: &str = "s3sample-local";

#[derive(Parser, Debug)]
#[command(
    name = "s3sample",
    version = env!("CARGO_PKG_VERSION"),
    about = "Walk through the basic S3 operations and upload large files in parts",
    long_about = "Creates a bucket, puts, gets and lists objects, uploads a large file with a multipart upload \
                  and with a managed transfer, then cleans up. Works with AWS S3 and S3-compatible services. \
                  Configure via .env file or environment variables.",
    after_help = "Examples:\n  \
                  s3sample demo ./big.zip                        # Full walkthrough\n  \
                  s3sample --local demo ./big.zip --json         # Walkthrough against an in-memory store\n  \
                  s3sample upload ./big.zip --part-size 10000000 # Multipart upload\n  \
                  s3sample transfer ./big.zip                    # Let the size pick the strategy\n  \
                  s3sample list --prefix My                      # List objects\n\n\
                  Configuration (.env):\n  \
                  AWS_REGION=us-east-1\n  \
                  S3_BUCKET=my-bucket\n  \
                  S3_ENDPOINT=http://localhost:8080\n  \
                  S3_ACCESS_KEY=...\n  \
                  S3_SECRET_KEY=..."
)]
struct Cli {
    /// Bucket to use (overrides S3_BUCKET)
    #[arg(long, global = true)]
    bucket: Option<String>,

    /// S3-compatible endpoint URL (overrides S3_ENDPOINT)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Use an in-memory store instead of a real service
    #[arg(long, global = true)]
    local: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full walkthrough with FILE as the large upload
    Demo {
        file: PathBuf,

        /// Keep the objects and the bucket
        #[arg(long)]
        keep: bool,

        /// Print the report as JSON instead of the step log
        #[arg(long)]
        json: bool,
    },

    /// Upload FILE with a multipart upload
    Upload {
        file: PathBuf,

        /// Object key (defaults to the file name)
        #[arg(long, short = 'k')]
        key: Option<String>,

        /// Part size in bytes (overrides S3_PART_SIZE)
        #[arg(long)]
        part_size: Option<u64>,

        /// Parts in flight at once (overrides S3_CONCURRENCY)
        #[arg(long, short = 'c')]
        concurrency: Option<usize>,

        /// Check each part ETag against the MD5 of its bytes
        #[arg(long)]
        verify_etag: bool,
    },

    /// Upload FILE, picking a single put or multipart by size
    Transfer {
        file: PathBuf,

        /// Object key (defaults to the file name)
        #[arg(long, short = 'k')]
        key: Option<String>,

        /// Parts in flight at once
        #[arg(long, short = 'c', default_value_t = DEFAULT_TRANSFER_CONCURRENCY)]
        concurrency: usize,
    },

    /// List objects in the bucket
    List {
        #[arg(long, short = 'p')]
        prefix: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file early to get LOG_LEVEL
    dotenv::dotenv().ok();

    // Initialize tracing/logging with support for LOG_LEVEL from .env
    let log_level = std::env::var("LOG_LEVEL")
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    info!("S3 Sample v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let outcome = interrupt::supervise(
        run(cli, cancel.clone()),
        || async {
            // without a signal handler only the work itself can finish
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        },
        cancel,
        interrupt::DEFAULT_GRACE,
    )
    .await;

    match outcome {
        Supervised::Completed(Ok(())) => Ok(()),
        Supervised::Completed(Err(err)) => {
            report_error(&err);
            std::process::exit(1);
        }
        Supervised::Cancelled(result) => {
            if let Some(Err(err)) = result {
                report_error(&err);
            }
            eprintln!("{} Interrupted", style("✗").red().bold());
            std::process::exit(130);
        }
    }
}

fn report_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", style("✗").red().bold(), err);
    if let Some(detail) = demo::explain(err) {
        eprintln!("{}", detail);
    } else if let Some(upload_err) = err.downcast_ref::<UploadError>() {
        eprintln!("\n{}", upload_err.user_message());
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let config = Config::from_env_with(|name| match name {
        "S3_BUCKET" => cli
            .bucket
            .clone()
            .or_else(|| local_bucket_fallback(cli.local)),
        "S3_ENDPOINT" => cli.endpoint.clone(),
        _ => None,
    })?;

    let store: Arc<dyn ObjectStore> = if cli.local {
        info!("Using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(S3Client::new(config.clone()).await?)
    };

    // the in-memory store starts empty
    if cli.local && !matches!(cli.command, Command::Demo { .. }) {
        store.create_bucket(&config.bucket).await?;
    }

    match cli.command {
        Command::Demo { file, keep, json } => {
            let options = DemoOptions {
                keep,
                quiet: json,
                multipart: MultipartConfig::new(config.part_size, config.concurrency)?,
                transfer: TransferConfig::default(),
            };
            let report = Walkthrough::new(store, config.bucket.clone(), options)
                .with_cancellation(cancel)
                .run(&file)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        Command::Upload {
            file,
            key,
            part_size,
            concurrency,
            verify_etag,
        } => {
            let key = object_key(&file, key)?;
            let multipart = MultipartConfig::builder()
                .part_size(part_size.unwrap_or(config.part_size))
                .concurrency(concurrency.unwrap_or(config.concurrency))
                .verify_etag(verify_etag)
                .build()?;
            let source = FileSource::open(&file)
                .await
                .map_err(|source| UploadError::Source {
                    path: file.display().to_string(),
                    source,
                })?;

            let pb = progress_bar(&key)?;
            let result = Orchestrator::new(store.as_ref(), multipart)
                .with_progress(progress_callback(&pb))
                .with_cancellation(cancel)
                .upload(
                    &config.bucket,
                    &key,
                    &source,
                    Some(detect_content_type(&file)),
                )
                .await;

            let report = match result {
                Ok(report) => {
                    pb.finish_with_message(format!("Uploaded {}", key));
                    report
                }
                Err(err) => {
                    pb.abandon_with_message(format!("Failed {}", key));
                    return Err(err.into());
                }
            };

            for part in &report.part_results {
                println!("  part {:>5}  ETag {}", part.part_number, part.e_tag);
            }
            println!(
                "{} s3://{}/{} ({} bytes, {} parts of {} bytes, ETag {})",
                style("✓").green(),
                config.bucket,
                key,
                report.bytes,
                report.parts,
                report.part_size,
                report.identity.e_tag.as_deref().unwrap_or("-")
            );
        }
        Command::Transfer {
            file,
            key,
            concurrency,
        } => {
            let key = object_key(&file, key)?;
            let pb = progress_bar(&key)?;
            let result = TransferManager::new(
                store,
                TransferConfig {
                    concurrency,
                    ..TransferConfig::default()
                },
            )
            .with_progress(progress_callback(&pb))
            .with_cancellation(cancel)
            .upload_file(&config.bucket, &key, &file)
            .await;

            let outcome = match result {
                Ok(outcome) => {
                    pb.finish_with_message(format!("Uploaded {}", key));
                    outcome
                }
                Err(err) => {
                    pb.abandon_with_message(format!("Failed {}", key));
                    return Err(err.into());
                }
            };

            let strategy = match &outcome.strategy {
                TransferStrategy::SinglePut => "single put".to_string(),
                TransferStrategy::Multipart {
                    parts, part_size, ..
                } => format!("multipart, {} parts of {} bytes", parts, part_size),
            };
            println!(
                "{} s3://{}/{} ({} bytes, {})",
                style("✓").green(),
                config.bucket,
                key,
                outcome.bytes,
                strategy
            );
        }
        Command::List { prefix } => {
            let objects = store
                .list_objects(&config.bucket, prefix.as_deref())
                .await
                .with_context(|| format!("Failed to list s3://{}", config.bucket))?;

            for object in &objects {
                println!("{:>12}  {}", object.size, object.key);
            }
            println!(
                "{}",
                style(format!("{} object(s) in s3://{}", objects.len(), config.bucket)).dim()
            );
        }
    }

    Ok(())
}

fn local_bucket_fallback(local: bool) -> Option<String> {
    (local && std::env::var("S3_BUCKET").is_err()).then(|| LOCAL_BUCKET.to_string())
}

fn object_key(file: &Path, key: Option<String>) -> Result<String> {
    match key {
        Some(key) => Ok(key),
        None => file
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .with_context(|| format!("Cannot derive an object key from {}", file.display())),
    }
}

fn progress_bar(key: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message(format!("Uploading {}", key));
    Ok(pb)
}

fn progress_callback(pb: &ProgressBar) -> ProgressCallback {
    let pb = pb.clone();
    Arc::new(move |progress: &TransferProgress| {
        pb.set_length(progress.total_bytes);
        pb.set_position(progress.bytes_transferred);
    })
}
