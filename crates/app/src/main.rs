use chrono::Utc;
use clap::{Parser, Subcommand};
use simdex_core::{build_embedder, run_index_update, run_query, Config, IndexContext, IndexReport};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "simdex", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true, env = "SIMDEX_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the configured directories and bring the index up to date.
    Index {
        /// Delete both stores and rebuild from scratch.
        #[arg(long, default_value_t = false)]
        clean: bool,
    },
    /// Print the files most similar to TEXT.
    Query {
        text: String,
        /// Overrides `query.top_k` from the configuration.
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Print the effective configuration with secrets masked.
    Config,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_report(report: &IndexReport) {
    for path in &report.updated_files {
        println!("updated  {path}");
    }
    for path in &report.removed_files {
        println!("removed  {path}");
    }
    for skipped in &report.skipped {
        println!(
            "skipped  {} ({:?}: {})",
            skipped.path.display(),
            skipped.reason,
            skipped.details
        );
    }

    println!(
        "{} scanned, {} updated, {} unchanged, {} removed, {} skipped in {:.2}s at {}",
        report.scanned,
        report.updated_files.len(),
        report.unchanged,
        report.removed_files.len(),
        report.skipped.len(),
        report.elapsed.as_secs_f64(),
        report.completed_at.to_rfc3339()
    );
    if report.interrupted {
        println!("interrupted: files not yet processed are left for the next run");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");
    let cli = Cli::parse();

    let mut config = Config::read(cli.config.as_deref())?;
    init_tracing(&config);
    if cli.config.is_none() {
        info!("no configuration specified, using defaults");
    }

    // Printing the config needs no credentials.
    match cli.command {
        Command::Config => config.validate_settings()?,
        _ => config.validate()?,
    }

    info!(
        version = app_version,
        provider = config.settings.ai_provider.as_str(),
        started_at = %Utc::now().to_rfc3339(),
        "simdex boot"
    );

    match cli.command {
        Command::Index { clean } => {
            let ctx = IndexContext::new(build_embedder(&config)?);

            let cancel = ctx.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing the current file");
                    cancel.store(true, Ordering::SeqCst);
                }
            });

            let report = run_index_update(&config, &ctx, clean).await?;
            print_report(&report);
        }
        Command::Query { text, top_k } => {
            if let Some(top_k) = top_k {
                anyhow::ensure!(top_k > 0, "--top-k must be greater than zero");
                config.query.top_k = top_k;
            }

            let embedder = build_embedder(&config)?;
            let results = run_query(&text, &config, embedder.as_ref()).await?;

            if results.is_empty() {
                println!("no similar files found");
            }
            for (rank, path) in results.iter().enumerate() {
                println!("{:>3}. {path}", rank + 1);
            }
        }
        Command::Config => {
            print!("{}", config.redacted()?);
        }
    }

    Ok(())
}
