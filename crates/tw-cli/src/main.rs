use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tw_core::config::{AppConfig, DEFAULT_CONFIG_PATH};
use tw_notify::{diagnose, test_message};
use tw_pipeline::Pipeline;
use tw_store::NoticeStore;

#[derive(Debug, Parser)]
#[command(name = "tenderwatch")]
#[command(about = "Procurement notice search, dedup and mail digest")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search all keywords, persist new notices and send the digest.
    Run {
        /// Compose the digest but skip delivery.
        #[arg(long)]
        dry_run: bool,
    },
    /// Check the mail path stage by stage without sending a digest.
    SmtpTest {
        /// Also deliver a short test message through the real path.
        #[arg(long)]
        send: bool,
    },
    /// Database housekeeping: retention sweep, vacuum, statistics.
    Maintenance {
        /// Delete notices first persisted more than N days ago.
        #[arg(long, value_name = "DAYS")]
        delete_days: Option<i64>,
        /// Compact the database file after deletions.
        #[arg(long)]
        vacuum: bool,
        /// Print stored-notice statistics.
        #[arg(long)]
        stats: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Run { dry_run } => run(config, dry_run).await,
        Commands::SmtpTest { send } => smtp_test(config, send).await,
        Commands::Maintenance {
            delete_days,
            vacuum,
            stats,
        } => maintenance(config, delete_days, vacuum, stats).await,
    }
}

async fn run(config: AppConfig, dry_run: bool) -> Result<()> {
    let pipeline = Pipeline::bootstrap(config, dry_run).await?;
    let summary = pipeline.run_once().await?;

    for count in &summary.keyword_counts {
        println!(
            "keyword `{}`: {} parsed, {} new",
            count.keyword, count.parsed, count.newly_inserted
        );
    }
    println!(
        "run complete: run_id={} parsed={} new={} delivery={:?}",
        summary.run_id,
        summary.total_parsed,
        summary.new_records.len(),
        summary.delivery
    );
    Ok(())
}

async fn smtp_test(config: AppConfig, send: bool) -> Result<()> {
    let probe = send.then(|| test_message(&config.notification, &config.smtp));
    let report = diagnose(&config.smtp, probe.as_ref()).await;

    println!(
        "smtp diagnostic for {}:{} ({})",
        config.smtp.server, config.smtp.port, report.mode
    );
    for pass in &report.passed {
        println!("  ok   {} - {}", pass.stage, pass.detail);
    }
    match &report.failure {
        None => println!("all stages passed"),
        Some((stage, err)) => {
            println!("  fail {} - {}", stage, err);
            anyhow::bail!("smtp diagnostic failed at {stage}");
        }
    }
    Ok(())
}

async fn maintenance(
    config: AppConfig,
    delete_days: Option<i64>,
    vacuum: bool,
    stats: bool,
) -> Result<()> {
    let database_url = format!("sqlite:{}?mode=rwc", config.database.path);
    let store = NoticeStore::open(&database_url).await?;

    if let Some(days) = delete_days {
        anyhow::ensure!(days >= 0, "--delete-days must not be negative");
        let deleted = store.delete_older_than(days).await?;
        println!("deleted {deleted} notices older than {days} days");
    }
    if vacuum {
        store.vacuum().await?;
        println!("database vacuumed");
    }
    if stats || (delete_days.is_none() && !vacuum) {
        let statistics = store.statistics().await?;
        println!("total notices: {}", statistics.total);
        if let Some(bytes) = tw_store::database_file_size(&config.database.path) {
            println!("database file size: {bytes} bytes");
        }
        if let (Some(oldest), Some(newest)) =
            (&statistics.oldest_created_at, &statistics.newest_created_at)
        {
            println!("stored between {oldest} and {newest}");
        }
        println!("by keyword:");
        for (keyword, count) in &statistics.by_keyword {
            println!("  {keyword}: {count}");
        }
        println!("by category:");
        for (category, count) in &statistics.by_category {
            println!("  {category}: {count}");
        }
    }
    Ok(())
}
