//! acctmig — account migration CLI
//!
//! # Usage
//!
//! ```bash
//! # Migrate two accounts from prod to test
//! acctmig migrate --account 3003 --account 4004 --user jdoe --source prod --target test
//!
//! # Generate the scripts only
//! acctmig migrate --request request.json --dry-run
//!
//! # Show what the catalog will select
//! acctmig catalog check.sql
//! ```

use acctmig::prelude::*;
use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "acctmig")]
#[command(version)]
#[command(about = "Migrate account data between databases", long_about = None)]
#[command(after_help = "EXAMPLES:
    acctmig migrate --account 3003 --user jdoe --source prod --target test
    acctmig migrate --request request.json --dry-run --format json
    acctmig catalog check.sql")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "ACCTMIG_CONFIG")]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate accounts from the source to the target connection
    Migrate(MigrateArgs),
    /// List the templates of a catalog
    Catalog {
        /// Catalog file (defaults to the configured one)
        path: Option<PathBuf>,
    },
}

#[derive(Args)]
struct MigrateArgs {
    /// Account id to migrate (repeatable)
    #[arg(short, long = "account", value_delimiter = ',')]
    accounts: Vec<String>,

    /// Operator id written into audit columns
    #[arg(short, long)]
    user: Option<String>,

    /// Source connection name
    #[arg(short, long)]
    source: Option<String>,

    /// Target connection name
    #[arg(short, long)]
    target: Option<String>,

    /// JSON request file; flags given on the command line take precedence
    #[arg(short, long)]
    request: Option<PathBuf>,

    /// Catalog file (overrides the configured one)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Directory for scripts and reports (overrides the configured one)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Generate and store statements without executing them
    #[arg(long)]
    dry_run: bool,

    /// Roll back an account's inserts if any of them fails
    #[arg(long)]
    all_or_nothing: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_file.as_deref()) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }

    let result = match &cli.command {
        Commands::Migrate(args) => run_migrate(&cli, args).await,
        Commands::Catalog { path } => show_catalog(&cli, path.as_deref()),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

/// Returns whether the report came back successful.
async fn run_migrate(cli: &Cli, args: &MigrateArgs) -> anyhow::Result<bool> {
    let config = Config::load_or_default(cli.config.as_deref())?;
    let request = build_request(args)?;

    let catalog_path = args
        .catalog
        .clone()
        .or_else(|| config.migration.catalog.clone())
        .context("no catalog given; pass --catalog or set migration.catalog")?;
    let catalog = Catalog::load(&catalog_path)?;

    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| config.migration.output_dir.clone());

    let mut options = MigrationOptions::from(&config.migration);
    options.dry_run = args.dry_run;
    if args.all_or_nothing {
        options.commit_policy = CommitPolicy::AllOrNothing;
    }

    let migrator = Migrator::new(catalog, options, Box::new(FileAuditSink::new(&output_dir)))?;
    let resolver = SqlxResolver::new(config);

    let report = migrator.run(&resolver, &request).await?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print_report(&report),
    }

    Ok(report.is_success())
}

fn build_request(args: &MigrateArgs) -> anyhow::Result<MigrationRequest> {
    let mut request = match &args.request {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read request {}", path.display()))?;
            serde_json::from_str::<MigrationRequest>(&content)
                .with_context(|| format!("invalid request {}", path.display()))?
        }
        None => MigrationRequest::new(Vec::<String>::new(), "", "", ""),
    };

    if !args.accounts.is_empty() {
        request.account_ids = args.accounts.clone();
    }
    if let Some(user) = &args.user {
        request.user_id = user.clone();
    }
    if let Some(source) = &args.source {
        request.source_connection_name = source.clone();
    }
    if let Some(target) = &args.target {
        request.target_connection_name = target.clone();
    }

    if request.account_ids.is_empty() {
        bail!("no account ids given; pass --account or --request");
    }
    for (value, flag) in [
        (&request.user_id, "--user"),
        (&request.source_connection_name, "--source"),
        (&request.target_connection_name, "--target"),
    ] {
        if value.trim().is_empty() {
            bail!("missing {}", flag);
        }
    }
    Ok(request)
}

fn print_report(report: &MigrationReport) {
    if report.accounts.is_empty() {
        println!("{}", "(no accounts)".dimmed());
        return;
    }

    let headers = ["Account", "Status", "Inserts", "Deletes", "Message"];
    let rows: Vec<[String; 5]> = report
        .accounts
        .iter()
        .map(|a| {
            [
                a.account_id.clone(),
                a.status.to_string(),
                a.insert_count.to_string(),
                a.delete_count.to_string(),
                a.message.clone(),
            ]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }

    let header: Vec<String> = headers
        .iter()
        .zip(widths)
        .map(|(h, w)| format!("{:width$}", h, width = w))
        .collect();
    println!("{}", header.join(" │ ").white().bold());

    let sep: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
    println!("{}", sep.join("─┼─").dimmed());

    for (account, row) in report.accounts.iter().zip(&rows) {
        let cells: Vec<String> = row
            .iter()
            .zip(widths)
            .enumerate()
            .map(|(i, (cell, w))| {
                let padded = format!("{:width$}", cell, width = w);
                if i == 1 {
                    colorize_status(account.status, &padded)
                } else {
                    padded
                }
            })
            .collect();
        println!("{}", cells.join(" │ "));
    }

    for account in &report.accounts {
        for failure in &account.failures {
            println!(
                "  {} {} {}{}",
                account.account_id.yellow(),
                format!("[{}]", failure.kind).red(),
                failure
                    .table
                    .as_deref()
                    .map(|t| format!("{}: ", t))
                    .unwrap_or_default(),
                failure.message
            );
        }
    }

    println!();
    let status = match report.status {
        ReportStatus::Success => report.status.to_string().green().bold(),
        ReportStatus::Error => report.status.to_string().red().bold(),
    };
    println!(
        "{} {} account(s), {} execution error(s){}",
        status,
        report.accounts.len().to_string().cyan(),
        report.execution_errors.len().to_string().cyan(),
        if report.dry_run { " (dry run)".dimmed().to_string() } else { String::new() }
    );
    if let Some(path) = &report.report_path {
        println!("{} {}", "Report:".dimmed(), path.display());
    }
}

fn colorize_status(status: AccountStatus, text: &str) -> String {
    match status {
        AccountStatus::Success => text.green().to_string(),
        AccountStatus::SkippedAlreadyPresent | AccountStatus::PartialError => {
            text.yellow().to_string()
        }
        AccountStatus::SkippedNotFound | AccountStatus::Failed => text.red().to_string(),
    }
}

fn show_catalog(cli: &Cli, path: Option<&Path>) -> anyhow::Result<bool> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::load_or_default(cli.config.as_deref())?
            .migration
            .catalog
            .context("no catalog given and migration.catalog is not set")?,
    };
    let catalog = Catalog::load(&path)?;

    println!("{} {}", "Catalog:".cyan().bold(), path.display());
    println!();
    for (i, template) in catalog.templates().iter().enumerate() {
        let key = match &template.key {
            DeleteKey::Prefix(n) => format!("first {} columns", n),
            DeleteKey::Columns(cols) => cols.join(", "),
        };
        println!(
            "{:>3}. {} {}",
            i + 1,
            template.table_name.white().bold(),
            format!("(key: {})", key).dimmed()
        );
        println!("     {}", template.sql.yellow());
    }
    println!();
    println!("{} template(s)", catalog.len().to_string().cyan());
    Ok(true)
}
