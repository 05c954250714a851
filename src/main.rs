use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand};
use tracing::{info, info_span, Instrument};
use tracing_subscriber::EnvFilter;

use expansivo_reconcile::config::Config;
use expansivo_reconcile::db::PgStore;
use expansivo_reconcile::encoding::LegacyEncoding;
use expansivo_reconcile::parser::{self, DumpFormat, ParseOptions};
use expansivo_reconcile::pipeline::{self, RunRequest};
use expansivo_reconcile::report;
use expansivo_reconcile::store::DocumentStore;

#[derive(Parser)]
#[command(name = "expansivo-reconcile")]
#[command(about = "Reconcile legacy student dumps into the school document store", long_about = None)]
struct Cli {
    /// Optional TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the document store schema
    InitDb,
    /// Parse a legacy dump and print what was found
    Parse {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "auto")]
        format: DumpFormat,
        /// Drop rows without a value in this column (repeatable)
        #[arg(long)]
        key: Vec<String>,
        #[arg(long)]
        encoding: Option<LegacyEncoding>,
    },
    /// Diff legacy dumps against stored students and optionally commit
    #[command(group(
        ArgGroup::new("mode")
            .args(["dry_run", "apply"])
            .required(true)
            .multiple(false)
    ))]
    Reconcile {
        #[arg(long)]
        unit: String,
        #[arg(long)]
        students_file: PathBuf,
        #[arg(long)]
        enrollments_file: Option<PathBuf>,
        /// Compute and print the plan without writing
        #[arg(long)]
        dry_run: bool,
        /// Commit the plan
        #[arg(long)]
        apply: bool,
        #[arg(long, default_value = "auto")]
        format: DumpFormat,
        #[arg(long)]
        encoding: Option<LegacyEncoding>,
        /// Abort when decoded text looks garbled
        #[arg(long)]
        strict_encoding: bool,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        current_year: Option<i32>,
        #[arg(long)]
        matrix_file: Option<PathBuf>,
        /// Also write the plan report to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Remove a stale run lock left by an aborted run
    Unlock {
        #[arg(long)]
        unit: String,
    },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().with_current_span(true).init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::InitDb => {
            let store = PgStore::connect(config.require_database_url()?)
                .await
                .context("failed to connect to Postgres")?;
            store.init_db().await?;
            println!("Schema ready.");
        }
        Commands::Parse {
            file,
            format,
            key,
            encoding,
        } => {
            let options = ParseOptions {
                format,
                encoding: encoding.unwrap_or(config.encoding),
                strict_encoding: false,
                key_columns: key.iter().map(|k| k.trim().to_uppercase()).collect(),
            };
            let parsed = parser::parse_file(&file, &options)
                .with_context(|| format!("failed to parse {}", file.display()))?;
            println!(
                "{}: {} rows, {} skipped, encoding {}",
                file.display(),
                parsed.rows.len(),
                parsed.skipped.len(),
                parsed.encoding.unwrap_or("unknown")
            );
            println!(
                "Columns: {}",
                parsed.columns.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            for skip in &parsed.skipped {
                println!("- line {}: {}", skip.line, skip.reason);
            }
        }
        Commands::Reconcile {
            unit,
            students_file,
            enrollments_file,
            dry_run: _,
            apply,
            format,
            encoding,
            strict_encoding,
            chunk_size,
            current_year,
            matrix_file,
            report: report_path,
        } => {
            if let Some(v) = encoding {
                config.encoding = v;
            }
            if let Some(v) = chunk_size {
                config.chunk_size = v;
            }
            if let Some(v) = current_year {
                config.current_year = v;
            }
            if matrix_file.is_some() {
                config.matrix_file = matrix_file;
            }
            config.validate()?;

            let request = RunRequest {
                unit: unit.clone(),
                students_file,
                enrollments_file,
                format,
                strict_encoding,
            };
            let inputs = pipeline::parse_inputs(&config, &request)?;

            let store = PgStore::connect(config.require_database_url()?)
                .await
                .context("failed to connect to Postgres")?;
            let outcome = pipeline::execute(&store, &config, &unit, &inputs, apply)
                .instrument(info_span!("reconcile", unit = %unit, apply))
                .await?;

            let mut sources = vec![("students", &inputs.students)];
            if let Some(e) = inputs.enrollments.as_ref() {
                sources.push(("enrollments", e));
            }
            let mut text = report::build_plan_report(&outcome.plan, &sources);
            if let Some(summary) = outcome.write.as_ref() {
                text.push('\n');
                text.push_str(&report::build_write_report(summary));
            }
            print!("{text}");
            if let Some(path) = report_path {
                std::fs::write(&path, &text)?;
                info!(path = %path.display(), "report written");
            }

            if let Some(summary) = outcome.write {
                summary
                    .into_result()
                    .context("reconciliation stopped before all chunks were committed; re-run to resume")?;
            }
        }
        Commands::Unlock { unit } => {
            let store = PgStore::connect(config.require_database_url()?)
                .await
                .context("failed to connect to Postgres")?;
            let key = pipeline::lock_key(&unit);
            if store.force_unlock(&key).await? {
                println!("Released {key}.");
            } else {
                println!("No lock held for {key}.");
            }
        }
    }

    Ok(())
}
