use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use query_insights::advisor::DEFAULT_CONTEXT;
use query_insights::{
    load_rows, score_quoting, triage, validate_batch, AdvisorCache, InsightError, InsightsConfig,
    IssueKind, IssueSummary, LocalAdvisor, SqlDialect,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qinsight")]
#[command(about = "Diagnose query statistics and check generated SQL.")]
struct Cli {
    /// TOML settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQL dialect used for parsing (overrides the settings file)
    #[arg(long, global = true, value_enum)]
    dialect: Option<DialectArg>,

    /// Log cache and advisor activity to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum DialectArg {
    Postgres,
    Generic,
}

impl From<DialectArg> for SqlDialect {
    fn from(value: DialectArg) -> Self {
        match value {
            DialectArg::Postgres => SqlDialect::Postgres,
            DialectArg::Generic => SqlDialect::Generic,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Triage a JSON array of query statistics rows
    Classify {
        path: PathBuf,
        /// Run the local index advisor over eligible queries first
        #[arg(long)]
        advisor: bool,
        /// Cache scope for advisor results, usually a connection identifier
        #[arg(long, default_value = DEFAULT_CONTEXT)]
        context: String,
    },
    /// Report the share of statements in a file (one per line) that parse
    Validate { path: PathBuf },
    /// Check that identifiers needing double quotes are quoted
    VerifyQuoting { sql: String },
    /// Suggest indexes based on WHERE/JOIN columns
    Suggest { query: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(2);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match cli.config.as_deref() {
        Some(path) => InsightsConfig::load(path)?,
        None => InsightsConfig::default(),
    };
    if let Some(dialect) = cli.dialect {
        config.dialect = dialect.into();
    }

    match cli.command {
        Command::Classify {
            path,
            advisor,
            context,
        } => classify(&config, &path, advisor, &context).await?,
        Command::Validate { path } => validate(&config, &path)?,
        Command::VerifyQuoting { sql } => match score_quoting(&sql, config.dialect) {
            Ok(report) => {
                for finding in &report.findings {
                    println!(
                        "FINDING identifier={} requires_quoting={} is_quoted={}",
                        finding.identifier, finding.requires_quoting, finding.is_quoted
                    );
                }
                println!("SCORE={:.2}", report.score);
            }
            Err(InsightError::Parse(message)) => println!("INVALID: {message}"),
            Err(err) => return Err(err.into()),
        },
        Command::Suggest { query } => {
            let suggestions = query_insights::suggest_indexes(&query, config.dialect)?;
            if suggestions.is_empty() {
                println!("OK: No index suggestions.");
            } else {
                for suggestion in suggestions {
                    println!("SUGGESTION: {}", suggestion.statement);
                }
            }
        }
    }

    Ok(())
}

async fn classify(
    config: &InsightsConfig,
    path: &Path,
    advisor: bool,
    context: &str,
) -> anyhow::Result<()> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read statistics file {}", path.display()))?;
    let rows = load_rows(&contents)?;

    let cache = AdvisorCache::new(config.advisor.cache_config());
    let fetcher = LocalAdvisor::new(config.dialect);
    let rows = cache
        .enrich(context, rows, advisor && config.advisor.enabled, &fetcher)
        .await;

    let insights = triage(rows, &config.classifier());
    for insight in &insights {
        let kind = insight.classification.kind;
        let query = single_line(&insight.row.query);
        if kind == IssueKind::None {
            println!("{kind}: QUERY={query}");
        } else {
            println!("{kind}: {} QUERY={query}", insight.classification.hint);
        }
        if kind == IssueKind::MissingIndex {
            if let Some(result) = insight.row.advisor_result.as_ref() {
                for statement in &result.index_statements {
                    println!("  INDEX: {statement}");
                }
            }
        }
    }

    let summary = IssueSummary::from_insights(&insights);
    println!(
        "SUMMARY: errors={} missing_indexes={} slow={} healthy={}",
        summary.errors, summary.missing_indexes, summary.slow, summary.healthy
    );
    Ok(())
}

fn validate(config: &InsightsConfig, path: &Path) -> anyhow::Result<()> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read statements file {}", path.display()))?;
    let statements = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("--"))
        .collect::<Vec<_>>();

    match validate_batch(&statements, |sql| {
        query_insights::parse_statements(sql, config.dialect)
    }) {
        Some(report) => {
            println!("VALID_RATIO={:.2}", report.valid_ratio);
            for error in report.errors {
                println!("ERROR: {error}");
            }
        }
        None => println!("N/A: empty batch"),
    }
    Ok(())
}

fn single_line(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}
