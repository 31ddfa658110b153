use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobsift_core::{EmployerRef, SourceTag, TargetCompanyResolver};
use jobsift_pipeline::{load_target_companies, Pipeline, PipelineConfig, RunSummary};
use jobsift_sources::SourceOptions;
use jobsift_storage::{PgPool, StoredVacancy};
use serde_json::Value as JsonValue;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobsift")]
#[command(about = "Collects vacancies of target companies from HeadHunter and SuperJob")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, deduplicate, filter and store vacancies for a query.
    Aggregate {
        query: String,
        /// Source to query (hh, sj); repeatable. Defaults to every source.
        #[arg(long = "source")]
        sources: Vec<String>,
        /// Only vacancies published within this many days.
        #[arg(long)]
        period: Option<u32>,
        /// Extra source option as key=value; repeatable.
        #[arg(long = "opt", value_parser = parse_option)]
        options: Vec<(String, JsonValue)>,
        /// Serve sources from saved responses under this directory.
        #[arg(long)]
        fixtures: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Migrate,
    SeedCompanies,
    /// Seeded companies with their stored vacancy counts.
    Companies,
    Vacancies {
        #[arg(long)]
        json: bool,
    },
    Stats,
    Search {
        keyword: String,
    },
    /// Show which target company an employer resolves to.
    Resolve {
        employer: String,
        #[arg(long, default_value = "hh")]
        source: String,
        /// Employer id on the source.
        #[arg(long)]
        id: Option<String>,
    },
}

/// `key=value`; the value is read as JSON when it parses, otherwise as a string.
fn parse_option(raw: &str) -> Result<(String, JsonValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty option name in `{raw}`"));
    }
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| JsonValue::String(value.trim().to_string()));
    Ok((key.to_string(), value))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_pool(config: &PipelineConfig) -> Result<PgPool> {
    jobsift_storage::connect(&config.database_url, config.db_max_connections)
        .await
        .with_context(|| "connecting to database (check DATABASE_URL)")
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run {}: fetched={} unique={} new_target={} added={} skipped={}",
        summary.run_id,
        summary.fetched,
        summary.unique,
        summary.new_target,
        summary.added,
        summary.skipped
    );
    for report in &summary.sources {
        match &report.error {
            Some(err) => println!("  {}: failed: {err}", report.source.display_name()),
            None => println!(
                "  {}: fetched={} normalized={} dropped={}",
                report.source.display_name(),
                report.fetched,
                report.normalized,
                report.dropped
            ),
        }
    }
    for message in &summary.messages {
        println!("  {message}");
    }
}

fn print_vacancy(v: &StoredVacancy) {
    let salary = match (v.salary_from, v.salary_to) {
        (Some(from), Some(to)) => format!("{from}-{to}"),
        (Some(from), None) => format!("from {from}"),
        (None, Some(to)) => format!("up to {to}"),
        (None, None) => "n/a".to_string(),
    };
    let currency = v.salary_currency.as_deref().unwrap_or("");
    let company = v.company_name.as_deref().unwrap_or("-");
    println!("{company} | {} | {salary} {currency} | {}", v.title, v.url);
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();

    match cli.command {
        Commands::Aggregate {
            query,
            sources,
            period,
            options,
            fixtures,
            json,
        } => {
            if query.trim().is_empty() {
                bail!("query must not be empty");
            }
            if fixtures.is_some() {
                config.fixtures_dir = fixtures;
            }
            let mut source_options: SourceOptions = options.into_iter().collect();
            if let Some(days) = period {
                source_options.insert("period".to_string(), JsonValue::from(days));
            }

            let companies = Arc::new(load_target_companies(&config.target_companies_path)?);
            let pipeline = Pipeline::connect(&config, companies).await?;
            let summary = pipeline.run(&query, sources.as_slice(), &source_options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Commands::Migrate => {
            let pool = open_pool(&config).await?;
            jobsift_storage::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::SeedCompanies => {
            let companies = load_target_companies(&config.target_companies_path)?;
            let pool = open_pool(&config).await?;
            jobsift_storage::migrate(&pool).await?;
            let added = jobsift_storage::seed_companies(&pool, &companies).await?;
            println!("seeded {added} of {} target companies", companies.len());
        }
        Commands::Companies => {
            let pool = open_pool(&config).await?;
            for row in jobsift_storage::companies_and_vacancies_count(&pool).await? {
                println!("{:>6}  {}", row.vacancy_count, row.company_name);
            }
        }
        Commands::Vacancies { json } => {
            let pool = open_pool(&config).await?;
            let vacancies = jobsift_storage::all_vacancies(&pool).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&vacancies)?);
            } else {
                vacancies.iter().for_each(print_vacancy);
            }
        }
        Commands::Stats => {
            let pool = open_pool(&config).await?;
            let stats = jobsift_storage::database_stats(&pool).await?;
            println!("vacancies:               {}", stats.total_vacancies);
            println!("companies with vacancies: {}", stats.companies_with_vacancies);
            println!("vacancies with salary:   {}", stats.vacancies_with_salary);
            if let Some(latest) = stats.latest_published_at {
                println!("latest publication:      {latest}");
            }
            match jobsift_storage::avg_salary(&pool).await? {
                Some(avg) => {
                    println!("average salary (RUR):    {avg:.0}");
                    let above = jobsift_storage::vacancies_with_higher_salary(&pool).await?;
                    println!("above average:           {}", above.len());
                    above.iter().take(10).for_each(print_vacancy);
                }
                None => println!("average salary (RUR):    n/a"),
            }
        }
        Commands::Search { keyword } => {
            let pool = open_pool(&config).await?;
            let hits = jobsift_storage::vacancies_with_keyword(&pool, &keyword).await?;
            if hits.is_empty() {
                println!("no vacancies match `{keyword}`");
            }
            hits.iter().for_each(print_vacancy);
        }
        Commands::Resolve {
            employer,
            source,
            id,
        } => {
            let source = SourceTag::parse(&source)
                .with_context(|| format!("unknown source `{source}`"))?;
            let companies = Arc::new(load_target_companies(&config.target_companies_path)?);
            let resolver = TargetCompanyResolver::new(companies);
            let employer = EmployerRef {
                source_id: id.as_deref(),
                name: &employer,
            };
            match resolver.resolve(employer, source) {
                Some(company) => println!("{company}"),
                None => println!("not a target company"),
            }
        }
    }

    Ok(())
}
