use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use rolelens_core::*;
use rolelens_provider::{create_provider, ProviderType};
use rolelens_schema::{RoleSide, TaxonomyRegistry};
use rolelens_store::{FileStore, RecordStore};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(
    name = "rolelens",
    version,
    about = "Classify conversation corpora against a role taxonomy"
)]
struct Cli {
    #[arg(
        long,
        short = 'c',
        env = "ROLELENS_CONFIG",
        default_value = "config/rolelens.yaml",
        help = "Run configuration file"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Classify every conversation in a corpus file")]
    Classify {
        #[arg(help = "Corpus file (JSON array or JSON lines)")]
        corpus: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    #[command(about = "Validate the configuration, and optionally a corpus file")]
    Validate {
        #[arg(help = "Corpus file to parse as well")]
        corpus: Option<PathBuf>,
    },
    #[command(about = "List built-in taxonomies, or describe one version")]
    Taxonomy {
        #[arg(help = "Taxonomy version to describe")]
        version: Option<String>,
    },
    #[command(about = "Summarize classification coverage of the output directory")]
    Status {
        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },
    #[command(about = "Cross-check the manifest against files on disk")]
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProviderArg {
    Anthropic,
    Openai,
    Ollama,
    Custom,
}

impl From<ProviderArg> for ProviderType {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Anthropic => ProviderType::Anthropic,
            ProviderArg::Openai => ProviderType::OpenAI,
            ProviderArg::Ollama => ProviderType::Ollama,
            ProviderArg::Custom => ProviderType::Custom,
        }
    }
}

#[derive(clap::Args, Default)]
struct OverrideArgs {
    #[arg(long, help = "Model identifier")]
    model: Option<String>,
    #[arg(long, value_enum, help = "Inference provider")]
    provider: Option<ProviderArg>,
    #[arg(long, help = "Base URL for OpenAI-compatible endpoints")]
    base_url: Option<String>,
    #[arg(long, short = 'o', help = "Output directory")]
    output: Option<PathBuf>,
    #[arg(long, help = "Attempts per conversation, first one included")]
    max_retries: Option<u32>,
    #[arg(long, short = 'j', help = "Conversations classified in parallel")]
    concurrency: Option<usize>,
    #[arg(long, help = "Taxonomy version to classify against")]
    taxonomy: Option<String>,
    #[arg(long, help = "Few-shot examples file")]
    few_shot: Option<PathBuf>,
    #[arg(long, help = "Record group name inside the output directory")]
    group: Option<String>,
    #[arg(long, help = "Only send the trailing window of each conversation")]
    windowed: bool,
    #[arg(long, help = "Messages kept when windowed")]
    validation_turns: Option<usize>,
    #[arg(long, help = "Write one combined file per group")]
    combined: bool,
    #[arg(long, help = "Never replace an existing classification")]
    preserve_existing: bool,
    #[arg(long, help = "Re-classify even when results are current")]
    force: bool,
    #[arg(long, short = 'y', help = "Skip confirmation prompts")]
    yes: bool,
}

impl From<OverrideArgs> for ConfigOverrides {
    fn from(args: OverrideArgs) -> Self {
        Self {
            model: args.model,
            provider_type: args.provider.map(Into::into),
            base_url: args.base_url,
            output_directory: args.output,
            max_retries: args.max_retries,
            concurrency: args.concurrency,
            taxonomy_version: args.taxonomy,
            few_shot_path: args.few_shot,
            group: args.group,
            windowed: args.windowed.then_some(true),
            validation_turns: args.validation_turns,
            combined_output: args.combined,
            preserve_existing: args.preserve_existing,
            force: args.force,
            assume_yes: args.yes,
        }
    }
}

fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    let Some(log_dir) = log_dir else {
        registry.init();
        return Ok(None);
    };
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "rolelens.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    registry
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();
    Ok(Some(guard))
}

fn load(path: &Path, overrides: ConfigOverrides) -> Result<RunConfig> {
    let config = load_config(path)?;
    overrides.apply(config)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(ExitCode::SUCCESS);
    };

    match command {
        Commands::Classify { corpus, overrides } => {
            let config = load(&cli.config, overrides.into())?;
            let _guard = init_logging(Some(&config.logs_dir()))?;
            classify(&config, &corpus).await
        }
        Commands::Validate { corpus } => {
            let config = load(&cli.config, ConfigOverrides::default())?;
            let _guard = init_logging(None)?;
            validate(&config, corpus.as_deref())
        }
        Commands::Taxonomy { version } => {
            let _guard = init_logging(None)?;
            describe_taxonomy(version.as_deref())
        }
        Commands::Status { json } => {
            let config = load(&cli.config, ConfigOverrides::default())?;
            let _guard = init_logging(None)?;
            status(&config, json).await
        }
        Commands::Check => {
            let config = load(&cli.config, ConfigOverrides::default())?;
            let _guard = init_logging(None)?;
            check(&config).await
        }
    }
}

async fn open_store(config: &RunConfig) -> Result<FileStore> {
    FileStore::open(
        &config.output_directory,
        config.group.clone(),
        config.output_layout(),
    )
    .await
    .with_context(|| {
        format!(
            "failed to open output directory: {}",
            config.output_directory.display()
        )
    })
}

async fn classify(config: &RunConfig, corpus_path: &Path) -> Result<ExitCode> {
    require_model(config)?;
    let api_key = config.resolve_api_key()?;
    let client = create_provider(&config.provider_config(api_key))?;
    if let Err(err) = client.health().await {
        tracing::warn!("provider health check failed: {err}");
    }

    let corpus = load_corpus(corpus_path)?;
    let store: Arc<dyn RecordStore> = Arc::new(open_store(config).await?);
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::from_config(config, client, store)?.with_cancellation(cancel.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing in-flight requests");
            cancel.cancel();
        }
    });

    let (summary, abort) = match orchestrator.run(corpus).await {
        Ok(summary) => (summary, None),
        Err(RunError::Aborted { reason, summary }) => (*summary, Some(reason)),
        Err(err) => return Err(err.into()),
    };

    let report = write_run_report(&config.reports_dir(), &summary)?;
    println!(
        "{} total: {} classified, {} skipped, {} failed, {} cancelled",
        summary.total, summary.succeeded, summary.skipped, summary.failed, summary.cancelled
    );
    for failure in &summary.failures {
        println!(
            "  {} [{}] after {} attempt(s): {}",
            failure.id,
            failure.kind.as_str(),
            failure.attempts,
            failure.reason
        );
    }
    println!("Run report: {}", report.display());

    if let Some(reason) = abort {
        anyhow::bail!("run aborted: {reason}");
    }
    Ok(if summary.failed > 0 || summary.cancelled > 0 {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

fn write_run_report(dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create report directory: {}", dir.display()))?;
    let path = dir.join(report_file_name(summary));
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(&path, json + "\n")
        .with_context(|| format!("failed to write run report: {}", path.display()))?;
    tracing::info!(path = %path.display(), "wrote run report");
    Ok(path)
}

fn report_file_name(summary: &RunSummary) -> String {
    format!("run-{}.json", summary.started_at.format("%Y%m%dT%H%M%SZ"))
}

fn validate(config: &RunConfig, corpus: Option<&Path>) -> Result<ExitCode> {
    let registry = config.taxonomy_registry()?;
    let taxonomy = registry.active();
    let examples = match &config.few_shot_path {
        Some(path) => load_few_shot(path, taxonomy)?.len(),
        None => 0,
    };
    println!(
        "Config valid. provider {}, model {}, taxonomy {}, {} few-shot example(s).",
        config.provider.provider_type.as_str(),
        if config.model.is_empty() {
            "(unset)"
        } else {
            config.model.as_str()
        },
        taxonomy.version,
        examples
    );
    if let Some(path) = corpus {
        let conversations = load_corpus(path)?;
        println!("Corpus valid. {} conversation(s).", conversations.len());
    }
    Ok(ExitCode::SUCCESS)
}

fn describe_taxonomy(version: Option<&str>) -> Result<ExitCode> {
    let registry = TaxonomyRegistry::builtin();
    let Some(version) = version else {
        for v in registry.versions() {
            let marker = if v == registry.active_version() { " (default)" } else { "" };
            println!("{v}{marker}");
        }
        return Ok(ExitCode::SUCCESS);
    };
    let taxonomy = registry
        .get(version)
        .with_context(|| format!("unknown taxonomy version: {version}"))?;
    println!("Taxonomy {}", taxonomy.version);
    for dim in &taxonomy.dimensions {
        println!("\n{}: {}", dim.name, dim.description);
        println!("  {}", dim.categories.join(", "));
    }
    for side in [RoleSide::Human, RoleSide::Ai] {
        println!("\n{side} roles:");
        for role in taxonomy.roles(side) {
            println!("  {}: {}", role.label, role.description);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn status(config: &RunConfig, json: bool) -> Result<ExitCode> {
    let store = open_store(config).await?;
    let registry = config.taxonomy_registry()?;
    let provider = config.provider_config(None);
    let target = StatusTarget {
        provider: &provider.id,
        model: &config.model,
        window: config.prompt_options().windowing.turns(),
    };
    let report = collect_status(&store, &registry, target).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }
    println!(
        "{} record(s): {} classified ({} current, {} other settings, {} stale, {} unknown version), {} unclassified",
        report.total,
        report.classified,
        report.current,
        report.different_settings,
        report.stale,
        report.unknown_version,
        report.unclassified
    );
    for (version, count) in &report.by_version {
        println!("  {version}: {count}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn check(config: &RunConfig) -> Result<ExitCode> {
    let store = open_store(config).await?;
    let report = store.check().await?;
    println!("{} record(s) in manifest", report.records);
    for file in &report.orphaned_files {
        println!("  orphaned file: {file}");
    }
    for file in &report.missing_files {
        println!("  missing file: {file}");
    }
    for id in &report.missing_records {
        println!("  missing record: {id}");
    }
    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn classify_flags_become_overrides() {
        let cli = Cli::parse_from([
            "rolelens",
            "classify",
            "corpus.jsonl",
            "--provider",
            "ollama",
            "--model",
            "llama3",
            "-j",
            "4",
            "--windowed",
            "--force",
        ]);
        let Some(Commands::Classify { corpus, overrides }) = cli.command else {
            panic!("expected classify");
        };
        assert_eq!(corpus, PathBuf::from("corpus.jsonl"));
        let overrides = ConfigOverrides::from(overrides);
        assert_eq!(overrides.provider_type, Some(ProviderType::Ollama));
        assert_eq!(overrides.concurrency, Some(4));
        assert_eq!(overrides.windowed, Some(true));
        assert!(overrides.force);
        assert!(!overrides.preserve_existing);

        let config = overrides
            .apply(RunConfig::new(ProviderType::Anthropic, "claude"))
            .unwrap();
        assert_eq!(config.model, "llama3");
        assert_eq!(config.provider.api_key_env(), None);
    }

    #[test]
    fn run_report_lands_in_reports_dir() {
        let dir = tempfile::tempdir().unwrap();
        let summary = RunSummary {
            provider: "ollama".into(),
            model: "llama3".into(),
            taxonomy_version: "v".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            total: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            cancelled: 0,
            failures: Vec::new(),
            aborted: None,
        };
        let path = write_run_report(&dir.path().join("reports"), &summary).unwrap();
        assert!(path.starts_with(dir.path().join("reports")));
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["model"], "llama3");
    }
}
