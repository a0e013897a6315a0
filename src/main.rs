//! Model Bench CLI
//!
//! Runs a dataset against every backend in a model registry and writes
//! per-model results plus a cross-model report.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use model_bench::report::{CHART_FILE, JSON_FILE, MARKDOWN_FILE};
use model_bench::{
    combine_aggregates, load_models_config, BenchmarkConfig, BenchmarkRunner, Dataset, Judge,
    ReportBuilder, SchemaRegistry, ScoringEngines,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "model-bench")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dataset against every model in the registry
    Run(RunArgs),

    /// Combine per-model aggregate tables into one CSV
    Compare {
        /// Directory holding aggregate/<model>.csv files
        #[arg(long, default_value = "reports/aggregate")]
        reports: PathBuf,

        /// Combined output file
        #[arg(long, default_value = "reports/combined.csv")]
        out: PathBuf,
    },

    /// Show dataset statistics
    DatasetStats {
        /// Dataset file (.json or .jsonl)
        #[arg(long)]
        dataset: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Model registry (YAML or JSON)
    #[arg(long)]
    models: PathBuf,

    /// Dataset file (.json or .jsonl)
    #[arg(long)]
    dataset: PathBuf,

    /// Output directory
    #[arg(long, default_value = "reports")]
    out: PathBuf,

    /// Grade outputs with the judge model
    #[arg(long, overrides_with = "no_judge")]
    judge: bool,

    /// Use the offline grader instead of the judge model
    #[arg(long = "no-judge")]
    no_judge: bool,

    /// In-flight examples per model
    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-call timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Attempts per adapter call
    #[arg(long)]
    max_retries: Option<u32>,

    /// Extra domain schemas (YAML)
    #[arg(long)]
    schemas: Option<PathBuf>,

    /// BERT checkpoint directory for BERTScore (config.json, tokenizer.json, model.safetensors)
    #[arg(long)]
    bertscore_model: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, mut bench: BenchmarkConfig) -> BenchmarkConfig {
        if self.no_judge {
            bench.do_llm_eval = false;
        } else if self.judge {
            bench.do_llm_eval = true;
        }
        if let Some(concurrency) = self.concurrency {
            bench.concurrency = concurrency.max(1);
        }
        if let Some(timeout) = self.timeout {
            bench.timeout_seconds = timeout.max(1);
        }
        if let Some(max_retries) = self.max_retries {
            bench.max_retries = max_retries.max(1);
        }
        if let Some(dir) = &self.bertscore_model {
            bench.embedding_model = Some(dir.clone());
        }
        bench
    }
}

/// Returns whether every model run completed
async fn run_benchmark(args: &RunArgs) -> Result<bool> {
    let bench = args.apply(BenchmarkConfig::from_env());
    let models = load_models_config(&args.models)
        .with_context(|| format!("loading model registry {}", args.models.display()))?;
    let dataset = Dataset::load(&args.dataset)
        .with_context(|| format!("loading dataset {}", args.dataset.display()))?;

    let mut schemas = SchemaRegistry::builtin();
    if let Some(path) = &args.schemas {
        schemas
            .extend_from_yaml(path)
            .with_context(|| format!("loading schemas {}", path.display()))?;
    }

    let judge = Judge::from_config(&bench);
    tracing::info!(
        models = models.len(),
        examples = dataset.len(),
        judge = judge.backend_name(),
        concurrency = bench.concurrency,
        "starting benchmark"
    );

    let engines = Arc::new(ScoringEngines::with_embedding_model(
        bench.embedding_model.as_deref(),
    ));
    let mut builder = ReportBuilder::new(&args.dataset.display().to_string())
        .with_judge(judge.backend_name());
    let runner = BenchmarkRunner::new(&bench, engines, judge, schemas);

    let mut all_ok = true;
    for model in &models {
        match runner
            .run_model_to_dir(model, &bench, &dataset, &args.out)
            .await
        {
            Ok(run) => {
                println!(
                    "{}: {} examples in {:.1}s -> {}",
                    run.model_id,
                    run.results.len(),
                    run.elapsed.as_secs_f64(),
                    run.results_path.display()
                );
                builder.add_run(&run);
            }
            Err(e) => {
                tracing::error!(model = %model.id, error = %e, "model run aborted");
                eprintln!("{}: aborted: {e}", model.id);
                all_ok = false;
            }
        }
    }

    let report = builder.build();
    let paths = report
        .write_all(&args.out)
        .with_context(|| format!("writing reports to {}", args.out.display()))?;

    println!();
    println!("{}", report.to_text());
    println!("Report: {}", paths.markdown.display());
    if let Some(chart) = &paths.chart {
        println!("Chart: {}", chart.display());
    }

    Ok(all_ok)
}

fn dataset_stats(path: &Path) -> Result<()> {
    let dataset =
        Dataset::load(path).with_context(|| format!("loading dataset {}", path.display()))?;
    let stats = dataset.stats();

    println!("Dataset Statistics");
    println!("==================");
    println!("Path: {}", path.display());
    println!("Total examples: {}", stats.total_examples);
    println!("Examples with function name: {}", stats.examples_with_function);
    if !stats.function_names.is_empty() {
        println!();
        println!("Functions:");
        for name in &stats.function_names {
            println!("  - {name}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Run(args) => match run_benchmark(&args).await {
            Ok(true) => {
                println!(
                    "Wrote {MARKDOWN_FILE}, {JSON_FILE} and {CHART_FILE} to {}",
                    args.out.display()
                );
            }
            Ok(false) => {
                eprintln!("One or more model runs were aborted");
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("Benchmark failed: {e:#}");
                std::process::exit(1);
            }
        },
        Commands::Compare { reports, out } => {
            tracing::info!(reports = %reports.display(), out = %out.display(), "combining aggregates");
            match combine_aggregates(&reports, &out) {
                Ok(0) => println!("No aggregate tables found in {}", reports.display()),
                Ok(n) => println!("Combined {n} tables into {}", out.display()),
                Err(e) => {
                    eprintln!("Failed to combine aggregates: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::DatasetStats { dataset } => {
            if let Err(e) = dataset_stats(&dataset) {
                eprintln!("{e:#}");
                std::process::exit(1);
            }
        }
    }
}
