//! Per-model evaluation runs.
//!
//! Each dataset example goes through inference, schema validation, metric
//! scoring and judge grading inside its own task. A semaphore caps the
//! number of in-flight pipelines per model; the collecting loop is the only
//! writer of the per-model result stream.

use crate::adapters::{build_adapter, InferenceAdapter};
use crate::config::{validate_model_id, BenchmarkConfig, ConfigError, ModelConfig};
use crate::dataset::{Dataset, DatasetExample};
use crate::judge::Judge;
use crate::metrics::{MetricScores, ScoringEngines};
use crate::schema::SchemaRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::instrument;

/// Directory (under the output root) holding per-model JSONL results
pub const PER_EXAMPLE_DIR: &str = "per_example";
/// Directory (under the output root) holding per-model score tables
pub const AGGREGATE_DIR: &str = "aggregate";
/// Header of the per-model score table
pub const CSV_HEADER: &str = "schema_valid,bleu,rouge,bertscore,llm_score";

/// Errors that abort a model's run
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Full record for one (model, example) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleResult {
    pub id: String,
    pub input: String,
    pub expected: String,
    pub output: String,
    pub success: bool,
    pub error: Option<String>,
    pub schema_valid: bool,
    pub schema_errors: Vec<String>,
    pub metrics: MetricScores,
    pub llm_score: f64,
    pub llm_reasons: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExampleResult {
    /// Record for a pipeline that did not complete
    #[must_use]
    pub fn aborted(example: &DatasetExample, reason: &str) -> Self {
        Self {
            id: example.id.clone(),
            input: example.input.clone(),
            expected: example.expected_output.clone(),
            output: String::new(),
            success: false,
            error: Some(reason.to_string()),
            schema_valid: false,
            schema_errors: vec![reason.to_string()],
            metrics: MetricScores::default(),
            llm_score: 0.0,
            llm_reasons: reason.to_string(),
            metadata: example.metadata.clone(),
        }
    }

    /// Numeric row for the score table
    #[must_use]
    pub fn score_row(&self) -> ScoreRow {
        ScoreRow {
            schema_valid: self.schema_valid,
            bleu: self.metrics.bleu,
            rouge: self.metrics.rouge,
            bertscore: self.metrics.bertscore,
            llm_score: self.llm_score,
        }
    }
}

/// One row of the per-model score table
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub schema_valid: bool,
    pub bleu: f64,
    pub rouge: f64,
    pub bertscore: f64,
    pub llm_score: f64,
}

impl ScoreRow {
    /// CSV line without trailing newline
    #[must_use]
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{}",
            u8::from(self.schema_valid),
            self.bleu,
            self.rouge,
            self.bertscore,
            self.llm_score
        )
    }
}

/// Write the score table for one model
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_score_csv(path: &Path, results: &[ExampleResult]) -> Result<(), RunnerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(std::fs::File::create(path)?);
    writeln!(writer, "{CSV_HEADER}")?;
    for result in results {
        writeln!(writer, "{}", result.score_row().to_csv_line())?;
    }
    writer.flush()?;
    Ok(())
}

/// Shared, read-only state of every example pipeline
#[derive(Debug)]
struct PipelineContext {
    engines: Arc<ScoringEngines>,
    judge: Judge,
    schemas: SchemaRegistry,
    timeout: Duration,
    max_retries: u32,
}

impl PipelineContext {
    /// Run every stage for one example; later stages still run on an empty
    /// output after a failed inference
    async fn evaluate<A>(&self, adapter: &A, example: &DatasetExample) -> ExampleResult
    where
        A: InferenceAdapter + ?Sized,
    {
        let inference = adapter
            .infer(&example.input, self.timeout, self.max_retries)
            .await;
        if let Some(error) = &inference.error {
            tracing::warn!(example = %example.id, %error, "inference failed");
        }

        let output = inference.raw_output;
        let schema = self.schemas.validate(&output, example.function_name());
        let metrics = self.engines.compute_all(&output, &example.expected_output);
        let grade = self
            .judge
            .grade(&example.input, &example.expected_output, &output)
            .await;

        ExampleResult {
            id: example.id.clone(),
            input: example.input.clone(),
            expected: example.expected_output.clone(),
            output,
            success: inference.success,
            error: inference.error,
            schema_valid: schema.valid,
            schema_errors: schema.errors,
            metrics,
            llm_score: grade.score,
            llm_reasons: grade.reasons,
            metadata: example.metadata.clone(),
        }
    }
}

/// Files and results of one model's run
#[derive(Debug, Clone)]
pub struct ModelRun {
    /// Registry id
    pub model_id: String,
    /// Display name
    pub model_name: String,
    /// Results in dataset order
    pub results: Vec<ExampleResult>,
    /// Line-delimited result file
    pub results_path: PathBuf,
    /// Score table
    pub scores_path: PathBuf,
    /// Wall time of the run
    pub elapsed: Duration,
}

/// Runs datasets against adapters
#[derive(Debug, Clone)]
pub struct BenchmarkRunner {
    context: Arc<PipelineContext>,
    concurrency: usize,
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "pipeline cancelled".to_string();
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("pipeline panicked: {detail}")
}

impl BenchmarkRunner {
    /// Create a runner from run settings and the shared scoring resources
    #[must_use]
    pub fn new(
        bench: &BenchmarkConfig,
        engines: Arc<ScoringEngines>,
        judge: Judge,
        schemas: SchemaRegistry,
    ) -> Self {
        Self {
            context: Arc::new(PipelineContext {
                engines,
                judge,
                schemas,
                timeout: Duration::from_secs(bench.timeout_seconds),
                max_retries: bench.max_retries.max(1),
            }),
            concurrency: bench.concurrency.max(1),
        }
    }

    /// Maximum in-flight pipelines per model
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Evaluate every example with `adapter`.
    ///
    /// Each completed result is appended to `sink` as one JSON line, in
    /// completion order. The returned results are in dataset order and
    /// always number exactly `dataset.len()`.
    ///
    /// # Errors
    ///
    /// Returns an error only if writing to `sink` fails.
    pub async fn run_with_adapter<A>(
        &self,
        adapter: Arc<A>,
        dataset: &Dataset,
        mut sink: Option<&mut (dyn Write + Send)>,
    ) -> Result<Vec<ExampleResult>, RunnerError>
    where
        A: InferenceAdapter + ?Sized + 'static,
    {
        let gate = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut pending = HashMap::with_capacity(dataset.len());

        for (index, example) in dataset.iter().enumerate() {
            let gate = Arc::clone(&gate);
            let adapter = Arc::clone(&adapter);
            let context = Arc::clone(&self.context);
            let task_example = example.clone();

            let handle = tasks.spawn(async move {
                let _permit = gate.acquire_owned().await.ok();
                context.evaluate(adapter.as_ref(), &task_example).await
            });
            pending.insert(handle.id(), index);
        }

        let mut slots: Vec<Option<ExampleResult>> = vec![None; dataset.len()];
        while let Some(joined) = tasks.join_next_with_id().await {
            let (task_id, outcome) = match joined {
                Ok((task_id, result)) => (task_id, Ok(result)),
                Err(err) => (err.id(), Err(panic_message(err))),
            };
            let Some(index) = pending.remove(&task_id) else {
                continue;
            };
            let result = outcome.unwrap_or_else(|reason| {
                let example = &dataset.examples[index];
                tracing::error!(example = %example.id, %reason, "example pipeline aborted");
                ExampleResult::aborted(example, &reason)
            });

            if let Some(writer) = sink.as_deref_mut() {
                serde_json::to_writer(&mut *writer, &result)?;
                writeln!(writer)?;
            }
            slots[index] = Some(result);
        }

        Ok(slots
            .into_iter()
            .zip(dataset.iter())
            .map(|(slot, example)| {
                slot.unwrap_or_else(|| ExampleResult::aborted(example, "pipeline did not complete"))
            })
            .collect())
    }

    /// Build the adapter for `model` and evaluate the dataset in memory
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::Config` for an unsupported backend.
    pub async fn run_model(
        &self,
        model: &ModelConfig,
        bench: &BenchmarkConfig,
        dataset: &Dataset,
    ) -> Result<Vec<ExampleResult>, RunnerError> {
        let adapter = Arc::new(build_adapter(model, bench)?);
        self.run_with_adapter(adapter, dataset, None).await
    }

    /// Evaluate `model` and write its result stream and score table.
    ///
    /// Configuration errors abort before any file is created.
    ///
    /// # Errors
    ///
    /// Returns an error for an unsupported backend or when output files
    /// cannot be written.
    #[instrument(skip_all, fields(model = %model.id, backend = %model.backend))]
    pub async fn run_model_to_dir(
        &self,
        model: &ModelConfig,
        bench: &BenchmarkConfig,
        dataset: &Dataset,
        out_dir: &Path,
    ) -> Result<ModelRun, RunnerError> {
        validate_model_id(&model.id)?;
        let adapter = Arc::new(build_adapter(model, bench)?);
        let started = Instant::now();
        tracing::info!(
            examples = dataset.len(),
            concurrency = self.concurrency,
            judge = self.context.judge.backend_name(),
            "starting model run"
        );

        let results_path = out_dir.join(PER_EXAMPLE_DIR).join(format!("{}.jsonl", model.id));
        let scores_path = out_dir.join(AGGREGATE_DIR).join(format!("{}.csv", model.id));
        std::fs::create_dir_all(out_dir.join(PER_EXAMPLE_DIR))?;

        let mut writer = BufWriter::new(std::fs::File::create(&results_path)?);
        let results = self
            .run_with_adapter(adapter, dataset, Some(&mut writer))
            .await?;
        writer.flush()?;
        write_score_csv(&scores_path, &results)?;

        let elapsed = started.elapsed();
        tracing::info!(
            failed = results.iter().filter(|r| !r.success).count(),
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "model run finished"
        );

        Ok(ModelRun {
            model_id: model.id.clone(),
            model_name: model.display_name().to_string(),
            results,
            results_path,
            scores_path,
            elapsed,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::adapters::{EchoAdapter, InferenceResult, LocalProcessAdapter};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Panicking;

    #[async_trait]
    impl InferenceAdapter for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn infer(&self, prompt: &str, _: Duration, _: u32) -> InferenceResult {
            assert!(prompt != "boom", "adapter exploded");
            InferenceResult::ok(prompt)
        }
    }

    fn example(id: &str, input: &str, expected: &str) -> DatasetExample {
        DatasetExample {
            id: id.to_string(),
            input: input.to_string(),
            expected_output: expected.to_string(),
            metadata: HashMap::new(),
        }
    }

    fn dataset(examples: Vec<DatasetExample>) -> Dataset {
        Dataset::from_examples("memory.jsonl", examples).unwrap()
    }

    fn runner() -> BenchmarkRunner {
        let bench = BenchmarkConfig {
            do_llm_eval: false,
            concurrency: 2,
            ..BenchmarkConfig::default()
        };
        BenchmarkRunner::new(
            &bench,
            Arc::new(ScoringEngines::new()),
            Judge::mock(),
            SchemaRegistry::builtin(),
        )
    }

    fn model(id: &str, backend: &str, target: &str) -> ModelConfig {
        ModelConfig {
            id: id.to_string(),
            name: String::new(),
            backend: backend.to_string(),
            model_name_or_endpoint: target.to_string(),
            api_key_env: None,
            params: HashMap::new(),
            notes: String::new(),
        }
    }

    #[tokio::test]
    async fn test_echo_run_keeps_dataset_order() {
        let data = dataset(vec![
            example("ex1", "Faturamı öğrenmek istiyorum", "Faturanız 150 TL"),
            example("ex2", "{\"status\": \"success\", \"message\": \"ok\"}", "x"),
            example("ex3", "same", "same"),
        ]);

        let results = runner()
            .run_with_adapter(Arc::new(EchoAdapter), &data, None)
            .await
            .unwrap();

        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["ex1", "ex2", "ex3"]);

        let first = &results[0];
        assert!(first.success);
        assert_eq!(first.output, first.input);
        assert!(!first.schema_valid);
        assert!(first.schema_errors[0].contains("no parseable JSON"));
        assert!((0.0..=1.0).contains(&first.metrics.bleu));
        assert_eq!(first.llm_score, 0.5);

        assert!(results[1].schema_valid);
        assert_eq!(results[2].llm_score, 1.0);
    }

    #[tokio::test]
    async fn test_failed_inference_still_produces_result() {
        let data = dataset(vec![example("a", "soru", "cevap"), example("b", "soru", "cevap")]);
        let results = runner()
            .run_with_adapter(Arc::new(LocalProcessAdapter::new("m.gguf")), &data, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(!result.success);
            assert!(result.error.as_deref().unwrap().contains("not implemented"));
            assert!(result.output.is_empty());
            assert_eq!(result.metrics, MetricScores::default());
            assert!(!result.schema_valid);
            assert!((0.0..=1.0).contains(&result.llm_score));
        }
    }

    #[tokio::test]
    async fn test_panicking_pipeline_is_recorded() {
        let data = dataset(vec![example("ok", "fine", "fine"), example("bad", "boom", "x")]);
        let results = runner()
            .run_with_adapter(Arc::new(Panicking), &data, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        let bad = &results[1];
        assert_eq!(bad.id, "bad");
        assert!(!bad.success);
        assert!(bad.error.as_deref().unwrap().starts_with("pipeline panicked"));
        assert_eq!(bad.llm_score, 0.0);
    }

    #[tokio::test]
    async fn test_sink_receives_one_line_per_result() {
        let data = dataset(vec![example("1", "a", "a"), example("2", "b", "b")]);
        let mut sink: Vec<u8> = Vec::new();
        runner()
            .run_with_adapter(Arc::new(EchoAdapter), &data, Some(&mut sink))
            .await
            .unwrap();

        let text = String::from_utf8(sink).unwrap();
        let mut ids: Vec<String> = text
            .lines()
            .map(|line| serde_json::from_str::<ExampleResult>(line).unwrap().id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn test_run_model_to_dir_writes_outputs() {
        let dir = TempDir::new().unwrap();
        let data = dataset(vec![
            example("ex1", "Faturamı öğrenmek istiyorum", "Faturanız 150 TL"),
            example("ex2", "Kotam ne kadar?", "Kotam ne kadar?"),
        ]);
        let bench = BenchmarkConfig::default();

        let run = runner()
            .run_model_to_dir(&model("echo", "http", "mock://echo"), &bench, &data, dir.path())
            .await
            .unwrap();

        assert_eq!(run.results.len(), 2);
        assert_eq!(run.model_name, "echo");
        assert_eq!(run.results_path, dir.path().join("per_example/echo.jsonl"));

        let jsonl = std::fs::read_to_string(&run.results_path).unwrap();
        assert_eq!(jsonl.lines().count(), 2);
        assert!(jsonl.contains("Faturamı öğrenmek istiyorum"));

        let csv = std::fs::read_to_string(dir.path().join("aggregate/echo.csv")).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("0,"));
        assert!(lines[2].ends_with(",1"));
    }

    #[tokio::test]
    async fn test_unsupported_backend_aborts_before_output() {
        let dir = TempDir::new().unwrap();
        let data = dataset(vec![example("ex1", "a", "b")]);
        let result = runner()
            .run_model_to_dir(
                &model("bad", "vllm", "x"),
                &BenchmarkConfig::default(),
                &data,
                dir.path(),
            )
            .await;

        assert!(matches!(
            result,
            Err(RunnerError::Config(ConfigError::UnsupportedBackend(_)))
        ));
        assert!(!dir.path().join(PER_EXAMPLE_DIR).exists());
    }

    #[tokio::test]
    async fn test_path_like_model_id_aborts_before_output() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let data = dataset(vec![example("ex1", "a", "b")]);
        let result = runner()
            .run_model_to_dir(
                &model("../escaped", "mock", "echo"),
                &BenchmarkConfig::default(),
                &data,
                &out,
            )
            .await;

        assert!(matches!(
            result,
            Err(RunnerError::Config(ConfigError::InvalidModelId(_)))
        ));
        assert!(!out.exists());
        assert!(!dir.path().join("escaped.jsonl").exists());
    }

    #[test]
    fn test_score_row_csv_line() {
        let row = ScoreRow {
            schema_valid: true,
            bleu: 0.25,
            rouge: 0.5,
            bertscore: 0.75,
            llm_score: 1.0,
        };
        assert_eq!(row.to_csv_line(), "1,0.25,0.5,0.75,1");
    }
}
