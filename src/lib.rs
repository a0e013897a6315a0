//! # Model Bench
//!
//! Benchmark harness that runs one evaluation dataset against several LLM
//! backends and compares them on structured-output validity, reference
//! similarity and judge-graded quality.
//!
//! ## Pipeline
//!
//! ```text
//! Model registry (YAML/JSON) + Dataset (JSON/JSONL)
//!        ↓
//! Adapter inference (chat API | managed inference | HTTP | local | echo)
//!        ↓
//! Schema validation (domain schema by function name, generic fallback)
//!        ↓
//! Metrics (BLEU, ROUGE-Lsum, BERTScore over BERT token embeddings)
//!        ↓
//! Judge grading (hosted model or offline grader)
//!        ↓
//! per_example/<id>.jsonl + aggregate/<id>.csv
//!        ↓
//! Report (Markdown, JSON, SVG bar chart, Welch tests)
//! ```
//!
//! Every example yields exactly one result: failures at any stage are
//! recorded on the result instead of aborting the run. Only configuration
//! errors stop a model's run, and only before its first example.

pub mod adapters;
pub mod config;
pub mod dataset;
pub mod embeddings;
pub mod judge;
pub mod metrics;
pub mod report;
pub mod retry;
pub mod runner;
pub mod schema;
pub mod stats;

pub use adapters::{
    build_adapter, Adapter, AdapterError, Credential, EchoAdapter, GenerationParams,
    InferenceAdapter, InferenceResult,
};
pub use config::{
    load_models_config, BackendKind, BenchmarkConfig, ConfigError, JudgeBackendKind, ModelConfig,
};
pub use dataset::{Dataset, DatasetError, DatasetExample, DatasetStats};
pub use judge::{Grade, Judge};
pub use embeddings::{BertEncoder, EmbeddingError, TokenEncoder};
pub use metrics::{BertScore, MetricScorer, MetricScores, ScoringEngines};
pub use report::{
    combine_aggregates, render_bar_chart, AggregateRow, FullReport, ReportBuilder, ReportError,
};
pub use retry::RetryPolicy;
pub use runner::{BenchmarkRunner, ExampleResult, ModelRun, RunnerError, ScoreRow};
pub use schema::{extract_json, SchemaRegistry, SchemaValidation};
pub use stats::{bootstrap_ci, welch_t_test, SignificanceResult, StatConfig};
