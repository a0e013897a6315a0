//! Cross-model comparison reports.
//!
//! Generates:
//! - Per-model means of every metric, judge score and schema-valid rate
//! - A bootstrap interval on the judge score
//! - Pairwise Welch tests on per-example judge scores
//! - A grouped bar chart (SVG) with every score on a shared `[0, 1]` axis
//! - A combined score table from per-model CSV files

use crate::runner::{ExampleResult, ModelRun, ScoreRow, CSV_HEADER};
use crate::stats::{bootstrap_ci, mean, welch_t_test, SignificanceResult, StatConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};
use thiserror::Error;

/// File name of the comparison chart
pub const CHART_FILE: &str = "models_bar.svg";
/// File name of the Markdown report
pub const MARKDOWN_FILE: &str = "report.md";
/// File name of the JSON report
pub const JSON_FILE: &str = "report.json";

/// Errors that can occur while writing or combining reports
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Aggregate directory not found: {0}")]
    NotFound(String),

    #[error("Unexpected header in {path}: {found}")]
    HeaderMismatch { path: String, found: String },
}

/// Summary of one model's run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    /// Registry id
    pub model_id: String,
    /// Display name
    pub model_name: String,
    /// Examples evaluated
    pub examples: usize,
    /// Examples whose inference failed
    pub failed_inferences: usize,
    /// Mean BLEU
    pub bleu: f64,
    /// Mean ROUGE-Lsum
    pub rouge: f64,
    /// Mean BERTScore F1
    pub bertscore: f64,
    /// Mean judge score
    pub llm_score: f64,
    /// Bootstrap interval of the judge score (lower, upper)
    pub llm_score_ci: (f64, f64),
    /// Fraction of schema-valid outputs
    pub schema_valid_rate: f64,
}

impl AggregateRow {
    /// Fold per-example rows into a model summary
    #[must_use]
    pub fn from_rows(
        model_id: &str,
        model_name: &str,
        rows: &[ScoreRow],
        failed_inferences: usize,
        stat_config: &StatConfig,
    ) -> Self {
        let column = |f: fn(&ScoreRow) -> f64| rows.iter().map(f).collect::<Vec<f64>>();
        let judge = column(|r| r.llm_score);

        Self {
            model_id: model_id.to_string(),
            model_name: model_name.to_string(),
            examples: rows.len(),
            failed_inferences,
            bleu: mean(&column(|r| r.bleu)),
            rouge: mean(&column(|r| r.rouge)),
            bertscore: mean(&column(|r| r.bertscore)),
            llm_score: mean(&judge),
            llm_score_ci: bootstrap_ci(&judge, stat_config),
            schema_valid_rate: mean(&column(|r| f64::from(u8::from(r.schema_valid)))),
        }
    }

    /// Chart series in display order
    #[must_use]
    pub fn chart_values(&self) -> [f64; 5] {
        [
            self.bleu,
            self.rouge,
            self.bertscore,
            self.llm_score,
            self.schema_valid_rate,
        ]
    }
}

/// Report metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Report title
    pub title: String,
    /// Dataset the models were run on
    pub dataset: String,
    /// Report generation timestamp
    pub generated_at: DateTime<Utc>,
    /// Harness version
    pub framework_version: String,
    /// Judge used for grading
    pub judge: String,
    /// Bootstrap resamples
    pub bootstrap_n: usize,
    /// Significance threshold
    pub alpha: f64,
}

/// High-level summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Models with results
    pub total_models: usize,
    /// Examples per model (largest)
    pub examples_per_model: usize,
    /// Model with the highest mean judge score
    pub best_llm_score: Option<String>,
    /// Model with the highest schema-valid rate
    pub best_schema_valid_rate: Option<String>,
}

/// Welch test between two models on one score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticalComparison {
    /// First model id
    pub model_a: String,
    /// Second model id
    pub model_b: String,
    /// Score compared
    pub metric: String,
    /// Test outcome
    pub significance: SignificanceResult,
}

/// Complete comparison report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullReport {
    pub metadata: ReportMetadata,
    pub summary: ReportSummary,
    pub models: Vec<AggregateRow>,
    pub statistical_tests: Vec<StatisticalComparison>,
}

/// Paths written by [`FullReport::write_all`]
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub markdown: PathBuf,
    pub json: PathBuf,
    pub chart: Option<PathBuf>,
}

/// Collects model runs and builds a [`FullReport`]
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    dataset: String,
    judge: String,
    stat_config: StatConfig,
    rows: Vec<AggregateRow>,
    judge_samples: Vec<Vec<f64>>,
}

impl ReportBuilder {
    /// Create a builder for runs over `dataset`
    #[must_use]
    pub fn new(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            judge: "mock".to_string(),
            stat_config: StatConfig::default(),
            rows: Vec::new(),
            judge_samples: Vec::new(),
        }
    }

    /// Set statistical configuration
    #[must_use]
    pub fn with_stat_config(mut self, config: StatConfig) -> Self {
        self.stat_config = config;
        self
    }

    /// Record the judge used for grading
    #[must_use]
    pub fn with_judge(mut self, judge: &str) -> Self {
        self.judge = judge.to_string();
        self
    }

    /// Add one model's results
    pub fn add_results(&mut self, model_id: &str, model_name: &str, results: &[ExampleResult]) {
        let rows: Vec<ScoreRow> = results.iter().map(ExampleResult::score_row).collect();
        let failed = results.iter().filter(|r| !r.success).count();
        self.rows.push(AggregateRow::from_rows(
            model_id,
            model_name,
            &rows,
            failed,
            &self.stat_config,
        ));
        self.judge_samples
            .push(results.iter().map(|r| r.llm_score).collect());
    }

    /// Add a finished model run
    pub fn add_run(&mut self, run: &ModelRun) {
        self.add_results(&run.model_id, &run.model_name, &run.results);
    }

    /// Build the full report
    #[must_use]
    pub fn build(self) -> FullReport {
        let best_by = |f: fn(&AggregateRow) -> f64| {
            self.rows
                .iter()
                .max_by(|a, b| f(a).total_cmp(&f(b)))
                .map(|r| r.model_id.clone())
        };

        let summary = ReportSummary {
            total_models: self.rows.len(),
            examples_per_model: self.rows.iter().map(|r| r.examples).max().unwrap_or(0),
            best_llm_score: best_by(|r| r.llm_score),
            best_schema_valid_rate: best_by(|r| r.schema_valid_rate),
        };
        let statistical_tests = self.build_statistical_tests();

        FullReport {
            metadata: ReportMetadata {
                title: format!("Model Benchmark: {}", self.dataset),
                dataset: self.dataset,
                generated_at: Utc::now(),
                framework_version: env!("CARGO_PKG_VERSION").to_string(),
                judge: self.judge,
                bootstrap_n: self.stat_config.bootstrap_n,
                alpha: self.stat_config.alpha,
            },
            summary,
            models: self.rows,
            statistical_tests,
        }
    }

    fn build_statistical_tests(&self) -> Vec<StatisticalComparison> {
        let mut comparisons = Vec::new();
        for i in 0..self.rows.len() {
            for j in (i + 1)..self.rows.len() {
                if let Some(significance) = welch_t_test(
                    &self.judge_samples[i],
                    &self.judge_samples[j],
                    self.stat_config.alpha,
                ) {
                    comparisons.push(StatisticalComparison {
                        model_a: self.rows[i].model_id.clone(),
                        model_b: self.rows[j].model_id.clone(),
                        metric: "llm_score".to_string(),
                        significance,
                    });
                }
            }
        }
        comparisons
    }
}

/// Table row for text/markdown output
#[derive(Tabled)]
struct ModelTableRow {
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "N")]
    examples: usize,
    #[tabled(rename = "Failed")]
    failed: usize,
    #[tabled(rename = "BLEU")]
    bleu: String,
    #[tabled(rename = "ROUGE")]
    rouge: String,
    #[tabled(rename = "BERTScore")]
    bertscore: String,
    #[tabled(rename = "Judge [95% CI]")]
    judge: String,
    #[tabled(rename = "Schema valid")]
    schema_valid: String,
}

impl From<&AggregateRow> for ModelTableRow {
    fn from(row: &AggregateRow) -> Self {
        Self {
            model: row.model_id.clone(),
            examples: row.examples,
            failed: row.failed_inferences,
            bleu: format!("{:.3}", row.bleu),
            rouge: format!("{:.3}", row.rouge),
            bertscore: format!("{:.3}", row.bertscore),
            judge: format!(
                "{:.3} [{:.3}-{:.3}]",
                row.llm_score, row.llm_score_ci.0, row.llm_score_ci.1
            ),
            schema_valid: format!("{:.1}%", row.schema_valid_rate * 100.0),
        }
    }
}

impl FullReport {
    /// Render report as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    fn model_table(&self) -> String {
        Table::new(self.models.iter().map(ModelTableRow::from)).to_string()
    }

    /// Render report as markdown
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut output = String::new();

        writeln!(output, "# {}", self.metadata.title).ok();
        writeln!(output).ok();
        writeln!(
            output,
            "Generated: {} | Version: {} | Judge: {}",
            self.metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.metadata.framework_version,
            self.metadata.judge
        )
        .ok();
        writeln!(output).ok();

        writeln!(output, "## Summary").ok();
        writeln!(output).ok();
        writeln!(output, "| Metric | Value |").ok();
        writeln!(output, "|--------|-------|").ok();
        writeln!(output, "| Models | {} |", self.summary.total_models).ok();
        writeln!(output, "| Examples per model | {} |", self.summary.examples_per_model).ok();
        writeln!(
            output,
            "| Best judge score | {} |",
            self.summary.best_llm_score.as_deref().unwrap_or("-")
        )
        .ok();
        writeln!(
            output,
            "| Best schema-valid rate | {} |",
            self.summary.best_schema_valid_rate.as_deref().unwrap_or("-")
        )
        .ok();
        writeln!(output).ok();

        writeln!(output, "## Model Results").ok();
        writeln!(output).ok();
        writeln!(output, "{}", self.model_table()).ok();
        writeln!(output).ok();
        writeln!(output, "![Model comparison]({CHART_FILE})").ok();
        writeln!(output).ok();

        if !self.statistical_tests.is_empty() {
            writeln!(output, "## Statistical Comparisons").ok();
            writeln!(output).ok();
            writeln!(
                output,
                "| Model A | Model B | Metric | t | p-value | Cohen's d | Effect |"
            )
            .ok();
            writeln!(
                output,
                "|---------|---------|--------|---|---------|-----------|--------|"
            )
            .ok();
            for test in &self.statistical_tests {
                let s = &test.significance;
                writeln!(
                    output,
                    "| {} | {} | {} | {:.3} | {:.4}{} | {:.3} | {} |",
                    test.model_a,
                    test.model_b,
                    test.metric,
                    s.t_statistic,
                    s.p_value,
                    if s.is_significant { " *" } else { "" },
                    s.cohens_d,
                    s.effect_interpretation
                )
                .ok();
            }
            writeln!(output).ok();
            writeln!(output, "\\* significant at alpha = {}", self.metadata.alpha).ok();
        }

        output
    }

    /// Render report as plain text table
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut output = String::new();
        let rule = "=".repeat(64);

        writeln!(output, "{rule}").ok();
        writeln!(output, "  {}", self.metadata.title).ok();
        writeln!(output, "{rule}").ok();
        writeln!(output).ok();
        writeln!(output, "{}", self.model_table()).ok();

        for test in &self.statistical_tests {
            writeln!(
                output,
                "  {} vs {}: p={:.4} d={:.2} ({})",
                test.model_a,
                test.model_b,
                test.significance.p_value,
                test.significance.cohens_d,
                test.significance.effect_interpretation
            )
            .ok();
        }

        output
    }

    /// Grouped bar chart of every model's scores
    #[must_use]
    pub fn to_svg(&self) -> String {
        render_bar_chart(&self.models)
    }

    /// Write the Markdown report, JSON report and chart into `out_dir`.
    ///
    /// The chart is skipped when there are no models.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written.
    pub fn write_all(&self, out_dir: &Path) -> Result<ReportPaths, ReportError> {
        std::fs::create_dir_all(out_dir)?;

        let markdown = out_dir.join(MARKDOWN_FILE);
        std::fs::write(&markdown, self.to_markdown())?;
        let json = out_dir.join(JSON_FILE);
        std::fs::write(&json, self.to_json()?)?;

        let chart = if self.models.is_empty() {
            tracing::warn!("no model results, skipping chart");
            None
        } else {
            let path = out_dir.join(CHART_FILE);
            std::fs::write(&path, self.to_svg())?;
            Some(path)
        };

        Ok(ReportPaths {
            markdown,
            json,
            chart,
        })
    }
}

const SERIES: [(&str, &str); 5] = [
    ("bleu", "#4c72b0"),
    ("rouge", "#dd8452"),
    ("bertscore", "#55a868"),
    ("llm_score", "#c44e52"),
    ("schema_valid_rate", "#8172b3"),
];

const BAR_WIDTH: f64 = 16.0;
const GROUP_GAP: f64 = 28.0;
const PLOT_HEIGHT: f64 = 300.0;
const MARGIN_LEFT: f64 = 60.0;
const MARGIN_TOP: f64 = 50.0;
const LEGEND_WIDTH: f64 = 170.0;

fn xml_escape(text: &str) -> String {
    text.chars()
        .fold(String::with_capacity(text.len()), |mut out, c| {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&apos;"),
                other => out.push(other),
            }
            out
        })
}

/// Render a grouped bar chart: one group per model, one bar per score,
/// y axis fixed to `[0, 1]`
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn render_bar_chart(rows: &[AggregateRow]) -> String {
    let group_width = BAR_WIDTH * SERIES.len() as f64 + GROUP_GAP;
    let plot_width = (group_width * rows.len() as f64).max(group_width);
    let width = MARGIN_LEFT + plot_width + LEGEND_WIDTH;
    let height = MARGIN_TOP + PLOT_HEIGHT + 60.0;
    let baseline = MARGIN_TOP + PLOT_HEIGHT;

    let mut svg = String::new();
    writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}" font-family="sans-serif" font-size="12">"#
    )
    .ok();
    writeln!(svg, r#"<rect width="100%" height="100%" fill="white"/>"#).ok();
    writeln!(
        svg,
        r#"<text x="{}" y="24" font-size="16" text-anchor="middle">Model comparison (0-1)</text>"#,
        MARGIN_LEFT + plot_width / 2.0
    )
    .ok();

    for tick in 0..=5 {
        let value = f64::from(tick) * 0.2;
        let y = baseline - value * PLOT_HEIGHT;
        writeln!(
            svg,
            r##"<line x1="{MARGIN_LEFT}" y1="{y}" x2="{}" y2="{y}" stroke="#dddddd"/>"##,
            MARGIN_LEFT + plot_width
        )
        .ok();
        writeln!(
            svg,
            r#"<text x="{}" y="{}" text-anchor="end">{value:.1}</text>"#,
            MARGIN_LEFT - 6.0,
            y + 4.0
        )
        .ok();
    }

    for (g, row) in rows.iter().enumerate() {
        let group_x = MARGIN_LEFT + GROUP_GAP / 2.0 + g as f64 * group_width;
        for (s, ((series, color), value)) in SERIES.iter().zip(row.chart_values()).enumerate() {
            let value = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
            let bar_height = value * PLOT_HEIGHT;
            writeln!(
                svg,
                r#"<rect x="{}" y="{}" width="{BAR_WIDTH}" height="{bar_height}" fill="{color}"><title>{}: {series} = {value:.3}</title></rect>"#,
                group_x + s as f64 * BAR_WIDTH,
                baseline - bar_height,
                xml_escape(&row.model_id)
            )
            .ok();
        }
        writeln!(
            svg,
            r#"<text x="{}" y="{}" text-anchor="middle">{}</text>"#,
            group_x + BAR_WIDTH * SERIES.len() as f64 / 2.0,
            baseline + 18.0,
            xml_escape(&row.model_id)
        )
        .ok();
    }

    writeln!(
        svg,
        r#"<line x1="{MARGIN_LEFT}" y1="{baseline}" x2="{}" y2="{baseline}" stroke="black"/>"#,
        MARGIN_LEFT + plot_width
    )
    .ok();

    let legend_x = MARGIN_LEFT + plot_width + 20.0;
    for (i, (series, color)) in SERIES.iter().enumerate() {
        let y = MARGIN_TOP + i as f64 * 20.0;
        writeln!(
            svg,
            r#"<rect x="{legend_x}" y="{y}" width="12" height="12" fill="{color}"/><text x="{}" y="{}">{series}</text>"#,
            legend_x + 18.0,
            y + 10.0
        )
        .ok();
    }

    writeln!(svg, "</svg>").ok();
    svg
}

/// Combine per-model score tables into one CSV with a leading `model_id`
/// column taken from each file stem.
///
/// Returns the number of tables combined. With no tables, nothing is
/// written and 0 is returned.
///
/// # Errors
///
/// Returns an error if the directory is missing, a file cannot be read or
/// written, or a table has an unexpected header.
pub fn combine_aggregates(aggregate_dir: &Path, out_path: &Path) -> Result<usize, ReportError> {
    if !aggregate_dir.is_dir() {
        return Err(ReportError::NotFound(aggregate_dir.display().to_string()));
    }

    let pattern = aggregate_dir.join("*.csv");
    let mut files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())?
        .filter_map(Result::ok)
        .filter(|p| p != out_path)
        .collect();
    files.sort();

    if files.is_empty() {
        tracing::warn!(dir = %aggregate_dir.display(), "no aggregate CSV files found");
        return Ok(0);
    }

    let mut combined = format!("model_id,{CSV_HEADER}\n");
    for file in &files {
        let model_id = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content = std::fs::read_to_string(file)?;
        let mut lines = content.lines();

        let header = lines.next().unwrap_or_default();
        if header.trim() != CSV_HEADER {
            return Err(ReportError::HeaderMismatch {
                path: file.display().to_string(),
                found: header.to_string(),
            });
        }
        for line in lines.filter(|l| !l.trim().is_empty()) {
            writeln!(combined, "{model_id},{line}").ok();
        }
    }

    if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(out_path, combined)?;
    tracing::info!(files = files.len(), out = %out_path.display(), "combined aggregate tables");
    Ok(files.len())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::metrics::MetricScores;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn result(id: &str, success: bool, schema_valid: bool, bleu: f64, llm_score: f64) -> ExampleResult {
        ExampleResult {
            id: id.to_string(),
            input: "soru".to_string(),
            expected: "cevap".to_string(),
            output: "cevap".to_string(),
            success,
            error: None,
            schema_valid,
            schema_errors: Vec::new(),
            metrics: MetricScores {
                bleu,
                rouge: bleu,
                bertscore: bleu,
            },
            llm_score,
            llm_reasons: "mock-eval".to_string(),
            metadata: HashMap::new(),
        }
    }

    fn fast_stats() -> StatConfig {
        StatConfig {
            bootstrap_n: 500,
            ..StatConfig::default()
        }
    }

    #[test]
    fn test_aggregate_row_means() {
        let rows = vec![
            ScoreRow {
                schema_valid: true,
                bleu: 0.2,
                rouge: 0.4,
                bertscore: 0.6,
                llm_score: 1.0,
            },
            ScoreRow {
                schema_valid: false,
                bleu: 0.4,
                rouge: 0.0,
                bertscore: 0.8,
                llm_score: 0.5,
            },
        ];
        let row = AggregateRow::from_rows("m", "Model", &rows, 1, &fast_stats());
        assert_eq!(row.examples, 2);
        assert_eq!(row.failed_inferences, 1);
        assert!((row.bleu - 0.3).abs() < 1e-12);
        assert!((row.rouge - 0.2).abs() < 1e-12);
        assert!((row.bertscore - 0.7).abs() < 1e-12);
        assert!((row.llm_score - 0.75).abs() < 1e-12);
        assert!((row.schema_valid_rate - 0.5).abs() < 1e-12);
        assert!(row.llm_score_ci.0 <= row.llm_score && row.llm_score <= row.llm_score_ci.1);
    }

    #[test]
    fn test_aggregate_row_empty() {
        let row = AggregateRow::from_rows("m", "m", &[], 0, &fast_stats());
        assert_eq!(row.chart_values(), [0.0; 5]);
    }

    #[test]
    fn test_report_builder_build() {
        let mut builder = ReportBuilder::new("telekom_test_set.jsonl")
            .with_stat_config(fast_stats())
            .with_judge("mock");
        builder.add_results(
            "good",
            "Good",
            &(0..10)
                .map(|i| result(&i.to_string(), true, true, 0.8, if i % 2 == 0 { 1.0 } else { 0.9 }))
                .collect::<Vec<_>>(),
        );
        builder.add_results(
            "weak",
            "Weak",
            &(0..10)
                .map(|i| result(&i.to_string(), i != 0, false, 0.1, if i % 2 == 0 { 0.5 } else { 0.4 }))
                .collect::<Vec<_>>(),
        );

        let report = builder.build();
        assert_eq!(report.summary.total_models, 2);
        assert_eq!(report.summary.examples_per_model, 10);
        assert_eq!(report.summary.best_llm_score.as_deref(), Some("good"));
        assert_eq!(report.summary.best_schema_valid_rate.as_deref(), Some("good"));
        assert_eq!(report.models[1].failed_inferences, 1);

        assert_eq!(report.statistical_tests.len(), 1);
        let test = &report.statistical_tests[0];
        assert_eq!(test.metric, "llm_score");
        assert!(test.significance.is_significant);
    }

    #[test]
    fn test_report_renderings() {
        let mut builder = ReportBuilder::new("set.jsonl").with_stat_config(fast_stats());
        builder.add_results("echo", "Echo", &[result("1", true, false, 0.5, 0.5)]);
        let report = builder.build();

        let markdown = report.to_markdown();
        assert!(markdown.contains("# Model Benchmark: set.jsonl"));
        assert!(markdown.contains("## Model Results"));
        assert!(markdown.contains("echo"));
        assert!(markdown.contains(CHART_FILE));

        let text = report.to_text();
        assert!(text.contains("Judge [95% CI]"));

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["models"][0]["model_id"], "echo");
    }

    #[test]
    fn test_bar_chart_has_bar_per_score() {
        let rows = vec![
            AggregateRow::from_rows("a&b", "A", &[ScoreRow::default()], 0, &fast_stats()),
            AggregateRow::from_rows("c", "C", &[ScoreRow::default()], 0, &fast_stats()),
        ];
        let svg = render_bar_chart(&rows);
        assert!(svg.starts_with("<svg"));
        assert!(svg.trim_end().ends_with("</svg>"));
        assert_eq!(svg.matches("<title>").count(), 10);
        assert!(svg.contains("a&amp;b"));
        assert!(!svg.contains("a&b"));
        for (series, _) in SERIES {
            assert!(svg.contains(series));
        }
    }

    #[test]
    fn test_write_all() {
        let dir = TempDir::new().unwrap();
        let mut builder = ReportBuilder::new("set").with_stat_config(fast_stats());
        builder.add_results("m", "m", &[result("1", true, true, 1.0, 1.0)]);

        let paths = builder.build().write_all(dir.path()).unwrap();
        assert!(paths.markdown.exists());
        assert!(paths.json.exists());
        assert_eq!(paths.chart, Some(dir.path().join(CHART_FILE)));

        let empty = ReportBuilder::new("set").build().write_all(dir.path()).unwrap();
        assert!(empty.chart.is_none());
    }

    #[test]
    fn test_combine_aggregates() {
        let dir = TempDir::new().unwrap();
        let agg = dir.path().join("aggregate");
        std::fs::create_dir_all(&agg).unwrap();
        std::fs::write(agg.join("beta.csv"), format!("{CSV_HEADER}\n1,0.5,0.5,0.5,1\n")).unwrap();
        std::fs::write(
            agg.join("alpha.csv"),
            format!("{CSV_HEADER}\n0,0,0,0,0.5\n1,1,1,1,1\n"),
        )
        .unwrap();

        let out = dir.path().join("combined.csv");
        assert_eq!(combine_aggregates(&agg, &out).unwrap(), 2);

        let combined = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = combined.lines().collect();
        assert_eq!(lines[0], format!("model_id,{CSV_HEADER}"));
        assert_eq!(lines[1], "alpha,0,0,0,0,0.5");
        assert_eq!(lines[3], "beta,1,0.5,0.5,0.5,1");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_combine_aggregates_empty_and_missing() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("combined.csv");
        assert_eq!(combine_aggregates(dir.path(), &out).unwrap(), 0);
        assert!(!out.exists());

        let missing = combine_aggregates(&dir.path().join("nope"), &out);
        assert!(matches!(missing, Err(ReportError::NotFound(_))));
    }

    #[test]
    fn test_combine_aggregates_rejects_foreign_csv() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("x.csv"), "a,b\n1,2\n").unwrap();
        let result = combine_aggregates(dir.path(), &dir.path().join("out.csv"));
        assert!(matches!(result, Err(ReportError::HeaderMismatch { .. })));
    }
}
