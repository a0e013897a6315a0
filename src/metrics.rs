//! Text-similarity metrics between a model output and its reference.
//!
//! Three independent axes, each in `[0, 1]`:
//! - `bleu`: clipped n-gram precision (orders 1-4) with brevity penalty
//! - `rouge`: summary-level longest-common-subsequence F-measure (ROUGE-Lsum)
//! - `bertscore`: greedy-matched token-embedding cosine F1
//!
//! The engines are built once into a [`ScoringEngines`] value and shared
//! read-only across tasks.

use crate::embeddings::{BertEncoder, TokenEncoder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

/// A similarity metric over one prediction/reference pair
pub trait MetricScorer: Send + Sync {
    /// Metric name as written to reports
    fn name(&self) -> &'static str;

    /// Score in `[0, 1]`; inputs are trimmed and non-empty
    fn score(&self, prediction: &str, reference: &str) -> f64;
}

/// Scores for one example
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricScores {
    pub bleu: f64,
    pub rouge: f64,
    pub bertscore: f64,
}

/// Lowercase with the Turkish dotted/dotless I mapping
fn casefold_tr(text: &str) -> String {
    text.chars()
        .flat_map(|c| match c {
            'I' => vec!['ı'],
            'İ' => vec!['i'],
            other => other.to_lowercase().collect(),
        })
        .collect()
}

/// Word and punctuation tokens, close to the `13a` convention
fn tokenize_13a(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut word_start: Option<usize> = None;

    for (idx, c) in text.char_indices() {
        if c.is_alphanumeric() {
            word_start.get_or_insert(idx);
            continue;
        }
        if let Some(start) = word_start.take() {
            tokens.push(&text[start..idx]);
        }
        if !c.is_whitespace() {
            tokens.push(&text[idx..idx + c.len_utf8()]);
        }
    }
    if let Some(start) = word_start {
        tokens.push(&text[start..]);
    }
    tokens
}

/// Lowercased alphanumeric tokens
fn word_tokens(text: &str) -> Vec<String> {
    casefold_tr(text)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Corpus BLEU for a single pair, without smoothing
#[derive(Debug, Clone, Copy)]
pub struct Bleu {
    max_order: usize,
}

impl Default for Bleu {
    fn default() -> Self {
        Self { max_order: 4 }
    }
}

impl Bleu {
    /// BLEU with a custom maximum n-gram order
    #[must_use]
    pub fn with_max_order(max_order: usize) -> Self {
        Self {
            max_order: max_order.max(1),
        }
    }
}

fn ngram_counts<'a>(tokens: &'a [&'a str], n: usize) -> HashMap<&'a [&'a str], usize> {
    let mut counts = HashMap::new();
    for gram in tokens.windows(n) {
        *counts.entry(gram).or_insert(0) += 1;
    }
    counts
}

impl MetricScorer for Bleu {
    fn name(&self) -> &'static str {
        "bleu"
    }

    #[allow(clippy::cast_precision_loss)]
    fn score(&self, prediction: &str, reference: &str) -> f64 {
        let hyp = tokenize_13a(prediction);
        let reference_tokens = tokenize_13a(reference);
        if hyp.is_empty() || reference_tokens.is_empty() {
            return 0.0;
        }

        let mut log_precision_sum = 0.0;
        for n in 1..=self.max_order {
            let hyp_counts = ngram_counts(&hyp, n);
            let ref_counts = ngram_counts(&reference_tokens, n);
            let possible = hyp.len().saturating_sub(n - 1);
            let matches: usize = hyp_counts
                .iter()
                .map(|(gram, count)| (*count).min(ref_counts.get(gram).copied().unwrap_or(0)))
                .sum();
            if possible == 0 || matches == 0 {
                return 0.0;
            }
            log_precision_sum += (matches as f64 / possible as f64).ln();
        }

        let geo_mean = (log_precision_sum / self.max_order as f64).exp();
        let (c, r) = (hyp.len() as f64, reference_tokens.len() as f64);
        let brevity = if c > r { 1.0 } else { (1.0 - r / c).exp() };
        geo_mean * brevity
    }
}

/// ROUGE-Lsum F-measure; sentences are separated by newlines
#[derive(Debug, Clone, Copy, Default)]
pub struct RougeLsum;

/// Indices into `reference` that take part in one LCS with `candidate`
fn lcs_reference_indices(reference: &[String], candidate: &[String]) -> Vec<usize> {
    let (rows, cols) = (reference.len(), candidate.len());
    let mut table = vec![vec![0_usize; cols + 1]; rows + 1];
    for i in 1..=rows {
        for j in 1..=cols {
            table[i][j] = if reference[i - 1] == candidate[j - 1] {
                table[i - 1][j - 1] + 1
            } else {
                table[i - 1][j].max(table[i][j - 1])
            };
        }
    }

    let mut hits = Vec::new();
    let (mut i, mut j) = (rows, cols);
    while i > 0 && j > 0 {
        if reference[i - 1] == candidate[j - 1] {
            hits.push(i - 1);
            i -= 1;
            j -= 1;
        } else if table[i - 1][j] >= table[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    hits
}

fn sentences(text: &str) -> Vec<Vec<String>> {
    text.lines()
        .map(word_tokens)
        .filter(|s| !s.is_empty())
        .collect()
}

impl MetricScorer for RougeLsum {
    fn name(&self) -> &'static str {
        "rouge"
    }

    #[allow(clippy::cast_precision_loss)]
    fn score(&self, prediction: &str, reference: &str) -> f64 {
        let candidate = sentences(prediction);
        let reference = sentences(reference);

        let mut pending_pred: HashMap<&str, usize> = HashMap::new();
        for token in candidate.iter().flatten() {
            *pending_pred.entry(token).or_insert(0) += 1;
        }
        let mut pending_ref: HashMap<&str, usize> = HashMap::new();
        for token in reference.iter().flatten() {
            *pending_ref.entry(token).or_insert(0) += 1;
        }

        let pred_total: usize = pending_pred.values().sum();
        let ref_total: usize = pending_ref.values().sum();
        if pred_total == 0 || ref_total == 0 {
            return 0.0;
        }

        let mut hits = 0_usize;
        for ref_sentence in &reference {
            let union: BTreeSet<usize> = candidate
                .iter()
                .flat_map(|cand| lcs_reference_indices(ref_sentence, cand))
                .collect();
            for idx in union {
                let token = ref_sentence[idx].as_str();
                match (pending_ref.get_mut(token), pending_pred.get_mut(token)) {
                    (Some(r), Some(p)) if *r > 0 && *p > 0 => {
                        *r -= 1;
                        *p -= 1;
                        hits += 1;
                    }
                    _ => {}
                }
            }
        }

        if hits == 0 {
            return 0.0;
        }
        let precision = hits as f64 / pred_total as f64;
        let recall = hits as f64 / ref_total as f64;
        2.0 * precision * recall / (precision + recall)
    }
}

/// BERTScore F1 over contextual token embeddings.
///
/// Each token is represented by the encoder's last hidden layer, so the
/// same word in a different context gets a different vector. Prediction
/// and reference tokens are greedily matched by cosine similarity; the
/// mean best match gives precision and recall.
///
/// Without an encoder, or when encoding fails, the score is 0.0.
#[derive(Clone, Default)]
pub struct BertScore {
    encoder: Option<Arc<dyn TokenEncoder>>,
}

impl std::fmt::Debug for BertScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BertScore")
            .field("encoder", &self.encoder.as_ref().map(|e| e.name().to_string()))
            .finish()
    }
}

impl BertScore {
    /// Score with the given encoder
    #[must_use]
    pub fn new(encoder: Arc<dyn TokenEncoder>) -> Self {
        Self {
            encoder: Some(encoder),
        }
    }

    /// No encoder; every pair scores 0.0
    #[must_use]
    pub const fn disabled() -> Self {
        Self { encoder: None }
    }

    /// Load a BERT checkpoint directory, falling back to [`Self::disabled`]
    #[must_use]
    pub fn load(model_dir: &Path) -> Self {
        match BertEncoder::load(model_dir) {
            Ok(encoder) => Self::new(Arc::new(encoder)),
            Err(e) => {
                tracing::warn!(
                    model = %model_dir.display(),
                    error = %e,
                    "cannot load BERTScore model, bertscore will be 0"
                );
                Self::disabled()
            }
        }
    }

    /// Whether an encoder is loaded
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.encoder.is_some()
    }
}

fn unit_vectors(vectors: &[Vec<f32>]) -> Vec<Vec<f32>> {
    vectors
        .iter()
        .map(|v| {
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > f32::EPSILON {
                v.iter().map(|x| x / norm).collect()
            } else {
                v.clone()
            }
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn greedy_match(from: &[Vec<f32>], to: &[Vec<f32>]) -> f64 {
    let total: f64 = from
        .iter()
        .map(|a| {
            to.iter()
                .map(|b| f64::from(a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>()))
                .fold(f64::NEG_INFINITY, f64::max)
        })
        .sum();
    total / from.len() as f64
}

/// Greedy cosine-matching F1 between two token-embedding sequences
#[must_use]
pub fn greedy_f1(prediction: &[Vec<f32>], reference: &[Vec<f32>]) -> f64 {
    if prediction.is_empty() || reference.is_empty() {
        return 0.0;
    }
    let (prediction, reference) = (unit_vectors(prediction), unit_vectors(reference));
    let precision = greedy_match(&prediction, &reference);
    let recall = greedy_match(&reference, &prediction);
    if precision + recall <= f64::EPSILON {
        return 0.0;
    }
    2.0 * precision * recall / (precision + recall)
}

impl MetricScorer for BertScore {
    fn name(&self) -> &'static str {
        "bertscore"
    }

    fn score(&self, prediction: &str, reference: &str) -> f64 {
        let Some(encoder) = &self.encoder else {
            return 0.0;
        };
        match (encoder.encode(prediction), encoder.encode(reference)) {
            (Ok(pred), Ok(reference)) => greedy_f1(&pred, &reference),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(model = encoder.name(), error = %e, "bertscore failed, scoring 0");
                0.0
            }
        }
    }
}

/// The three scoring engines, built once per process
#[derive(Clone)]
pub struct ScoringEngines {
    bleu: Arc<dyn MetricScorer>,
    rouge: Arc<dyn MetricScorer>,
    bertscore: Arc<dyn MetricScorer>,
}

impl std::fmt::Debug for ScoringEngines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoringEngines")
            .field("bleu", &self.bleu.name())
            .field("rouge", &self.rouge.name())
            .field("bertscore", &self.bertscore.name())
            .finish()
    }
}

impl Default for ScoringEngines {
    fn default() -> Self {
        Self::new()
    }
}

impl ScoringEngines {
    /// BLEU and ROUGE with BERTScore disabled
    #[must_use]
    pub fn new() -> Self {
        Self::with_bertscore(BertScore::disabled())
    }

    /// Build the engines, loading the BERTScore model when one is configured.
    ///
    /// A missing or unloadable model leaves `bertscore` at 0.0 for every
    /// example; the run itself continues.
    #[must_use]
    pub fn with_embedding_model(model_dir: Option<&Path>) -> Self {
        tracing::debug!("initializing scoring engines");
        let bertscore = if let Some(dir) = model_dir {
            BertScore::load(dir)
        } else {
            tracing::warn!("no BERTScore model configured (BENCH_BERTSCORE_MODEL), bertscore will be 0");
            BertScore::disabled()
        };
        Self::with_bertscore(bertscore)
    }

    /// Default BLEU and ROUGE with the given BERTScore engine
    #[must_use]
    pub fn with_bertscore(bertscore: BertScore) -> Self {
        Self::with_scorers(Arc::new(Bleu::default()), Arc::new(RougeLsum), Arc::new(bertscore))
    }

    /// Use custom engines
    #[must_use]
    pub fn with_scorers(
        bleu: Arc<dyn MetricScorer>,
        rouge: Arc<dyn MetricScorer>,
        bertscore: Arc<dyn MetricScorer>,
    ) -> Self {
        Self {
            bleu,
            rouge,
            bertscore,
        }
    }

    /// Score one pair on all three axes.
    ///
    /// Empty (after trimming) prediction or reference yields zeros without
    /// calling any engine. An engine that panics or returns a non-finite
    /// value scores 0.0.
    #[must_use]
    pub fn compute_all(&self, prediction: &str, reference: &str) -> MetricScores {
        let (prediction, reference) = (prediction.trim(), reference.trim());
        if prediction.is_empty() || reference.is_empty() {
            return MetricScores::default();
        }

        MetricScores {
            bleu: guarded(self.bleu.as_ref(), prediction, reference),
            rouge: guarded(self.rouge.as_ref(), prediction, reference),
            bertscore: guarded(self.bertscore.as_ref(), prediction, reference),
        }
    }
}

fn guarded(scorer: &dyn MetricScorer, prediction: &str, reference: &str) -> f64 {
    match catch_unwind(AssertUnwindSafe(|| scorer.score(prediction, reference))) {
        Ok(value) if value.is_finite() => value.clamp(0.0, 1.0),
        Ok(value) => {
            tracing::warn!(metric = scorer.name(), value, "non-finite metric, scoring 0");
            0.0
        }
        Err(_) => {
            tracing::warn!(metric = scorer.name(), "metric engine panicked, scoring 0");
            0.0
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::embeddings::EmbeddingError;

    struct Exploding;

    impl MetricScorer for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }
        fn score(&self, _: &str, _: &str) -> f64 {
            panic!("engine must not be called")
        }
    }

    struct NotANumber;

    impl MetricScorer for NotANumber {
        fn name(&self) -> &'static str {
            "nan"
        }
        fn score(&self, _: &str, _: &str) -> f64 {
            f64::NAN
        }
    }

    /// Encodes each word together with the word before it
    struct ContextEncoder;

    impl TokenEncoder for ContextEncoder {
        fn name(&self) -> &str {
            "context"
        }

        fn encode(&self, text: &str) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let words = word_tokens(text);
            let slot = |word: &str| usize::from(word.bytes().fold(0_u8, u8::wrapping_add)) % 32;
            Ok(words
                .iter()
                .enumerate()
                .map(|(i, word)| {
                    let mut v = vec![0.0_f32; 64];
                    v[slot(word)] = 1.0;
                    let previous = if i == 0 { "<s>" } else { words[i - 1].as_str() };
                    v[32 + slot(previous)] = 1.0;
                    v
                })
                .collect())
        }
    }

    struct FailingEncoder;

    impl TokenEncoder for FailingEncoder {
        fn name(&self) -> &str {
            "failing"
        }

        fn encode(&self, _: &str) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::Model("out of memory".to_string()))
        }
    }

    const REFERENCE: &str = "Bu ayki faturanız 150 TL olup son ödeme tarihi 15 Mayıs.";

    #[test]
    fn test_empty_inputs_short_circuit() {
        let engines = ScoringEngines::with_scorers(
            Arc::new(Exploding),
            Arc::new(Exploding),
            Arc::new(Exploding),
        );
        assert_eq!(engines.compute_all("", REFERENCE), MetricScores::default());
        assert_eq!(engines.compute_all("yanıt", "   "), MetricScores::default());
    }

    #[test]
    fn test_failing_engines_score_zero() {
        let engines = ScoringEngines::with_scorers(
            Arc::new(Exploding),
            Arc::new(NotANumber),
            Arc::new(RougeLsum),
        );
        let scores = engines.compute_all("merhaba dünya", "merhaba dünya");
        assert_eq!(scores.bleu, 0.0);
        assert_eq!(scores.rouge, 0.0);
        assert!((scores.bertscore - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_identical_texts_score_one() {
        let engines = ScoringEngines::with_bertscore(BertScore::new(Arc::new(ContextEncoder)));
        let scores = engines.compute_all(REFERENCE, REFERENCE);
        assert!((scores.bleu - 1.0).abs() < 1e-9, "{scores:?}");
        assert!((scores.rouge - 1.0).abs() < 1e-9, "{scores:?}");
        assert!((scores.bertscore - 1.0).abs() < 1e-5, "{scores:?}");
    }

    #[test]
    fn test_scores_in_unit_range() {
        let engines = ScoringEngines::with_bertscore(BertScore::new(Arc::new(ContextEncoder)));
        for prediction in [
            "Faturamı öğrenmek istiyorum",
            "150 TL",
            "{\"status\": \"success\"}",
            "tamamen alakasız bir cümle burada",
        ] {
            let s = engines.compute_all(prediction, REFERENCE);
            for value in [s.bleu, s.rouge, s.bertscore] {
                assert!((0.0..=1.0).contains(&value), "{prediction}: {s:?}");
            }
        }
    }

    #[test]
    fn test_bleu_short_hypothesis_is_zero() {
        // No 4-gram can match a three-token hypothesis.
        assert_eq!(Bleu::default().score("faturanız 150 TL", REFERENCE), 0.0);
        assert!(Bleu::with_max_order(1).score("faturanız 150 TL", REFERENCE) > 0.0);
    }

    #[test]
    fn test_bleu_brevity_penalty() {
        let reference = "a b c d e f g h";
        let full = Bleu::default().score(reference, reference);
        let short = Bleu::default().score("a b c d e", reference);
        assert!((full - 1.0).abs() < 1e-9);
        assert!(short < full);
        assert!(short > 0.0);
    }

    #[test]
    fn test_tokenize_13a_splits_punctuation() {
        assert_eq!(
            tokenize_13a("Merhaba, dünya!"),
            vec!["Merhaba", ",", "dünya", "!"]
        );
    }

    #[test]
    fn test_rouge_lsum_partial_overlap() {
        let score = RougeLsum.score("fatura 150 TL", "faturanız 150 TL olarak kesildi");
        // hits = 2 ("150", "tl"); precision 2/3, recall 2/5
        let expected = 2.0 * (2.0 / 3.0) * (2.0 / 5.0) / (2.0 / 3.0 + 2.0 / 5.0);
        assert!((score - expected).abs() < 1e-9, "{score}");
    }

    #[test]
    fn test_rouge_lsum_uses_sentence_union() {
        let reference = "paket değişti\nfatura ödendi";
        let reordered = "fatura ödendi\npaket değişti";
        assert!((RougeLsum.score(reordered, reference) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_casefold_turkish() {
        assert_eq!(casefold_tr("İSTANBUL"), "istanbul");
        assert_eq!(casefold_tr("IĞDIR"), "ığdır");
    }

    #[test]
    fn test_bertscore_is_word_order_sensitive() {
        let bertscore = BertScore::new(Arc::new(ContextEncoder));
        let same = bertscore.score("ali veliyi gördü", "ali veliyi gördü");
        let reordered = bertscore.score("ali veliyi gördü", "veliyi ali gördü");
        assert!((same - 1.0).abs() < 1e-9, "{same}");
        // each token keeps its word or its left neighbour, never both
        assert!((reordered - 0.5).abs() < 1e-9, "{reordered}");
    }

    #[test]
    fn test_bertscore_without_model_is_zero() {
        let engines = ScoringEngines::with_embedding_model(None);
        let scores = engines.compute_all(REFERENCE, REFERENCE);
        assert_eq!(scores.bertscore, 0.0);
        assert!((scores.bleu - 1.0).abs() < 1e-9);
        assert!(!BertScore::disabled().is_enabled());
    }

    #[test]
    fn test_bertscore_unloadable_model_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let bertscore = BertScore::load(dir.path());
        assert!(!bertscore.is_enabled());
        assert_eq!(bertscore.score("merhaba", "merhaba"), 0.0);
    }

    #[test]
    fn test_bertscore_encoder_failure_is_zero() {
        let engines = ScoringEngines::with_bertscore(BertScore::new(Arc::new(FailingEncoder)));
        let scores = engines.compute_all("merhaba dünya", "merhaba dünya");
        assert_eq!(scores.bertscore, 0.0);
        assert!((scores.rouge - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_greedy_f1_ignores_vector_length() {
        let pred = vec![vec![2.0, 0.0], vec![0.0, 3.0]];
        let reference = vec![vec![1.0, 0.0]];
        // precision (1 + 0) / 2, recall 1
        let expected = 2.0 * 0.5 * 1.0 / 1.5;
        assert!((greedy_f1(&pred, &reference) - expected).abs() < 1e-9);
        assert_eq!(greedy_f1(&[], &reference), 0.0);
    }
}
