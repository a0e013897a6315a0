//! Benchmarks for the scoring engines

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use model_bench::metrics::{BertScore, Bleu, MetricScorer, RougeLsum};
use model_bench::schema::SchemaRegistry;
use model_bench::ScoringEngines;

const REFERENCE: &str = "Faturanız 150 TL olarak hesaplanmıştır.\n\
    Son ödeme tarihi ayın 25'idir. Otomatik ödeme talimatı verebilirsiniz.";

fn prediction(repeat: usize) -> String {
    "Bu ayki faturanız 150 TL. Son ödeme günü 25'i, otomatik ödeme talimatı verebilirsiniz.\n"
        .repeat(repeat)
}

fn benchmark_scorers(c: &mut Criterion) {
    let mut group = c.benchmark_group("scorers");
    let bleu = Bleu::default();
    let rouge = RougeLsum;
    // BERTScore is benched only when a checkpoint is available
    let bertscore = std::env::var_os("BENCH_BERTSCORE_MODEL")
        .map(|dir| BertScore::load(std::path::Path::new(&dir)))
        .filter(BertScore::is_enabled);

    for repeat in &[1, 8, 32] {
        let text = prediction(*repeat);
        group.bench_function(format!("bleu_x{repeat}"), |b| {
            b.iter(|| bleu.score(black_box(&text), black_box(REFERENCE)));
        });
        group.bench_function(format!("rouge_lsum_x{repeat}"), |b| {
            b.iter(|| rouge.score(black_box(&text), black_box(REFERENCE)));
        });
        if let Some(bertscore) = &bertscore {
            group.bench_function(format!("bertscore_x{repeat}"), |b| {
                b.iter(|| bertscore.score(black_box(&text), black_box(REFERENCE)));
            });
        }
    }

    group.finish();
}

fn benchmark_pipeline_stages(c: &mut Criterion) {
    let engines = ScoringEngines::new();
    let schemas = SchemaRegistry::builtin();
    let text = prediction(4);
    let json_reply = r#"Yanıt şu: {"status": "ok", "message": "Faturanız 150 TL", "recommendations": ["otomatik ödeme"]}"#;

    c.bench_function("compute_all", |b| {
        b.iter(|| engines.compute_all(black_box(&text), black_box(REFERENCE)));
    });
    c.bench_function("schema_validate_embedded_json", |b| {
        b.iter(|| schemas.validate(black_box(json_reply), None));
    });
}

criterion_group!(benches, benchmark_scorers, benchmark_pipeline_stages);
criterion_main!(benches);
