//! Latency benchmarks for the hot risk path.
//!
//! Run with: `cargo bench --bench latency`

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_decimal::Decimal;

use options_core::api::feed::parse_ticks;
use options_core::config::RiskConfig;
use options_core::types::{Instrument, Position, PositionSide};
use risk_manager::{PositionCache, RuleContext, RuleEngine};

fn active_position(instrument_id: &str) -> Position {
    let mut position = Position::new(
        Instrument::new("NFO", instrument_id, "NIFTY24MAY22500CE"),
        PositionSide::Long,
        Decimal::new(50, 0),
        Decimal::new(100, 0),
    )
    .with_stop(Decimal::new(90, 0))
    .with_target(Decimal::new(130, 0));
    // Activation of a fresh pending position cannot fail.
    let _ = position.activate();
    position
}

/// Benchmark the full rule chain on a position where no rule fires.
fn bench_rule_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("rules");
    let config = RiskConfig {
        session_close_at: None,
        ..RiskConfig::default()
    };
    let engine = RuleEngine::standard(&config).unwrap();

    let mut position = active_position("43512");
    position
        .apply_price(Decimal::new(104, 0), Utc::now())
        .unwrap();
    let now = Utc::now();

    group.bench_function("standard_no_exit", |b| {
        b.iter(|| {
            let ctx = RuleContext::new(black_box(&position), &config, now, None);
            black_box(engine.evaluate(&ctx))
        })
    });

    let mut losing = active_position("43512");
    losing.apply_price(Decimal::new(70, 0), Utc::now()).unwrap();
    group.bench_function("standard_stop_loss", |b| {
        b.iter(|| {
            let ctx = RuleContext::new(black_box(&losing), &config, now, None);
            black_box(engine.evaluate(&ctx))
        })
    });

    group.finish();
}

/// Benchmark repricing every position on one instrument.
fn bench_cache_update_price(c: &mut Criterion) {
    let mut group = c.benchmark_group("position_cache");

    for count in [1usize, 10, 100].iter() {
        let cache = PositionCache::new();
        for _ in 0..*count {
            cache.add(active_position("43512")).unwrap();
        }
        let mut tick = 0i64;

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("update_price", count), &cache, |b, cache| {
            b.iter(|| {
                tick = (tick + 1) % 50;
                black_box(cache.update_price(
                    "43512",
                    Decimal::new(9500 + tick, 2),
                    Utc::now(),
                ))
            })
        });
    }

    group.finish();
}

/// Benchmark PnL recomputation for a single price.
fn bench_apply_price(c: &mut Criterion) {
    let mut position = active_position("43512");
    c.bench_function("position_apply_price", |b| {
        b.iter(|| {
            position
                .apply_price(black_box(Decimal::new(10125, 2)), Utc::now())
                .unwrap();
        })
    });
}

/// Benchmark decoding feed frames.
fn bench_tick_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("feed");
    let single = r#"{"segment":"NFO","instrument_id":"43512","price":"96.5"}"#;
    let batch = format!(
        "[{}]",
        (0..50)
            .map(|i| format!(r#"{{"segment":"NFO","instrument_id":"{i}","price":"{i}.5"}}"#))
            .collect::<Vec<_>>()
            .join(",")
    );

    group.bench_function("parse_single", |b| b.iter(|| black_box(parse_ticks(black_box(single)))));
    group.throughput(Throughput::Elements(50));
    group.bench_function("parse_batch_50", |b| b.iter(|| black_box(parse_ticks(black_box(&batch)))));
    group.finish();
}

criterion_group!(
    benches,
    bench_rule_evaluation,
    bench_cache_update_price,
    bench_apply_price,
    bench_tick_parsing,
);

criterion_main!(benches);
