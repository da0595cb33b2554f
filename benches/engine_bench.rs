//! Benchmarks for the soundscape engine.
//!
//! Run with: cargo bench
//!
//! Reference timing at 48kHz sample rate:
//!   - 128 samples = 2.67ms deadline
//!   - 512 samples = 10.67ms deadline
//!
//! Benchmark groups:
//!   - engine/moods    One block of a full mood: timers, scheduling, voices, master chain
//!   - engine/churn    Switching moods back and forth while rendering
//!   - engine/patterns Pattern text parsing

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use moodscape::sequencing::{Duration, Pattern};
use moodscape::{EngineConfig, MoodTable, OfflineSession};

const SAMPLE_RATE: f32 = 48_000.0;

/// Block sizes a host is likely to ask for.
const BLOCK_SIZES: &[usize] = &[128, 512];

fn session(mood: &str, block: usize) -> Option<OfflineSession> {
    let moods = MoodTable::builtin().ok()?;
    let mut session = OfflineSession::new(EngineConfig::default(), moods, SAMPLE_RATE).with_block_size(block);
    session.orchestrator_mut().set_playing(true, Some(mood));
    // past the first lookahead window so voices are sounding
    session.advance(1.0);
    Some(session)
}

fn bench_moods(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine/moods");
    let keys: Vec<String> = match MoodTable::builtin() {
        Ok(moods) => moods.keys().map(str::to_string).collect(),
        Err(_) => return,
    };

    for &size in BLOCK_SIZES {
        let seconds = size as f64 / SAMPLE_RATE as f64;
        for key in &keys {
            let Some(mut session) = session(key, size) else {
                continue;
            };
            group.bench_with_input(BenchmarkId::new(key.as_str(), size), &size, |b, _| {
                b.iter(|| black_box(session.render(black_box(seconds))))
            });
        }
    }
    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine/churn");
    let keys: Vec<String> = match MoodTable::builtin() {
        Ok(moods) => moods.keys().map(str::to_string).collect(),
        Err(_) => return,
    };
    let Some(mut session) = keys.first().and_then(|k| session(k, 128)) else {
        return;
    };

    let mut next = 0;
    group.bench_function("change_mood", |b| {
        b.iter(|| {
            next = (next + 1) % keys.len();
            session.orchestrator_mut().change_mood(&keys[next], false);
            session.advance(black_box(0.05));
        })
    });
    group.finish();
}

fn bench_patterns(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine/patterns");
    for text in ["C3 A2 F2 G2", "C5 [E5 G5] _ B4:0.4@3 [D5 [F5 A5]] _ G4 _"] {
        group.bench_with_input(BenchmarkId::new("parse", text.len()), &text, |b, text| {
            b.iter(|| black_box(Pattern::parse(black_box(text), Duration::EIGHTH)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_moods, bench_churn, bench_patterns);
criterion_main!(benches);
