//! Performance benchmarks for a3s-local-model
//!
//! Run with: cargo bench

use a3s_local_model::frame::decode_line;
use a3s_local_model::{
    FrameStream, PermissionGateway, PermissionMode, ReplyFrame, ResponseAggregator, UsageStats,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

const TEXT_LINE: &str = r#"{"type":"text-delta","text":"The quick brown fox jumps over the lazy dog. "}"#;
const TOOL_LINE: &str = r#"{"type":"tool-call-request","id":"toolu_01","name":"Bash","input":{"command":"cargo test --workspace","timeout":120000}}"#;
const USAGE_LINE: &str = r#"{"type":"usage-final","input_tokens":1532,"output_tokens":408,"cache_read_input_tokens":12000,"total_cost_usd":0.0132,"service_tier":"standard"}"#;

fn bench_decode(c: &mut Criterion) {
    c.bench_function("decode text-delta", |b| {
        b.iter(|| decode_line(1, TEXT_LINE).unwrap());
    });
    c.bench_function("decode tool-call-request", |b| {
        b.iter(|| decode_line(1, TOOL_LINE).unwrap());
    });
    c.bench_function("decode usage-final", |b| {
        b.iter(|| decode_line(1, USAGE_LINE).unwrap());
    });
}

fn turn_frames(deltas: usize) -> Vec<ReplyFrame> {
    let mut frames: Vec<ReplyFrame> = (0..deltas)
        .map(|i| ReplyFrame::TextDelta {
            text: format!("chunk {} ", i),
        })
        .collect();
    frames.push(ReplyFrame::UsageFinal(UsageStats::tokens(100, deltas as u64)));
    frames.push(ReplyFrame::EndOfTurn {
        session_id: Some("bench".into()),
        stop_reason: None,
    });
    frames
}

fn bench_aggregate(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let gateway = Arc::new(PermissionGateway::new(
        ["Read"],
        ["Bash"],
        PermissionMode::Default,
    ));

    let mut group = c.benchmark_group("aggregate");
    for deltas in [10usize, 100, 1000] {
        let frames = turn_frames(deltas);
        group.bench_with_input(BenchmarkId::from_parameter(deltas), &frames, |b, frames| {
            b.to_async(&rt).iter(|| {
                let frames = frames.clone();
                let gateway = Arc::clone(&gateway);
                async move {
                    let (sink, stream) = FrameStream::channel(64);
                    tokio::spawn(async move {
                        for frame in frames {
                            sink.send(frame).await;
                        }
                    });
                    ResponseAggregator::new(gateway)
                        .aggregate(stream)
                        .await
                        .unwrap()
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decode, bench_aggregate);
criterion_main!(benches);
