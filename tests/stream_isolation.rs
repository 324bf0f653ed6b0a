//! Parallel stream isolation: concurrent streams through one shared
//! processor chain must never observe each other's state.

use std::sync::Arc;

use futures::stream;
use futures_util::StreamExt;

use lpg::streaming::{
    ContentAccumulationProcessor, RawChunk, StreamChunk, StreamContext, StreamNormalizer,
    StreamProcessor, ToolCallRepairProcessor,
};

fn pipeline() -> Arc<StreamNormalizer> {
    let processors: Vec<Arc<dyn StreamProcessor>> = vec![
        Arc::new(ToolCallRepairProcessor::default()),
        Arc::new(ContentAccumulationProcessor::default()),
    ];
    Arc::new(StreamNormalizer::new(processors))
}

fn source(parts: Vec<&str>) -> futures::stream::BoxStream<'static, RawChunk> {
    stream::iter(
        parts
            .into_iter()
            .map(|p| RawChunk::Text(p.to_string()))
            .collect::<Vec<_>>(),
    )
    .boxed()
}

async fn run(
    normalizer: Arc<StreamNormalizer>,
    parts: Vec<&str>,
    session: &str,
) -> Vec<StreamChunk> {
    let ctx = StreamContext {
        session_id: Some(session.to_string()),
        ..Default::default()
    };
    normalizer.process_stream(source(parts), ctx).collect().await
}

// Two concurrent streams each carry a partial tool call; each output must
// contain only its own tool name.
#[tokio::test]
async fn test_concurrent_tool_call_repair_is_isolated() {
    let normalizer = pipeline();

    let a = run(
        normalizer.clone(),
        vec!["TOOL CA", "LL: alpha {\"v\": 1}"],
        "session-a",
    );
    let b = run(
        normalizer.clone(),
        vec!["TOOL CA", "LL: beta {\"v\": 2}"],
        "session-b",
    );
    let (out_a, out_b) = tokio::join!(a, b);

    let calls_a: Vec<String> = out_a
        .iter()
        .flat_map(|c| c.metadata.tool_calls.iter())
        .map(|c| c.function.name.clone())
        .collect();
    let calls_b: Vec<String> = out_b
        .iter()
        .flat_map(|c| c.metadata.tool_calls.iter())
        .map(|c| c.function.name.clone())
        .collect();

    assert_eq!(calls_a, vec!["alpha"]);
    assert_eq!(calls_b, vec!["beta"]);
}

// Interleaved execution must equal sequential execution.
#[tokio::test]
async fn test_interleaved_output_equals_sequential() {
    let parts_a = vec!["alpha one ", "alpha two"];
    let parts_b = vec!["beta one ", "beta two"];

    // Sequential baseline on a fresh pipeline.
    let fresh = pipeline();
    let seq_a = run(fresh.clone(), parts_a.clone(), "sa").await;
    let seq_b = run(fresh.clone(), parts_b.clone(), "sb").await;

    // Concurrent run on a shared pipeline.
    let shared = pipeline();
    let (con_a, con_b) = tokio::join!(
        run(shared.clone(), parts_a, "sa"),
        run(shared.clone(), parts_b, "sb")
    );

    let text = |chunks: &[StreamChunk]| -> String {
        chunks.iter().map(|c| c.content.as_str()).collect()
    };
    assert_eq!(text(&seq_a), text(&con_a));
    assert_eq!(text(&seq_b), text(&con_b));
    assert_eq!(text(&con_a), "alpha one alpha two");
    assert_eq!(text(&con_b), "beta one beta two");
}

// A hundred concurrent streams, all isolated.
#[tokio::test]
async fn test_many_concurrent_streams() {
    let normalizer = pipeline();
    let mut handles = Vec::new();

    for i in 0..100 {
        let normalizer = normalizer.clone();
        handles.push(tokio::spawn(async move {
            let marker = format!("stream-{i} payload");
            let ctx = StreamContext {
                session_id: Some(format!("s{i}")),
                ..Default::default()
            };
            let out: Vec<StreamChunk> = normalizer
                .process_stream(
                    stream::iter(vec![RawChunk::Text(marker.clone())]).boxed(),
                    ctx,
                )
                .collect()
                .await;
            (marker, out)
        }));
    }

    for handle in handles {
        let (marker, out) = handle.await.unwrap();
        let text: String = out.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(text, marker);
        assert_eq!(out.iter().filter(|c| c.is_done).count(), 1);
    }
}
