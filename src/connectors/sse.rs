//! SSE frame splitting for upstream byte streams.

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures_util::StreamExt;
use tracing::warn;

use crate::streaming::RawChunk;

/// Upper bound on a single buffered frame, guarding against upstreams that
/// never send a frame delimiter.
const MAX_SSE_BUFFER_SIZE: usize = 1024 * 1024;

/// Split an upstream byte stream into SSE frames, yielding one [`RawChunk`]
/// per `\n\n`-delimited frame. Transport errors terminate the stream.
pub fn sse_frames(
    source: BoxStream<'static, Result<Bytes, reqwest::Error>>,
) -> BoxStream<'static, RawChunk> {
    let framed = futures::stream::unfold(
        (source, BytesMut::new(), false),
        |(mut source, mut buffer, mut finished)| async move {
            loop {
                if let Some(frame) = split_frame(&mut buffer) {
                    return Some((Some(frame), (source, buffer, finished)));
                }
                if finished {
                    if buffer.is_empty() {
                        return None;
                    }
                    let rest = buffer.split().freeze();
                    return Some((Some(rest), (source, buffer, finished)));
                }
                match source.next().await {
                    Some(Ok(bytes)) => {
                        if buffer.len() + bytes.len() > MAX_SSE_BUFFER_SIZE {
                            warn!("SSE buffer cap exceeded, dropping oversized frame");
                            buffer.clear();
                        }
                        buffer.extend_from_slice(&bytes);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "upstream stream error");
                        finished = true;
                    }
                    None => {
                        finished = true;
                    }
                }
            }
        },
    );

    framed
        .filter_map(|frame| async move { frame.map(RawChunk::Bytes) })
        .boxed()
}

/// Take one `\n\n`-terminated frame off the front of `buffer`.
fn split_frame(buffer: &mut BytesMut) -> Option<Bytes> {
    let pos = buffer
        .windows(2)
        .position(|window| window == b"\n\n")?;
    let frame = buffer.split_to(pos + 2).freeze();
    Some(frame)
}
