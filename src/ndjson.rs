//! Newline-delimited JSON: one document per line.

use std::sync::Arc;

use async_stream::stream;
use bytes::{Bytes, BytesMut};
use futures_core::stream::Stream;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesOrdered;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use crate::engine::{Document, EmitMode, Engine, EngineOptions};
use crate::error::{PoolError, QueryError, QuerySyntaxError};
use crate::pool::{settle, WorkRequest, WorkResponse, WorkerPool};

/// Reassembles lines from arbitrarily split chunks.
///
/// `\r` before a newline is dropped and blank lines are skipped. Lines are
/// numbered from 1 and skipped lines still count.
#[derive(Debug, Default)]
pub struct LineFramer {
    partial: BytesMut,
    seen: u64,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete lines found in `chunk` with their line numbers.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<(u64, Bytes)> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];
            self.seen += 1;
            if let Some(line) = trim_line(self.partial.split().freeze()) {
                lines.push((self.seen, line));
            }
        }
        self.partial.extend_from_slice(rest);
        lines
    }

    /// The last line when the input did not end with a newline.
    pub fn finish(&mut self) -> Option<(u64, Bytes)> {
        let line = trim_line(self.partial.split().freeze())?;
        self.seen += 1;
        Some((self.seen, line))
    }

    /// Bytes held back waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.partial.len()
    }
}

fn trim_line(mut line: Bytes) -> Option<Bytes> {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    if line.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(line)
    }
}

/// One projected NDJSON line. `line` is 1-based and counts blank lines.
#[derive(Debug)]
pub struct Record {
    pub line: u64,
    pub outcome: Result<Document, QueryError>,
}

/// Projects every line of `reader` with a single engine.
///
/// A bad line is reported in its [`Record`] and the stream moves on to the
/// next one. Read errors end the stream.
pub fn ndjson_stream<R>(
    reader: R,
    expression: &str,
    options: EngineOptions,
    chunk_size: usize,
) -> Result<impl Stream<Item = Result<Record, QueryError>>, QuerySyntaxError>
where
    R: AsyncRead + Send + 'static,
{
    let mut engine = Engine::from_query(expression, options)?;
    Ok(stream! {
        let mut chunks = Box::pin(ReaderStream::with_capacity(reader, chunk_size.max(1)));
        let mut framer = LineFramer::new();
        let mut records = 0u64;

        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(QueryError::Io(e));
                    return;
                }
            };
            for (line, bytes) in framer.push(&chunk) {
                records += 1;
                yield Ok(Record { line, outcome: engine.run_bytes(&bytes) });
            }
        }
        if let Some((line, bytes)) = framer.finish() {
            records += 1;
            yield Ok(Record { line, outcome: engine.run_bytes(&bytes) });
        }
        debug!(target: "jql::ndjson", records, "ndjson source exhausted");
    })
}

/// Projects every line on `pool`, yielding responses in input order.
///
/// Each response's `id` is the line number of its source line. At most
/// `pool.capacity()` lines are in flight, so submissions never overflow the
/// pool's queue unless other callers share it.
#[instrument(target = "jql::ndjson", skip(reader, pool), fields(workers = pool.size()))]
pub fn ndjson_parallel<R>(
    reader: R,
    expression: &str,
    pool: Arc<WorkerPool>,
    emit_mode: EmitMode,
    chunk_size: usize,
) -> impl Stream<Item = Result<WorkResponse, QueryError>>
where
    R: AsyncRead + Send + 'static,
{
    let query = expression.to_owned();
    stream! {
        let window = pool.capacity().max(1);
        let mut chunks = Box::pin(ReaderStream::with_capacity(reader, chunk_size.max(1)));
        let mut framer = LineFramer::new();
        let mut in_flight: FuturesOrdered<BoxFuture<'static, Result<WorkResponse, PoolError>>> = FuturesOrdered::new();
        let mut submitted = 0u64;
        let mut exhausted = false;

        while !exhausted {
            let lines = match chunks.next().await {
                Some(Ok(chunk)) => framer.push(&chunk),
                Some(Err(e)) => {
                    yield Err(QueryError::Io(e));
                    return;
                }
                None => {
                    exhausted = true;
                    framer.finish().into_iter().collect()
                }
            };
            for (id, line) in lines {
                if in_flight.len() >= window {
                    if let Some(done) = in_flight.next().await {
                        yield done.map_err(QueryError::Pool);
                    }
                }
                submitted += 1;
                let request = WorkRequest { id, line, query: query.clone(), emit_mode };
                in_flight.push_back(Box::pin(settle(pool.submit(request))));
            }
        }
        while let Some(done) = in_flight.next().await {
            yield done.map_err(QueryError::Pool);
        }
        debug!(target: "jql::ndjson", lines = submitted, "parallel ndjson source exhausted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(lines: Vec<(u64, Bytes)>) -> Vec<String> {
        lines.into_iter().map(|(_, l)| String::from_utf8(l.to_vec()).unwrap()).collect()
    }

    #[test]
    fn framer_joins_lines_split_across_chunks() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"{\"a\":").is_empty());
        assert_eq!(framer.buffered(), 5);
        assert_eq!(strs(framer.push(b"1}\n{\"a\"")), vec!["{\"a\":1}"]);
        assert_eq!(strs(framer.push(b":2}\n")), vec!["{\"a\":2}"]);
        assert!(framer.finish().is_none());
    }

    #[test]
    fn framer_strips_carriage_returns_and_blank_lines() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"1\r\n\r\n  \n2\n");
        let numbers: Vec<u64> = lines.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 4]);
        assert_eq!(strs(lines), vec!["1", "2"]);
    }

    #[test]
    fn framer_yields_unterminated_tail() {
        let mut framer = LineFramer::new();
        assert_eq!(strs(framer.push(b"[1]\n[2]")), vec!["[1]"]);
        let (line, tail) = framer.finish().unwrap();
        assert_eq!(line, 2);
        assert_eq!(&tail[..], b"[2]");
        assert!(framer.finish().is_none());
    }
}
