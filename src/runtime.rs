//! Async drivers around [`Engine`]: one-shot queries with sink delivery and
//! long-lived subscriptions over chunked byte streams.

use std::sync::Arc;

use async_stream::stream;
use bytes::Bytes;
use futures_core::stream::Stream;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};

use crate::engine::{Document, EmitMode, Engine, EngineOptions, Match, RawMatch};
use crate::error::{QueryError, QuerySyntaxError};
use crate::sink::{Sink, Stats};

/// Default read size for stream adapters.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone, Default)]
pub struct QueryOptions {
    pub emit_mode: EmitMode,
    pub sink: Option<Arc<dyn Sink>>,
}

impl QueryOptions {
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn raw(mut self) -> Self {
        self.emit_mode = EmitMode::Raw;
        self
    }

    fn engine_options(&self) -> EngineOptions {
        EngineOptions { emit_mode: self.emit_mode, ..EngineOptions::default() }
    }
}

/// Result of [`query`]. When a sink is configured it receives the matches and
/// both `result` and `raw` stay empty.
#[derive(Debug)]
pub struct QueryOutcome {
    pub result: Option<Value>,
    pub raw: Vec<RawMatch>,
    pub stats: Stats,
}

/// Compiles `expression`, projects `buffer` and delivers the output.
#[instrument(target = "jql::runtime", skip(buffer, options), fields(len = buffer.len()))]
pub async fn query(buffer: &[u8], expression: &str, options: QueryOptions) -> Result<QueryOutcome, QueryError> {
    let mut engine = Engine::from_query(expression, options.engine_options())?;
    let document = engine.run(buffer)?;
    complete(document, options.sink.as_deref()).await
}

/// [`query`] over a shared buffer; raw matches borrow its storage.
pub async fn query_bytes(buffer: Bytes, expression: &str, options: QueryOptions) -> Result<QueryOutcome, QueryError> {
    let mut engine = Engine::from_query(expression, options.engine_options())?;
    let document = engine.run_bytes(&buffer)?;
    complete(document, options.sink.as_deref()).await
}

async fn complete(document: Document, sink: Option<&dyn Sink>) -> Result<QueryOutcome, QueryError> {
    let stats = document.stats;
    let Some(sink) = sink else {
        let raw = document.raw_matches().cloned().collect();
        return Ok(QueryOutcome { result: document.into_value(), raw, stats });
    };

    deliver(sink, document.matches).await?;
    sink.on_stats(stats).await.map_err(QueryError::Sink)?;
    sink.on_drain().await.map_err(QueryError::Sink)?;
    Ok(QueryOutcome { result: None, raw: Vec::new(), stats })
}

/// Hands `matches` to the sink and waits until every callback has settled.
///
/// Callbacks are started in document order and run concurrently; their
/// completion order is unspecified. A failing callback does not stop the
/// others: all of them settle before the first error is returned.
pub async fn deliver(sink: &dyn Sink, matches: Vec<Match>) -> Result<(), QueryError> {
    if matches.is_empty() {
        return Ok(());
    }
    let count = matches.len();
    let mut in_flight: FuturesUnordered<_> = matches
        .into_iter()
        .map(|m| match m {
            Match::Value(value) => sink.on_match(value),
            Match::Raw(raw) => sink.on_raw_match(raw),
        })
        .collect();

    let mut first_error = None;
    while let Some(settled) = in_flight.next().await {
        if let Err(e) = settled {
            warn!(target: "jql::runtime", error = %e, "sink callback failed");
            first_error.get_or_insert(e);
        }
    }
    debug!(target: "jql::runtime", count, "sink callbacks settled");
    match first_error {
        Some(e) => Err(QueryError::Sink(e)),
        None => Ok(()),
    }
}

/// Streams matches out of a chunked byte source as soon as they close.
///
/// Several whitespace-separated root values may follow each other in the
/// source. The stream ends after the first error.
pub fn subscribe<S>(
    chunks: S,
    expression: &str,
    options: EngineOptions,
) -> Result<impl Stream<Item = Result<Match, QueryError>>, QuerySyntaxError>
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
{
    let mut engine = Engine::from_query(expression, options)?;
    Ok(stream! {
        let mut chunks = Box::pin(chunks);
        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(QueryError::Io(e));
                    return;
                }
            };
            let processed = engine.process_bytes(&chunk);
            // Records that closed before a failure are still delivered first.
            for m in engine.take_matches() {
                yield Ok(m);
            }
            if let Err(e) = processed {
                yield Err(e);
                return;
            }
        }
        let finished = engine.finish();
        for m in engine.take_matches() {
            yield Ok(m);
        }
        if let Err(e) = finished {
            yield Err(e);
            return;
        }
        debug!(target: "jql::runtime", stats = ?engine.stats(), "subscription source exhausted");
    })
}

/// [`subscribe`] over any `AsyncRead`.
pub fn subscribe_reader<R>(
    reader: R,
    expression: &str,
    options: EngineOptions,
    chunk_size: usize,
) -> Result<impl Stream<Item = Result<Match, QueryError>>, QuerySyntaxError>
where
    R: AsyncRead + Send + 'static,
{
    subscribe(ReaderStream::with_capacity(reader, chunk_size.max(1)), expression, options)
}

/// Handle to a background subscription started with [`spawn_subscription`].
pub struct Subscription {
    handle: JoinHandle<Result<Stats, QueryError>>,
}

impl Subscription {
    /// Stops reading. Matches already handed to the sink are not recalled.
    pub fn unsubscribe(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the source to end and every callback to settle.
    pub async fn join(self) -> Result<Stats, QueryError> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => {
                Err(QueryError::Io(std::io::Error::new(std::io::ErrorKind::Interrupted, "subscription cancelled")))
            }
            Err(e) => Err(QueryError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))),
        }
    }
}

/// Drives a chunked source in a background task, delivering matches to
/// `sink` chunk by chunk. `on_stats` and `on_drain` fire once the source is
/// exhausted and all callbacks have settled.
pub fn spawn_subscription<S>(
    chunks: S,
    expression: &str,
    options: EngineOptions,
    sink: Arc<dyn Sink>,
) -> Result<Subscription, QuerySyntaxError>
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
{
    let mut engine = Engine::from_query(expression, options)?;
    let handle = tokio::spawn(async move {
        let mut chunks = Box::pin(chunks);
        while let Some(chunk) = chunks.next().await {
            engine.process_bytes(&chunk?)?;
            deliver(sink.as_ref(), engine.take_matches()).await?;
        }
        engine.finish()?;
        deliver(sink.as_ref(), engine.take_matches()).await?;

        let stats = engine.stats();
        sink.on_stats(stats).await.map_err(QueryError::Sink)?;
        sink.on_drain().await.map_err(QueryError::Sink)?;
        Ok::<_, QueryError>(stats)
    });
    Ok(Subscription { handle })
}
