//! Token-driven projection engine.
//!
//! The engine walks the lexer's tokens with a stack of open containers. Each
//! frame is governed by a selection [`Group`]; values of unselected keys are
//! consumed by a depth counter without being built, Leaf values are kept
//! verbatim (or delivered as source byte spans in raw mode) and Nested values
//! push a frame governed by the child group.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, trace};

use crate::error::{QueryError, QuerySyntaxError, StructuralError};
use crate::lexer::{Lexer, Span, StringCache, Token, TokenKind, STRING_CACHE_CAPACITY, STRING_CACHE_MAX_LEN};
use crate::selection::{compile, Group, Selection};
use crate::sink::Stats;

/// How matches are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmitMode {
    /// Parsed values, projected into the selection's shape.
    #[default]
    #[serde(alias = "object")]
    Materialize,
    /// Exact source bytes of every matched Leaf value.
    Raw,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub emit_mode: EmitMode,
    pub string_cache_capacity: usize,
    pub string_cache_max_len: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            emit_mode: EmitMode::Materialize,
            string_cache_capacity: STRING_CACHE_CAPACITY,
            string_cache_max_len: STRING_CACHE_MAX_LEN,
        }
    }
}

impl EngineOptions {
    pub fn raw() -> Self {
        Self { emit_mode: EmitMode::Raw, ..Self::default() }
    }
}

/// Source bytes of one matched Leaf value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMatch {
    /// Name of the selected field.
    pub key: String,
    pub span: Span,
    pub bytes: Bytes,
}

impl RawMatch {
    /// Parses the captured bytes as a standalone JSON value.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::from_slice(&self.bytes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Match {
    /// A projected record: the root value, or one element of a root array.
    Value(Value),
    Raw(RawMatch),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RootShape {
    Single,
    Array,
}

/// Outcome of running one complete document.
#[derive(Debug)]
pub struct Document {
    pub matches: Vec<Match>,
    pub stats: Stats,
    shape: Option<RootShape>,
    mode: EmitMode,
}

impl Document {
    /// Reassembles the projected root value. `None` in raw mode.
    pub fn into_value(self) -> Option<Value> {
        if self.mode == EmitMode::Raw {
            return None;
        }
        let mut values = self.matches.into_iter().filter_map(|m| match m {
            Match::Value(v) => Some(v),
            Match::Raw(_) => None,
        });
        match self.shape? {
            RootShape::Single => values.next(),
            RootShape::Array => Some(Value::Array(values.collect())),
        }
    }

    pub fn raw_matches(&self) -> impl Iterator<Item = &RawMatch> {
        self.matches.iter().filter_map(|m| match m {
            Match::Raw(raw) => Some(raw),
            Match::Value(_) => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    KeyOrClose,
    Key,
    Colon,
    Value,
    ValueOrClose,
    CommaOrClose,
}

#[derive(Debug)]
enum Pending {
    None,
    /// Selected field, by position in the governing group.
    Field(usize),
    /// Key inside a verbatim (Leaf) object.
    Key(String),
    Skip,
}

#[derive(Debug)]
enum Out {
    /// Raw mode: nothing is built.
    Nothing,
    /// One slot per field of the governing group, in group order.
    Slots(Vec<Option<Value>>),
    Map(Map<String, Value>),
    Items(Vec<Value>),
    /// Root array: each finished element becomes a record.
    Records,
}

#[derive(Debug)]
struct Frame {
    container: Container,
    /// `None` inside a Leaf value, where everything is kept.
    group: Option<Arc<Group>>,
    expect: Expect,
    pending: Pending,
    out: Out,
}

#[derive(Debug)]
enum Disposition {
    Skip,
    Keep,
    RawLeaf(String),
    Nested(Arc<Group>),
}

/// Bracket depth counter used for skipped values and raw captures.
#[derive(Debug, Clone, Copy)]
struct DepthRun {
    depth: usize,
    start: usize,
}

impl DepthRun {
    fn new(start: usize) -> Self {
        Self { depth: 1, start }
    }

    /// Returns true once the matching close has been seen.
    fn advance(&mut self, kind: &TokenKind<'_>) -> bool {
        match kind {
            TokenKind::ObjectOpen | TokenKind::ArrayOpen => self.depth += 1,
            TokenKind::ObjectClose | TokenKind::ArrayClose => self.depth -= 1,
            _ => {}
        }
        self.depth == 0
    }
}

#[derive(Debug)]
struct RawCapture {
    key: String,
    run: DepthRun,
}

/// The chunk currently being lexed.
struct Window<'a> {
    bytes: &'a [u8],
    /// Absolute offset of `bytes[0]`.
    base: usize,
    shared: Option<&'a Bytes>,
}

impl Window<'_> {
    fn slice(&self, span: Span) -> Bytes {
        let range = (span.start - self.base)..(span.end - self.base);
        match self.shared {
            Some(shared) => shared.slice(range),
            None => Bytes::copy_from_slice(&self.bytes[range]),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    matched: u64,
    processed: u64,
    skipped: u64,
    started: Option<Instant>,
    finished: Option<Instant>,
}

#[derive(Debug)]
struct Walker {
    root: Arc<Group>,
    mode: EmitMode,
    stack: Vec<Frame>,
    skip: Option<DepthRun>,
    raw: Option<RawCapture>,
    /// Bytes of a raw capture that began in an earlier chunk.
    carry: Vec<u8>,
    matches: Vec<Match>,
    counters: Counters,
    roots: usize,
    shape: Option<RootShape>,
    single_document: bool,
}

fn unexpected(token: &Token<'_>, expected: &'static str) -> QueryError {
    StructuralError::UnexpectedToken { found: token.kind.describe(), expected, offset: token.span.start }.into()
}

/// Checks that `token` can start a scalar value and optionally builds it.
fn scalar(token: &Token<'_>, build: bool) -> Result<Option<Value>, QueryError> {
    let value = match token.kind {
        TokenKind::String(s) if build => Value::String(s.to_owned()),
        TokenKind::Number(n) if build => n.to_json(),
        TokenKind::True if build => Value::Bool(true),
        TokenKind::False if build => Value::Bool(false),
        TokenKind::Null if build => Value::Null,
        TokenKind::String(_) | TokenKind::Number(_) | TokenKind::True | TokenKind::False | TokenKind::Null => {
            return Ok(None)
        }
        _ => return Err(unexpected(token, "value")),
    };
    Ok(Some(value))
}

impl Walker {
    fn new(root: Arc<Group>, mode: EmitMode) -> Self {
        Self {
            root,
            mode,
            stack: Vec::new(),
            skip: None,
            raw: None,
            carry: Vec::new(),
            matches: Vec::new(),
            counters: Counters::default(),
            roots: 0,
            shape: None,
            single_document: false,
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.skip = None;
        self.raw = None;
        self.carry.clear();
        self.matches.clear();
        self.counters = Counters::default();
        self.roots = 0;
        self.shape = None;
        self.single_document = false;
    }

    fn materialize(&self) -> bool {
        self.mode == EmitMode::Materialize
    }

    fn on_token(&mut self, token: Token<'_>, window: &Window<'_>) -> Result<(), QueryError> {
        if let TokenKind::End = token.kind {
            return self.end_of_input(token.span.start);
        }

        if let Some(mut run) = self.skip.take() {
            if run.advance(&token.kind) {
                self.counters.skipped += (token.span.end - run.start) as u64;
                self.value_done(None);
            } else {
                self.skip = Some(run);
            }
            return Ok(());
        }

        if let Some(mut capture) = self.raw.take() {
            if capture.run.advance(&token.kind) {
                let span = Span::new(capture.run.start, token.span.end);
                self.deliver_raw(capture.key, span, window);
                self.value_done(None);
            } else {
                self.raw = Some(capture);
            }
            return Ok(());
        }

        let Some(frame) = self.stack.last_mut() else {
            return self.begin_root(token, window);
        };

        match (frame.container, frame.expect) {
            (Container::Object, Expect::KeyOrClose | Expect::Key) => match token.kind {
                TokenKind::String(key) => {
                    frame.pending = match &frame.group {
                        Some(group) => group.lookup(key).map_or(Pending::Skip, |(i, _)| Pending::Field(i)),
                        None => Pending::Key(key.to_owned()),
                    };
                    frame.expect = Expect::Colon;
                    Ok(())
                }
                TokenKind::ObjectClose if frame.expect == Expect::KeyOrClose => self.close_frame(&token),
                TokenKind::ArrayClose => Err(StructuralError::MismatchedClose { offset: token.span.start }.into()),
                _ if frame.expect == Expect::KeyOrClose => Err(unexpected(&token, "string or '}'")),
                _ => Err(unexpected(&token, "string")),
            },
            (Container::Object, Expect::Colon) => match token.kind {
                TokenKind::Colon => {
                    frame.expect = Expect::Value;
                    Ok(())
                }
                _ => Err(unexpected(&token, "':'")),
            },
            (Container::Array, Expect::ValueOrClose) if matches!(token.kind, TokenKind::ArrayClose) => {
                self.close_frame(&token)
            }
            (_, Expect::Value | Expect::ValueOrClose) => {
                let disposition = self.disposition();
                self.begin_value(disposition, &token, window)
            }
            (container, Expect::CommaOrClose) => match token.kind {
                TokenKind::Comma => {
                    frame.expect = match container {
                        Container::Object => Expect::Key,
                        Container::Array => Expect::Value,
                    };
                    Ok(())
                }
                TokenKind::ObjectClose | TokenKind::ArrayClose => self.close_frame(&token),
                _ => Err(unexpected(&token, "',' or closing bracket")),
            },
            (Container::Array, _) => Err(unexpected(&token, "value")),
        }
    }

    fn begin_root(&mut self, token: Token<'_>, window: &Window<'_>) -> Result<(), QueryError> {
        if self.single_document && self.roots > 0 {
            return Err(StructuralError::TrailingData { offset: token.span.start }.into());
        }
        self.shape = Some(match token.kind {
            TokenKind::ArrayOpen => RootShape::Array,
            _ => RootShape::Single,
        });
        // The root is governed by the top-level group, like a Nested field.
        let disposition = Disposition::Nested(Arc::clone(&self.root));
        self.begin_value(disposition, &token, window)
    }

    /// How the value about to be read in the top frame is treated.
    fn disposition(&self) -> Disposition {
        let Some(frame) = self.stack.last() else {
            return Disposition::Nested(Arc::clone(&self.root));
        };
        let Some(group) = &frame.group else {
            return Disposition::Keep;
        };
        match (frame.container, &frame.pending) {
            (Container::Array, _) => Disposition::Nested(Arc::clone(group)),
            (Container::Object, Pending::Field(i)) => {
                let field = &group.fields()[*i];
                match &field.selection {
                    Selection::Leaf if self.materialize() => Disposition::Keep,
                    Selection::Leaf => Disposition::RawLeaf(field.name.clone()),
                    Selection::Nested(child) => Disposition::Nested(Arc::clone(child)),
                }
            }
            (Container::Object, _) => Disposition::Skip,
        }
    }

    fn begin_value(&mut self, disposition: Disposition, token: &Token<'_>, window: &Window<'_>) -> Result<(), QueryError> {
        let span = token.span;
        let opens = match token.kind {
            TokenKind::ObjectOpen => Some(Container::Object),
            TokenKind::ArrayOpen => Some(Container::Array),
            _ => None,
        };

        match (disposition, opens) {
            (Disposition::Skip, Some(_)) => self.skip = Some(DepthRun::new(span.start)),
            (Disposition::Skip, None) => {
                scalar(token, false)?;
                self.counters.skipped += span.len() as u64;
                self.value_done(None);
            }
            (Disposition::RawLeaf(key), Some(_)) => {
                self.raw = Some(RawCapture { key, run: DepthRun::new(span.start) });
            }
            (Disposition::RawLeaf(key), None) => {
                scalar(token, false)?;
                self.deliver_raw(key, span, window);
                self.value_done(None);
            }
            (Disposition::Keep, Some(container)) => {
                let out = match container {
                    Container::Object => Out::Map(Map::new()),
                    Container::Array => Out::Items(Vec::new()),
                };
                self.push(container, None, out);
            }
            (Disposition::Keep, None) => {
                let value = scalar(token, true)?;
                self.value_done(value);
            }
            (Disposition::Nested(group), Some(container)) => {
                let out = match (container, self.materialize()) {
                    (_, false) => Out::Nothing,
                    (Container::Object, true) => Out::Slots(vec![None; group.len()]),
                    (Container::Array, true) if self.stack.is_empty() => Out::Records,
                    (Container::Array, true) => Out::Items(Vec::new()),
                };
                self.push(container, Some(group), out);
            }
            (Disposition::Nested(_), None) => {
                // Scalars under a Nested selection pass through untouched.
                let value = scalar(token, self.materialize())?;
                self.value_done(value);
            }
        }
        Ok(())
    }

    fn push(&mut self, container: Container, group: Option<Arc<Group>>, out: Out) {
        let expect = match container {
            Container::Object => Expect::KeyOrClose,
            Container::Array => Expect::ValueOrClose,
        };
        self.stack.push(Frame { container, group, expect, pending: Pending::None, out });
    }

    fn close_frame(&mut self, token: &Token<'_>) -> Result<(), QueryError> {
        let Some(frame) = self.stack.pop() else {
            return Err(unexpected(token, "value"));
        };
        let closes = matches!(
            (frame.container, &token.kind),
            (Container::Object, TokenKind::ObjectClose) | (Container::Array, TokenKind::ArrayClose)
        );
        if !closes {
            return Err(StructuralError::MismatchedClose { offset: token.span.start }.into());
        }

        let value = match frame.out {
            Out::Slots(slots) => {
                let mut map = Map::new();
                if let Some(group) = &frame.group {
                    for (field, slot) in group.fields().iter().zip(slots) {
                        if let Some(value) = slot {
                            map.insert(field.name.clone(), value);
                        }
                    }
                }
                Some(Value::Object(map))
            }
            Out::Map(map) => Some(Value::Object(map)),
            Out::Items(items) => Some(Value::Array(items)),
            Out::Records | Out::Nothing => None,
        };
        self.value_done(value);
        Ok(())
    }

    /// Attaches a finished value to the enclosing frame.
    fn value_done(&mut self, value: Option<Value>) {
        let Some(frame) = self.stack.last_mut() else {
            self.root_done(value);
            return;
        };
        frame.expect = Expect::CommaOrClose;
        let pending = std::mem::replace(&mut frame.pending, Pending::None);
        let Some(value) = value else {
            return;
        };
        match (&mut frame.out, pending) {
            (Out::Slots(slots), Pending::Field(i)) => slots[i] = Some(value),
            (Out::Map(map), Pending::Key(key)) => {
                // Duplicate keys: last one wins.
                map.insert(key, value);
            }
            (Out::Items(items), _) => items.push(value),
            (Out::Records, _) => {
                self.matches.push(Match::Value(value));
                self.counters.matched += 1;
            }
            _ => {}
        }
    }

    fn root_done(&mut self, value: Option<Value>) {
        self.roots += 1;
        if let Some(value) = value {
            self.matches.push(Match::Value(value));
            self.counters.matched += 1;
        }
        trace!(target: "jql::engine", roots = self.roots, "root value complete");
    }

    fn deliver_raw(&mut self, key: String, span: Span, window: &Window<'_>) {
        let bytes = if span.start >= window.base {
            window.slice(span)
        } else {
            let mut buf = std::mem::take(&mut self.carry);
            buf.extend_from_slice(&window.bytes[..span.end - window.base]);
            Bytes::from(buf)
        };
        self.matches.push(Match::Raw(RawMatch { key, span, bytes }));
        self.counters.matched += 1;
    }

    fn awaiting_raw_leaf(&self) -> bool {
        self.skip.is_none()
            && self.raw.is_none()
            && self.stack.last().map_or(false, |f| f.expect == Expect::Value)
            && matches!(self.disposition(), Disposition::RawLeaf(_))
    }

    /// Keeps the bytes of a raw capture that continues into the next chunk.
    fn end_chunk(&mut self, window: &Window<'_>, pending_token: Option<usize>) {
        let retain = match &self.raw {
            Some(capture) => Some(capture.run.start),
            None => pending_token.filter(|_| self.awaiting_raw_leaf()),
        };
        match retain {
            Some(start) => {
                let from = start.saturating_sub(window.base);
                self.carry.extend_from_slice(&window.bytes[from..]);
            }
            None => self.carry.clear(),
        }
    }

    fn end_of_input(&mut self, offset: usize) -> Result<(), QueryError> {
        let open = self.stack.len()
            + self.skip.map_or(0, |run| run.depth)
            + self.raw.as_ref().map_or(0, |capture| capture.run.depth);
        if open > 0 {
            return Err(StructuralError::Truncated { depth: open, offset }.into());
        }
        if self.single_document && self.roots == 0 {
            return Err(StructuralError::Empty.into());
        }
        Ok(())
    }
}

/// Projection engine for one compiled selection.
///
/// An engine is reusable across documents through [`Engine::reset`] (or the
/// implicit reset in [`Engine::run`]) but must not be driven by two documents
/// at once.
#[derive(Debug)]
pub struct Engine {
    lexer: Lexer,
    walker: Walker,
}

impl Engine {
    pub fn new(selection: impl Into<Arc<Group>>, options: EngineOptions) -> Self {
        let cache = StringCache::new(options.string_cache_capacity, options.string_cache_max_len);
        Self { lexer: Lexer::with_cache(cache), walker: Walker::new(selection.into(), options.emit_mode) }
    }

    pub fn from_query(expression: &str, options: EngineOptions) -> Result<Self, QuerySyntaxError> {
        Ok(Self::new(compile(expression)?, options))
    }

    pub fn selection(&self) -> &Group {
        &self.walker.root
    }

    pub fn emit_mode(&self) -> EmitMode {
        self.walker.mode
    }

    /// Current container nesting depth.
    pub fn depth(&self) -> usize {
        self.walker.stack.len()
    }

    pub fn lexer(&self) -> &Lexer {
        &self.lexer
    }

    /// Clears stack, lexer and per-document counters. Keeps the selection and
    /// the string cache.
    pub fn reset(&mut self) {
        self.lexer.reset();
        self.walker.reset();
    }

    /// Feeds the next chunk of a streaming source. Several root values in a
    /// row are accepted; finished matches accumulate until `take_matches`.
    pub fn process_chunk(&mut self, chunk: &[u8]) -> Result<(), QueryError> {
        self.feed(chunk, None)
    }

    /// Like `process_chunk`; raw matches are zero-copy slices of `chunk`.
    pub fn process_bytes(&mut self, chunk: &Bytes) -> Result<(), QueryError> {
        self.feed(chunk, Some(chunk))
    }

    fn feed(&mut self, chunk: &[u8], shared: Option<&Bytes>) -> Result<(), QueryError> {
        let Self { lexer, walker } = self;
        walker.counters.started.get_or_insert_with(Instant::now);
        walker.counters.processed += chunk.len() as u64;

        let window = Window { bytes: chunk, base: lexer.position(), shared };
        lexer.process_chunk(chunk, |token| walker.on_token(token, &window))?;
        walker.end_chunk(&window, lexer.pending_start());
        trace!(target: "jql::engine", len = chunk.len(), depth = walker.stack.len(), "chunk processed");
        Ok(())
    }

    /// Signals end of input. Fails if the document is truncated.
    pub fn finish(&mut self) -> Result<(), QueryError> {
        let Self { lexer, walker } = self;
        let window = Window { bytes: &[], base: lexer.position(), shared: None };
        lexer.finish(|token| walker.on_token(token, &window))?;
        walker.counters.finished = Some(Instant::now());
        Ok(())
    }

    /// Drains the matches produced so far, in document order.
    pub fn take_matches(&mut self) -> Vec<Match> {
        std::mem::take(&mut self.walker.matches)
    }

    pub fn stats(&self) -> Stats {
        let c = &self.walker.counters;
        let elapsed = match (c.started, c.finished) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Default::default(),
        };
        Stats::new(c.matched, c.processed, c.skipped, elapsed)
    }

    /// Runs one complete document. Resets the engine first.
    #[instrument(target = "jql::engine", skip(self, buffer), fields(len = buffer.len()))]
    pub fn run(&mut self, buffer: &[u8]) -> Result<Document, QueryError> {
        self.run_with(buffer, None)
    }

    /// `run` over a shared buffer; raw matches slice it without copying.
    pub fn run_bytes(&mut self, buffer: &Bytes) -> Result<Document, QueryError> {
        self.run_with(buffer, Some(buffer))
    }

    fn run_with(&mut self, buffer: &[u8], shared: Option<&Bytes>) -> Result<Document, QueryError> {
        self.reset();
        self.walker.single_document = true;
        self.feed(buffer, shared)?;
        self.finish()?;

        let stats = self.stats();
        debug!(
            target: "jql::engine",
            matched = stats.matched_count,
            skip_ratio = stats.skip_ratio,
            duration_ms = stats.duration_ms,
            "document complete"
        );
        Ok(Document { matches: self.take_matches(), stats, shape: self.walker.shape, mode: self.walker.mode })
    }

    /// Runs one document and returns the projected root value (`None` in raw
    /// mode).
    pub fn execute(&mut self, buffer: &[u8]) -> Result<Option<Value>, QueryError> {
        Ok(self.run(buffer)?.into_value())
    }
}
