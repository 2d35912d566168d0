use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::trace;

use crate::error::LexError;

/// Strings shorter than this many raw bytes go through the [`StringCache`].
pub const STRING_CACHE_MAX_LEN: usize = 32;
/// Number of distinct short strings the cache keeps before freezing.
pub const STRING_CACHE_CAPACITY: usize = 500;

/// Half-open byte range `[start, end)` measured from the last `reset()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

/// Numeric payload of a number token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    /// Digit-only run, accumulated without decoding to text.
    Int(u64),
    NegInt(i64),
    Float(f64),
}

impl Number {
    pub fn to_json(self) -> Value {
        match self {
            Number::Int(n) => Value::from(n),
            Number::NegInt(n) => Value::from(n),
            Number::Float(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        }
    }
}

/// Token type plus payload. String payloads borrow from the lexer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenKind<'a> {
    ObjectOpen,
    ObjectClose,
    ArrayOpen,
    ArrayClose,
    Colon,
    Comma,
    String(&'a str),
    Number(Number),
    True,
    False,
    Null,
    End,
}

impl TokenKind<'_> {
    /// Short human-readable name used in error messages.
    pub fn describe(&self) -> &'static str {
        match self {
            TokenKind::ObjectOpen => "'{'",
            TokenKind::ObjectClose => "'}'",
            TokenKind::ArrayOpen => "'['",
            TokenKind::ArrayClose => "']'",
            TokenKind::Colon => "':'",
            TokenKind::Comma => "','",
            TokenKind::String(_) => "string",
            TokenKind::Number(_) => "number",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Null => "null",
            TokenKind::End => "end of input",
        }
    }
}

/// One lexical token.
///
/// A token is only valid until the lexer produces the next one: the string
/// payload points into the lexer's reusable text slot (or its cache). Copy the
/// payload out (`to_owned()`) if it has to outlive the callback or pull.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub span: Span,
}

/// Fixed-capacity map from raw key bytes to decoded text.
///
/// Once `capacity` entries are stored the cache freezes: misses are decoded
/// directly and nothing is inserted or evicted afterwards.
#[derive(Debug)]
pub struct StringCache {
    map: HashMap<Box<[u8]>, Arc<str>>,
    capacity: usize,
    max_len: usize,
    hits: u64,
}

impl StringCache {
    pub fn new(capacity: usize, max_len: usize) -> Self {
        Self { map: HashMap::with_capacity(capacity.min(STRING_CACHE_CAPACITY)), capacity, max_len, hits: 0 }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.map.len() >= self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Returns the shared text for `raw`, or `None` when the caller has to
    /// decode it itself (too long, or a miss after the cache froze).
    fn intern(&mut self, raw: &[u8]) -> Option<Arc<str>> {
        if raw.len() >= self.max_len {
            return None;
        }
        if let Some(hit) = self.map.get(raw) {
            self.hits += 1;
            return Some(Arc::clone(hit));
        }
        if self.is_full() {
            return None;
        }
        let text: Arc<str> = Arc::from(String::from_utf8_lossy(raw).as_ref());
        self.map.insert(raw.into(), Arc::clone(&text));
        Some(text)
    }
}

impl Default for StringCache {
    fn default() -> Self {
        Self::new(STRING_CACHE_CAPACITY, STRING_CACHE_MAX_LEN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Literal {
    True,
    False,
    Null,
}

impl Literal {
    fn spelling(self) -> &'static str {
        match self {
            Literal::True => "true",
            Literal::False => "false",
            Literal::Null => "null",
        }
    }

    fn kind(self) -> TokenKind<'static> {
        match self {
            Literal::True => TokenKind::True,
            Literal::False => TokenKind::False,
            Literal::Null => TokenKind::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    String,
    StringEscape,
    Number,
    Literal(Literal),
}

/// Token recognized by `step`, not yet borrowed out of the lexer.
#[derive(Debug, Clone, Copy)]
enum Ready {
    Punct(TokenKind<'static>),
    String,
    Number(Number),
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Consumed,
    Emit(Ready),
    /// Token finished by a byte that belongs to the next token.
    Reconsume(Ready),
}

#[derive(Debug)]
enum TextSlot {
    Shared(Arc<str>),
    Owned(String),
}

impl TextSlot {
    fn as_str(&self) -> &str {
        match self {
            TextSlot::Shared(s) => s.as_ref(),
            TextSlot::Owned(s) => s.as_str(),
        }
    }
}

fn is_number_byte(b: u8) -> bool {
    matches!(b, b'0'..=b'9' | b'.' | b'e' | b'E' | b'-' | b'+')
}

/// Byte-level, chunk-resumable JSON lexer.
///
/// Partial tokens (an unterminated string, number or literal) survive across
/// `process_chunk` calls. Bytes that start no token in the idle state are
/// dropped without error.
#[derive(Debug)]
pub struct Lexer {
    state: State,
    scratch: Vec<u8>,
    text: TextSlot,
    pos: usize,
    start: usize,
    cache: StringCache,
}

impl Default for Lexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Lexer {
    pub fn new() -> Self {
        Self::with_cache(StringCache::default())
    }

    pub fn with_cache(cache: StringCache) -> Self {
        Self {
            state: State::Idle,
            scratch: Vec::with_capacity(64),
            text: TextSlot::Owned(String::new()),
            pos: 0,
            start: 0,
            cache,
        }
    }

    /// Clears in-progress token state and offsets. The string cache is kept.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.scratch.clear();
        self.pos = 0;
        self.start = 0;
    }

    /// Absolute offset of the next byte to be consumed.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn cache(&self) -> &StringCache {
        &self.cache
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// True when no partial token is pending.
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Start offset of the partial token carried into the next chunk, if any.
    pub fn pending_start(&self) -> Option<usize> {
        (self.state != State::Idle).then_some(self.start)
    }

    /// Push interface: calls `on_token` for every token completed inside
    /// `chunk`. The callback may abort lexing by returning an error.
    pub fn process_chunk<F, E>(&mut self, chunk: &[u8], mut on_token: F) -> Result<(), E>
    where
        F: FnMut(Token<'_>) -> Result<(), E>,
        E: From<LexError>,
    {
        let mut scanner = self.scan(chunk);
        while let Some(token) = scanner.next_token() {
            on_token(token.map_err(E::from)?)?;
        }
        Ok(())
    }

    /// Pull interface over one chunk.
    pub fn scan<'l, 'c>(&'l mut self, chunk: &'c [u8]) -> Scanner<'l, 'c> {
        Scanner { lexer: self, chunk, cursor: 0 }
    }

    /// Signals that no more bytes will arrive: flushes a pending number,
    /// rejects unterminated strings and literals, then emits `End`.
    pub fn finish<F, E>(&mut self, mut on_token: F) -> Result<(), E>
    where
        F: FnMut(Token<'_>) -> Result<(), E>,
        E: From<LexError>,
    {
        match self.state {
            State::Idle => {}
            State::Number => {
                let number = self.parse_number().map_err(E::from)?;
                self.state = State::Idle;
                on_token(self.token(Ready::Number(number)))?;
            }
            State::String | State::StringEscape => {
                return Err(E::from(LexError::UnterminatedString { offset: self.start }));
            }
            State::Literal(_) => {
                return Err(E::from(LexError::UnterminatedLiteral { offset: self.start }));
            }
        }
        self.start = self.pos;
        trace!(target: "jql::lexer", offset = self.pos, "end of input");
        on_token(self.token(Ready::Punct(TokenKind::End)))
    }

    fn step(&mut self, byte: u8) -> Result<Step, LexError> {
        let at = self.pos;
        match self.state {
            State::Idle => {
                self.pos += 1;
                let kind = match byte {
                    b'{' => TokenKind::ObjectOpen,
                    b'}' => TokenKind::ObjectClose,
                    b'[' => TokenKind::ArrayOpen,
                    b']' => TokenKind::ArrayClose,
                    b':' => TokenKind::Colon,
                    b',' => TokenKind::Comma,
                    b'"' => {
                        self.begin(State::String, at);
                        return Ok(Step::Consumed);
                    }
                    b't' => return Ok(self.begin_literal(Literal::True, byte, at)),
                    b'f' => return Ok(self.begin_literal(Literal::False, byte, at)),
                    b'n' => return Ok(self.begin_literal(Literal::Null, byte, at)),
                    b'0'..=b'9' | b'-' => {
                        self.begin(State::Number, at);
                        self.scratch.push(byte);
                        return Ok(Step::Consumed);
                    }
                    // Whitespace, and anything else that cannot start a token.
                    _ => return Ok(Step::Consumed),
                };
                self.start = at;
                Ok(Step::Emit(Ready::Punct(kind)))
            }
            State::String => {
                self.pos += 1;
                match byte {
                    b'"' => {
                        self.decode_string();
                        self.state = State::Idle;
                        Ok(Step::Emit(Ready::String))
                    }
                    b'\\' => {
                        self.state = State::StringEscape;
                        Ok(Step::Consumed)
                    }
                    _ => {
                        self.scratch.push(byte);
                        Ok(Step::Consumed)
                    }
                }
            }
            State::StringEscape => {
                // The escaped byte is kept as-is; no escape decoding.
                self.pos += 1;
                self.scratch.push(byte);
                self.state = State::String;
                Ok(Step::Consumed)
            }
            State::Number => {
                if is_number_byte(byte) {
                    self.pos += 1;
                    self.scratch.push(byte);
                    return Ok(Step::Consumed);
                }
                let number = self.parse_number()?;
                self.state = State::Idle;
                Ok(Step::Reconsume(Ready::Number(number)))
            }
            State::Literal(literal) => {
                self.pos += 1;
                self.scratch.push(byte);
                let spelling = literal.spelling();
                if self.scratch.len() < spelling.len() {
                    return Ok(Step::Consumed);
                }
                if self.scratch != spelling.as_bytes() {
                    return Err(LexError::InvalidLiteral {
                        expected: spelling,
                        found: String::from_utf8_lossy(&self.scratch).into_owned(),
                        offset: self.start,
                    });
                }
                self.state = State::Idle;
                Ok(Step::Emit(Ready::Punct(literal.kind())))
            }
        }
    }

    fn begin(&mut self, state: State, at: usize) {
        self.state = state;
        self.scratch.clear();
        self.start = at;
    }

    fn begin_literal(&mut self, literal: Literal, first: u8, at: usize) -> Step {
        self.begin(State::Literal(literal), at);
        self.scratch.push(first);
        Step::Consumed
    }

    fn decode_string(&mut self) {
        if let Some(shared) = self.cache.intern(&self.scratch) {
            self.text = TextSlot::Shared(shared);
            return;
        }
        let decoded = String::from_utf8_lossy(&self.scratch);
        match &mut self.text {
            TextSlot::Owned(buf) => {
                buf.clear();
                buf.push_str(&decoded);
            }
            slot => *slot = TextSlot::Owned(decoded.into_owned()),
        }
    }

    fn parse_number(&self) -> Result<Number, LexError> {
        let bytes = &self.scratch;
        if bytes.iter().all(u8::is_ascii_digit) {
            let mut acc: u64 = 0;
            let fits = bytes.iter().all(|&d| {
                match acc.checked_mul(10).and_then(|v| v.checked_add(u64::from(d - b'0'))) {
                    Some(v) => {
                        acc = v;
                        true
                    }
                    None => false,
                }
            });
            if fits {
                return Ok(Number::Int(acc));
            }
        }

        let text = String::from_utf8_lossy(bytes);
        if let Ok(n) = text.parse::<i64>() {
            return Ok(Number::NegInt(n));
        }
        match text.parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(Number::Float(f)),
            _ => Err(LexError::InvalidNumber { text: text.into_owned(), offset: self.start }),
        }
    }

    fn token(&self, ready: Ready) -> Token<'_> {
        let kind = match ready {
            Ready::Punct(kind) => kind,
            Ready::String => TokenKind::String(self.text.as_str()),
            Ready::Number(n) => TokenKind::Number(n),
        };
        Token { kind, span: Span::new(self.start, self.pos) }
    }
}

/// Lending pull iterator over the tokens of one chunk.
///
/// Each token returned by [`Scanner::next_token`] borrows the scanner and is
/// gone at the next pull.
pub struct Scanner<'l, 'c> {
    lexer: &'l mut Lexer,
    chunk: &'c [u8],
    cursor: usize,
}

impl Scanner<'_, '_> {
    pub fn next_token(&mut self) -> Option<Result<Token<'_>, LexError>> {
        while self.cursor < self.chunk.len() {
            let byte = self.chunk[self.cursor];
            match self.lexer.step(byte) {
                Err(e) => {
                    self.cursor = self.chunk.len();
                    return Some(Err(e));
                }
                Ok(Step::Consumed) => self.cursor += 1,
                Ok(Step::Emit(ready)) => {
                    self.cursor += 1;
                    return Some(Ok(self.lexer.token(ready)));
                }
                Ok(Step::Reconsume(ready)) => return Some(Ok(self.lexer.token(ready))),
            }
        }
        None
    }

    /// Bytes of the chunk not yet consumed.
    pub fn remaining(&self) -> usize {
        self.chunk.len() - self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_chunks(lexer: &mut Lexer, chunks: &[&[u8]]) -> Result<Vec<String>, LexError> {
        let mut out = Vec::new();
        for chunk in chunks {
            lexer.process_chunk(chunk, |t| {
                out.push(format!("{:?}@{}..{}", t.kind, t.span.start, t.span.end));
                Ok::<_, LexError>(())
            })?;
        }
        lexer.finish(|t| {
            out.push(format!("{:?}@{}..{}", t.kind, t.span.start, t.span.end));
            Ok::<_, LexError>(())
        })?;
        Ok(out)
    }

    #[test]
    fn tokens_with_spans() {
        let mut lexer = Lexer::new();
        let tokens = lex_chunks(&mut lexer, &[br#"{"a": [1, true, null]}"#]).unwrap();
        assert_eq!(
            tokens,
            vec![
                "ObjectOpen@0..1",
                "String(\"a\")@1..4",
                "Colon@4..5",
                "ArrayOpen@6..7",
                "Number(Int(1))@7..8",
                "Comma@8..9",
                "True@10..14",
                "Comma@14..15",
                "Null@16..20",
                "ArrayClose@20..21",
                "ObjectClose@21..22",
                "End@22..22",
            ]
        );
    }

    #[test]
    fn partial_tokens_resume_across_chunks() {
        let whole = lex_chunks(&mut Lexer::new(), &[br#"{"name":"Leanne","n":-12.5,"ok":false}"#]).unwrap();
        let split = lex_chunks(
            &mut Lexer::new(),
            &[br#"{"na"#, br#"me":"Lea"#, br#"nne","n":-1"#, br#"2.5,"ok":fa"#, br#"lse}"#],
        )
        .unwrap();
        assert_eq!(whole, split);
    }

    #[test]
    fn number_at_end_of_input_is_flushed_by_finish() {
        let tokens = lex_chunks(&mut Lexer::new(), &[b"42"]).unwrap();
        assert_eq!(tokens, vec!["Number(Int(42))@0..2", "End@2..2"]);
    }

    #[test]
    fn number_paths() {
        let tokens = lex_chunks(&mut Lexer::new(), &[b"[7, -3, 1.5e2, 18446744073709551616]"]).unwrap();
        assert_eq!(tokens[1], "Number(Int(7))@1..2");
        assert_eq!(tokens[3], "Number(NegInt(-3))@4..6");
        assert_eq!(tokens[5], "Number(Float(150.0))@8..13");
        assert!(tokens[7].starts_with("Number(Float("));
    }

    #[test]
    fn invalid_number_reports_start_offset() {
        let err = lex_chunks(&mut Lexer::new(), &[b"[1, 2-3]"]).unwrap_err();
        assert_eq!(err, LexError::InvalidNumber { text: "2-3".into(), offset: 4 });
    }

    #[test]
    fn invalid_literal_reports_start_offset() {
        let err = lex_chunks(&mut Lexer::new(), &[b"[1, trux]"]).unwrap_err();
        assert_eq!(err, LexError::InvalidLiteral { expected: "true", found: "trux".into(), offset: 4 });
    }

    #[test]
    fn unterminated_string_detected_at_finish() {
        let err = lex_chunks(&mut Lexer::new(), &[br#"{"abc"#]).unwrap_err();
        assert_eq!(err, LexError::UnterminatedString { offset: 1 });
    }

    #[test]
    fn unrecognized_idle_bytes_are_ignored() {
        let tokens = lex_chunks(&mut Lexer::new(), &[b"[@1#]"]).unwrap();
        assert_eq!(tokens, vec!["ArrayOpen@0..1", "Number(Int(1))@2..3", "ArrayClose@4..5", "End@5..5"]);
    }

    #[test]
    fn escapes_pass_the_next_byte_through() {
        let tokens = lex_chunks(&mut Lexer::new(), &[br#""a\"b\nc""#]).unwrap();
        assert_eq!(tokens[0], "String(\"a\\\"bnc\")@0..9");
    }

    #[test]
    fn cache_freezes_when_full() {
        let mut lexer = Lexer::with_cache(StringCache::new(2, STRING_CACHE_MAX_LEN));
        lex_chunks(&mut lexer, &[br#"["a","b","c","a"]"#]).unwrap();
        assert_eq!(lexer.cache_len(), 2);
        assert!(lexer.cache().is_full());
        assert_eq!(lexer.cache().hits(), 1);

        lexer.reset();
        let tokens = lex_chunks(&mut lexer, &[br#"["c","d"]"#]).unwrap();
        assert_eq!(lexer.cache_len(), 2);
        assert_eq!(tokens[1], "String(\"c\")@1..4");
        assert_eq!(tokens[3], "String(\"d\")@5..8");
    }

    #[test]
    fn long_strings_bypass_cache() {
        let long = format!("\"{}\"", "x".repeat(STRING_CACHE_MAX_LEN));
        let mut lexer = Lexer::new();
        lex_chunks(&mut lexer, &[long.as_bytes()]).unwrap();
        assert_eq!(lexer.cache_len(), 0);
    }

    #[test]
    fn reset_restarts_offsets_but_keeps_cache() {
        let mut lexer = Lexer::new();
        lex_chunks(&mut lexer, &[br#"{"k":1}"#]).unwrap();
        lexer.reset();
        assert_eq!(lexer.position(), 0);
        assert_eq!(lexer.cache_len(), 1);
        let tokens = lex_chunks(&mut lexer, &[br#"{"k":1}"#]).unwrap();
        assert_eq!(tokens[1], "String(\"k\")@1..4");
    }

    #[test]
    fn pull_scanner_yields_same_tokens() {
        let mut lexer = Lexer::new();
        let mut kinds = Vec::new();
        let mut scanner = lexer.scan(br#"{"a":"b"}"#);
        while let Some(token) = scanner.next_token() {
            let token = token.unwrap();
            kinds.push(format!("{:?}", token.kind));
        }
        assert_eq!(kinds, vec!["ObjectOpen", "String(\"a\")", "Colon", "String(\"b\")", "ObjectClose"]);
    }
}
