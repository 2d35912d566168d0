use thiserror::Error;

/// Error type a sink callback may fail with.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("invalid literal at byte {offset}: expected `{expected}`, got `{found}`")]
    InvalidLiteral { expected: &'static str, found: String, offset: usize },
    #[error("invalid number `{text}` at byte {offset}")]
    InvalidNumber { text: String, offset: usize },
    #[error("unterminated string starting at byte {offset}")]
    UnterminatedString { offset: usize },
    #[error("unterminated literal starting at byte {offset}")]
    UnterminatedLiteral { offset: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StructuralError {
    #[error("unexpected {found} at byte {offset}, expected {expected}")]
    UnexpectedToken { found: &'static str, expected: &'static str, offset: usize },
    #[error("closing bracket at byte {offset} does not match the open container")]
    MismatchedClose { offset: usize },
    #[error("document truncated at byte {offset} with {depth} container(s) still open")]
    Truncated { depth: usize, offset: usize },
    #[error("trailing data after the document at byte {offset}")]
    TrailingData { offset: usize },
    #[error("empty document")]
    Empty,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuerySyntaxError {
    #[error("unexpected {found} at offset {offset}, expected {expected}")]
    UnexpectedChar { found: String, expected: &'static str, offset: usize },
    #[error("unterminated group at offset {offset}")]
    UnterminatedGroup { offset: usize },
    #[error("duplicate field `{name}` at offset {offset}")]
    DuplicateField { name: String, offset: usize },
    #[error("unexpected input after the query at offset {offset}")]
    TrailingInput { offset: usize },
}

impl QuerySyntaxError {
    /// Position in the expression text the error refers to.
    pub fn offset(&self) -> usize {
        match self {
            Self::UnexpectedChar { offset, .. }
            | Self::UnterminatedGroup { offset }
            | Self::DuplicateField { offset, .. }
            | Self::TrailingInput { offset } => *offset,
        }
    }
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("lexical error: {0}")]
    Lex(#[from] LexError),
    #[error("structural error: {0}")]
    Structural(#[from] StructuralError),
    #[error("query syntax error: {0}")]
    Syntax(#[from] QuerySyntaxError),
    #[error("sink callback failed: {0}")]
    Sink(#[source] SinkError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool terminated")]
    Terminated,
    #[error("worker pool queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },
    #[error("worker exited before responding")]
    WorkerLost,
}
