use std::fmt;

/// An error raised by an embedder-supplied reducer.
///
/// Wraps an arbitrary `std::error::Error` so the engine never needs to know
/// the embedder's concrete error type.
#[derive(Debug)]
pub struct ReducerError(Box<dyn std::error::Error + Send + Sync + 'static>);

impl ReducerError {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        ReducerError(Box::new(err))
    }

    pub fn msg(message: impl Into<String>) -> Self {
        ReducerError(Box::new(StringError(message.into())))
    }
}

impl fmt::Display for ReducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reducer rejected event: {}", self.0)
    }
}

impl std::error::Error for ReducerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

#[derive(Debug)]
struct StringError(String);

impl fmt::Display for StringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StringError {}

/// An error raised by the engine itself, as opposed to the embedder's reducer.
#[derive(Debug)]
pub enum EngineError {
    /// A constructor argument was out of range, e.g. a zero snapshot interval.
    InvalidConfig(String),
    /// The reducer rejected an event during `dispatch`, `replay`,
    /// `insert_events`, or `remove_event`. The log and state are left exactly
    /// as they were before the call.
    Reducer(ReducerError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidConfig(msg) => write!(f, "invalid engine configuration: {msg}"),
            EngineError::Reducer(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::InvalidConfig(_) => None,
            EngineError::Reducer(err) => Some(err),
        }
    }
}

impl From<ReducerError> for EngineError {
    fn from(err: ReducerError) -> Self {
        EngineError::Reducer(err)
    }
}
