use std::fmt;

pub type SendableError = Box<dyn std::error::Error + Send + Sync>;

/// Error carrying a dotted code (`worker.queue.build`) and a human message.
#[derive(Debug)]
pub struct RuntimeError {
    code: String,
    message: String,
}

impl RuntimeError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// Boxes the error so it can be returned with `?` from `SendableError` functions.
    pub fn boxed(code: impl Into<String>, message: impl fmt::Display) -> SendableError {
        Box::new(Self::new(code, message.to_string()))
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RuntimeError {}
