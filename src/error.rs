use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid isolation policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to provision sandbox after {attempts} attempts: {reason}")]
    Provision { attempts: u32, reason: String },

    #[error("Overloaded: {0}")]
    Overloaded(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for admission rejections, which callers surface as backpressure
    /// rather than as an execution outcome.
    pub fn is_overloaded(&self) -> bool {
        matches!(self, Error::Overloaded(_))
    }
}
