use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("cannot index an empty message batch")]
    EmptyThread,

    #[error("unknown message: {0}")]
    UnknownMessage(String),
}
