use thiserror::Error;
use tokio_util::codec::LinesCodecError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error, {0}")]
    Io(#[from] std::io::Error),
    #[error("line framing error, {0}")]
    Lines(#[from] LinesCodecError),
    #[error("failed to encode ack, {0}")]
    Serde(#[from] serde_json::Error),
}
