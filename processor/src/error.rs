use crate::request::RequestError;
use crate::status::StatusError;
use crate::tool::ToolError;
use broker::BrokerError;
use db::{FileKind, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("wire codec failure: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive failure: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("processing channel closed")]
    ChannelClosed,
    #[error("cannot process file kind {0}")]
    BadKind(FileKind),
}
