use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid broker uri {0}")]
    InvalidUri(String),
    #[error("no exchange declared with name {0}")]
    NoExchange(String),
    #[error("no queue declared with name {0}")]
    NoQueue(String),
    #[error("exchange {0} already declared with a different type")]
    ExchangeMismatch(String),
    #[error("consumer canceled before a reply arrived")]
    Canceled,
    #[error("encode/decode failure: {0}")]
    Codec(#[from] serde_json::Error),
}
