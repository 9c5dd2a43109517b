use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidConfig { key: &'static str, value: String },
}
