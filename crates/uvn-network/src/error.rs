use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("subnet {subnet} exhausted while allocating {what}")]
    SubnetExhausted { subnet: String, what: String },

    #[error("address {0} out of range for subnet {1}")]
    AddressOutOfRange(String, String),

    #[error("no free peer port on endpoint {endpoint} (limit {limit})")]
    PortsExhausted { endpoint: u16, limit: usize },
}

pub type Result<T> = std::result::Result<T, NetworkError>;
