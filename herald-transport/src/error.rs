use herald_core::BusError;

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("engine: {0}")]
    Engine(#[from] BusError),

    #[error("broker error: {reason}")]
    Broker { reason: String },

    #[error("subscription closed: group={group}")]
    SubscriptionClosed { group: String },
}

pub type TransportResult<T> = Result<T, TransportError>;
