use wagate_core::protocol::ProtocolError;
use wagate_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("instance name already in use: {0}")]
    NameTaken(String),

    #[error("invalid instance name: {0}")]
    InvalidName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("instance {0} is not connected")]
    NotConnected(String),

    /// The protocol client could not be opened or refused to connect.
    #[error("connection setup failed: {0}")]
    ConnectionSetup(#[source] ProtocolError),

    /// Upload or send failed after the typing choreography.
    #[error("delivery failed: {0}")]
    Delivery(#[source] ProtocolError),

    #[error("instance {0} has been removed")]
    Destroyed(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl InstanceError {
    /// Short classification string for logging and API error bodies.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NameTaken(_) => "name_taken",
            Self::InvalidName(_) => "invalid_name",
            Self::InvalidConfig(_) => "invalid_config",
            Self::NotConnected(_) => "not_connected",
            Self::ConnectionSetup(_) => "connection_setup",
            Self::Delivery(_) => "delivery",
            Self::Destroyed(_) => "destroyed",
            Self::Store(_) => "store",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_cause() {
        let err = InstanceError::Delivery(ProtocolError::Upload("media server 500".into()));
        assert_eq!(err.to_string(), "delivery failed: upload failed: media server 500");
    }

    #[test]
    fn store_errors_convert() {
        let err: InstanceError = StoreError::NotFound("instance x".into()).into();
        assert_eq!(err.error_kind(), "store");
    }

    #[test]
    fn kinds_are_distinct() {
        let kinds = [
            InstanceError::NotFound("a".into()).error_kind(),
            InstanceError::NameTaken("a".into()).error_kind(),
            InstanceError::NotConnected("a".into()).error_kind(),
            InstanceError::ConnectionSetup(ProtocolError::NotConnected).error_kind(),
        ];
        let unique: std::collections::HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }
}
