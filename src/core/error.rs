use thiserror::Error;

/// Core error types for the simulator
///
/// Every variant is recoverable: the dispatcher renders it as a message and
/// no session state is mutated by the failing call.
#[derive(Debug, Error)]
pub enum Error {
    /// Input validation failed (malformed address, port, protocol or target)
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Chain name is not one of INPUT, OUTPUT, FORWARD
    #[error("Invalid chain: {0}. Use INPUT, OUTPUT, or FORWARD")]
    InvalidChain(String),

    /// 1-based rule index outside the chain
    #[error("Invalid rule number {index} for {chain} chain (has {len} rules)")]
    InvalidIndex {
        chain: String,
        index: usize,
        len: usize,
    },

    /// Terminal name is not one of the fixed roles
    #[error("Unknown terminal: {0}")]
    UnknownTerminal(String),

    /// An identical rule already exists in the chain
    #[error("iptables: Rule already exists in {chain} chain")]
    DuplicateRule { chain: String },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_names_field() {
        let err = Error::validation("ip", "Invalid IP address: 300.1.1.1");
        assert_eq!(
            err.to_string(),
            "Validation error in ip: Invalid IP address: 300.1.1.1"
        );
    }

    #[test]
    fn test_invalid_chain_suggests_valid_names() {
        let err = Error::InvalidChain("PREROUTING".to_string());
        let msg = err.to_string();
        assert!(msg.contains("PREROUTING"));
        assert!(msg.contains("FORWARD"));
    }

    #[test]
    fn test_invalid_index_reports_bounds() {
        let err = Error::InvalidIndex {
            chain: "INPUT".to_string(),
            index: 4,
            len: 2,
        };
        assert!(err.to_string().contains("has 2 rules"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
