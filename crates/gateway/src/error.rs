use thiserror::Error;

/// Errors surfaced by the chain gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A JSON-RPC error response from the node.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Transport or middleware failure without a structured response.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("abi error: {0}")]
    Abi(String),

    #[error("timed out waiting for transaction")]
    TxWaitTimeout,
}

impl GatewayError {
    /// Whether a broadcast failure is worth retrying: the node-side
    /// catch-all code or an underfunded sponsor, both of which can clear
    /// up on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Rpc { code, message } => {
                *code == -32000 || message.contains("insufficient funds")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_broadcast_errors() {
        let catch_all = GatewayError::Rpc { code: -32000, message: "nonce too low".into() };
        assert!(catch_all.is_transient());

        let underfunded = GatewayError::Rpc {
            code: -32003,
            message: "insufficient funds for gas * price + value".into(),
        };
        assert!(underfunded.is_transient());

        let permanent =
            GatewayError::Rpc { code: 3, message: "execution reverted".into() };
        assert!(!permanent.is_transient());

        let transport = GatewayError::Provider("connection reset".into());
        assert!(!transport.is_transient());
    }
}
