use courier_gateway::GatewayError;
use courier_store::StoreError;
use jsonrpsee::types::{
    error::{INTERNAL_ERROR_CODE, INVALID_PARAMS_CODE},
    ErrorObjectOwned,
};

/// Wrapper around [ErrorObjectOwned] that maps domain errors to JSON-RPC
/// error responses.
pub struct JsonRpcError(pub ErrorObjectOwned);

impl From<JsonRpcError> for ErrorObjectOwned {
    fn from(err: JsonRpcError) -> Self {
        err.0
    }
}

impl JsonRpcError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self(ErrorObjectOwned::owned(INVALID_PARAMS_CODE, message.into(), None::<bool>))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self(ErrorObjectOwned::owned(INTERNAL_ERROR_CODE, message.into(), None::<bool>))
    }
}

impl From<StoreError> for JsonRpcError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self(ErrorObjectOwned::owned(
                INVALID_PARAMS_CODE,
                "record not found".to_string(),
                None::<bool>,
            )),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<GatewayError> for JsonRpcError {
    fn from(err: GatewayError) -> Self {
        match err {
            // Node errors travel back to the client unchanged.
            GatewayError::Rpc { code, message } => {
                Self(ErrorObjectOwned::owned(code as i32, message, None::<bool>))
            }
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<eyre::Report> for JsonRpcError {
    fn from(err: eyre::Report) -> Self {
        Self::invalid_params(err.to_string())
    }
}
