//! Error surface for the HTTP layer. Every failure carries a taxonomy code
//! the transport translates verbatim; resource errors also carry the
//! required/available amounts.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use matching::Sats;
use serde::Serialize;

use crate::lightning::InvoiceError;
use crate::maker::MakerError;
use crate::models::{LedgerError, MarketError, OrderError, WithdrawalError};

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub available: Option<Sats>,
    pub required: Option<Sats>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    available: Option<Sats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    required: Option<Sats>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            available: None,
            required: None,
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    fn insufficient_funds(message: String, available: Sats, required: Sats) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INSUFFICIENT_FUNDS",
            message,
            available: Some(available),
            required: Some(required),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, "{}", self.message);
        }
        let body = ErrorBody {
            error: self.message,
            code: self.code,
            available: self.available,
            required: self.required,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        let message = err.to_string();
        match err {
            OrderError::InvalidSide => Self::bad_request("INVALID_SIDE", message),
            OrderError::InvalidPrice(_) => Self::bad_request("INVALID_PRICE", message),
            OrderError::AmountTooSmall(_) => Self::bad_request("AMOUNT_TOO_SMALL", message),
            OrderError::MarketNotFound(_) => Self::not_found(message),
            OrderError::MarketUnavailable(_) => Self::bad_request("MARKET_UNAVAILABLE", message),
            OrderError::InsufficientFunds {
                available,
                required,
            } => Self::insufficient_funds(message, available, required),
            OrderError::NotFound => Self::not_found(message),
            OrderError::NotOwner => Self::new(StatusCode::FORBIDDEN, "NOT_OWNER", message),
            OrderError::OrderTerminal(_) => Self::bad_request("ORDER_TERMINAL", message),
            OrderError::Busy => Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_BUSY", message),
            OrderError::Database(_) => Self::internal(message),
        }
    }
}

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        let message = err.to_string();
        match err {
            MarketError::NotFound(_) => Self::not_found(message),
            MarketError::InvalidState(_) => Self::bad_request("MARKET_UNAVAILABLE", message),
            MarketError::Busy => Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_BUSY", message),
            MarketError::Database(_) => Self::internal(message),
        }
    }
}

impl From<MakerError> for ApiError {
    fn from(err: MakerError) -> Self {
        let message = err.to_string();
        match err {
            MakerError::NotConfigured => Self::bad_request("NOT_CONFIGURED", message),
            MakerError::MarketNotFound(_) => Self::not_found(message),
            MakerError::Order(inner) => inner.into(),
            MakerError::Database(_) => Self::internal(message),
        }
    }
}

impl From<WithdrawalError> for ApiError {
    fn from(err: WithdrawalError) -> Self {
        let message = err.to_string();
        match err {
            WithdrawalError::AmountInvalid => Self::bad_request("INVALID_AMOUNT", message),
            WithdrawalError::InvoiceMismatch { .. } | WithdrawalError::Invoice(_) => {
                Self::bad_request("INVALID_INVOICE", message)
            }
            WithdrawalError::InsufficientFunds {
                available,
                required,
            } => Self::insufficient_funds(message, available, required),
            WithdrawalError::NotFound => Self::not_found(message),
            WithdrawalError::InvalidState(_) => Self::bad_request("INVALID_STATE", message),
            WithdrawalError::Database(_) => Self::internal(message),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let message = err.to_string();
        match err {
            LedgerError::InsufficientFunds {
                available,
                required,
            } => Self::insufficient_funds(message, available, required),
            LedgerError::UserNotFound(_) => Self::not_found(message),
            LedgerError::Database(_) => Self::internal(message),
        }
    }
}

impl From<InvoiceError> for ApiError {
    fn from(err: InvoiceError) -> Self {
        Self::bad_request("INVALID_INVOICE", err.to_string())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self::internal(err.to_string())
    }
}
