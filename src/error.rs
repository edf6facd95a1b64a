use std::fmt;

use crate::units::Kg;

/// Errors surfaced by the marketplace core.
#[derive(thiserror::Error, Debug)]
pub enum MarketError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not permitted: {0}")]
    Authorization(String),
    #[error("{entity} {id} was not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{0}")]
    InvalidState(String),
    #[error("listing {listing_id} has {available} available, {requested} requested")]
    InsufficientQuantity {
        listing_id: String,
        available: Kg,
        requested: Kg,
    },
    #[error("insufficient stock on listing {listing_id}: {available} available, order needs {requested}")]
    InsufficientStock {
        listing_id: String,
        available: Kg,
        requested: Kg,
    },
    #[error("order {order_id} left inconsistent while {step}: {reason}")]
    FatalCompletion {
        order_id: String,
        step: CompletionStep,
        reason: String,
    },
    #[error("storage failure")]
    Storage(#[from] sled::Error),
    #[error("record encoding failure: {0}")]
    Encoding(String),
}

/// Failures of the external ledger mirror. Always recovered locally.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("ledger call timed out after {0}ms")]
    Timeout(u64),
    #[error("ledger rejected the call: {0}")]
    Rejected(String),
}

/// Failures of the proof/object storage collaborator. Recovered through the
/// fingerprint fallback.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("proof storage unavailable: {0}")]
    Unavailable(String),
    #[error("unknown object reference {0}")]
    UnknownReference(String),
}

/// Stable, caller-facing classification of a [`MarketError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Authorization,
    NotFound,
    InvalidState,
    InsufficientQuantity,
    InsufficientStock,
    FatalCompletion,
    Internal,
}

/// The off-chain steps of an order completion, in the order they apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStep {
    MarkTransferred,
    ReduceParent,
    AppendJourney,
    CreateChildListing,
}

impl MarketError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MarketError::Validation(_) => ErrorKind::Validation,
            MarketError::Authorization(_) => ErrorKind::Authorization,
            MarketError::NotFound { .. } => ErrorKind::NotFound,
            MarketError::InvalidState(_) => ErrorKind::InvalidState,
            MarketError::InsufficientQuantity { .. } => ErrorKind::InsufficientQuantity,
            MarketError::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            MarketError::FatalCompletion { .. } => ErrorKind::FatalCompletion,
            MarketError::Storage(_) | MarketError::Encoding(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to hand to a caller. Internal failures are not detailed.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "an unexpected storage error occurred".to_string(),
            _ => self.to_string(),
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        MarketError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Authorization => "authorization_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::InsufficientQuantity => "insufficient_quantity",
            ErrorKind::InsufficientStock => "insufficient_stock",
            ErrorKind::FatalCompletion => "fatal_completion",
            ErrorKind::Internal => "internal_error",
        }
    }
}

impl fmt::Display for CompletionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            CompletionStep::MarkTransferred => "marking the order transferred",
            CompletionStep::ReduceParent => "reducing the parent listing",
            CompletionStep::AppendJourney => "appending the journey event",
            CompletionStep::CreateChildListing => "creating the child listing",
        };
        f.write_str(step)
    }
}

impl<E: fmt::Display> From<minicbor::encode::Error<E>> for MarketError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        MarketError::Encoding(value.to_string())
    }
}

impl From<minicbor::decode::Error> for MarketError {
    fn from(value: minicbor::decode::Error) -> Self {
        MarketError::Encoding(value.to_string())
    }
}

pub type MarketResult<T> = Result<T, MarketError>;
