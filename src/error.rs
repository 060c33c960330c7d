//! Error types for the Tradelink orchestrator

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transport error for validator {validator_id}: {message}")]
    Transport {
        validator_id: String,
        message: String,
    },

    #[error("Authentication failed for validator {validator_id}: {message}")]
    Authentication {
        validator_id: String,
        message: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Application error for trade {trade_id}: {message}")]
    Application { trade_id: String, message: String },

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Nonce error for address {address}: {message}")]
    Nonce { address: String, message: String },

    #[error("Validator {validator_id} not found")]
    ValidatorNotFound { validator_id: String },

    #[error("Business logic {business_logic_id} not found")]
    BusinessLogicNotFound { business_logic_id: String },

    #[error("Trade {trade_id} not found")]
    TradeNotFound { trade_id: String },

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
