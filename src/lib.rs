#![doc = include_str!("../README.md")]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
clippy::must_use_candidate,
clippy::missing_errors_doc,
clippy::module_name_repetitions,
clippy::struct_field_names,
clippy::missing_panics_doc
)]

use thiserror::Error;

pub mod catalog;
pub mod config;
pub mod engine;
pub mod executor;
pub mod history;
pub mod logsink;
pub mod requests;
pub mod responses;
pub mod session;
pub mod tokenizer;
pub mod translator;
pub mod wire;

/// Everything that can go wrong between the wire and the engine.
///
/// Each variant carries a stable short code that is serialized into the
/// response envelope; clients branch on the code, not the message.
#[derive(Error, Debug)]
pub enum SnowglobeError {
    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("session token is missing, invalid or expired")]
    Unauthenticated,

    #[error("cannot translate statement: {0}")]
    Translation(String),

    #[error("{0} does not exist or not authorized")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("cannot restore {0}: an object with the same name is live")]
    NameInUse(String),

    #[error("{0} is not empty; use CASCADE to drop it anyway")]
    NotEmpty(String),

    #[error("Engine: {0}")]
    Engine(String),

    #[error("statement exceeded the {0} second execution deadline")]
    Timeout(u64),

    #[error("catalog and engine state diverged: {0}")]
    InternalInconsistency(String),

    #[error("engine is unavailable: {0}")]
    Unavailable(String),
}

impl SnowglobeError {
    /// Stable short code for the wire envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BadRequest",
            Self::Unauthenticated => "Unauthenticated",
            Self::Translation(_) => "Translation",
            Self::NotFound(_) => "NotFound",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::NameInUse(_) => "NameInUse",
            Self::NotEmpty(_) => "NotEmpty",
            Self::Engine(_) => "Engine",
            Self::Timeout(_) => "Timeout",
            Self::InternalInconsistency(_) => "InternalInconsistency",
            Self::Unavailable(_) => "Unavailable",
        }
    }

    /// Application-level failures still travel as HTTP 200; only a missing or
    /// unknown token maps to 401, which clients use to drive re-login.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthenticated => 401,
            _ => 200,
        }
    }
}

pub type Result<T> = std::result::Result<T, SnowglobeError>;
