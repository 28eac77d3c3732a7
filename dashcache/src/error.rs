// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Error types for the caching engine

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the cache engine and its collaborators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Entry too large: {size} bytes exceeds limit of {limit} bytes")]
    EntryTooLarge { size: usize, limit: usize },

    #[error("Insufficient capacity: need {needed} bytes, only {available} bytes evictable")]
    InsufficientCapacity { needed: usize, available: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Loader failure: {0}")]
    LoaderFailure(String),

    #[error("Loader timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Consistency repair failed for {key}: {reason}")]
    ConsistencyRepairFailure { key: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid rule pattern: {0}")]
    InvalidPattern(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Backing store error: {0}")]
    BackingStore(String),

    #[error("No loader registered for {0}")]
    NoLoader(String),
}

impl CacheError {
    /// Create a loader failure
    pub fn loader<S: Into<String>>(msg: S) -> Self {
        Self::LoaderFailure(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Timeouts count as loader failures for retry accounting
    pub fn is_loader_failure(&self) -> bool {
        matches!(self, Self::LoaderFailure(_) | Self::Timeout(_))
    }

    /// Errors the caller must see synchronously; everything else is recovered locally
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::EntryTooLarge { .. }
                | Self::InsufficientCapacity { .. }
                | Self::InvalidArgument(_)
                | Self::InvalidPattern(_)
                | Self::InvalidConfiguration(_)
                | Self::NoLoader(_)
        )
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for CacheError {
    fn from(err: bincode::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

impl From<regex::Error> for CacheError {
    fn from(err: regex::Error) -> Self {
        CacheError::InvalidPattern(err.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
