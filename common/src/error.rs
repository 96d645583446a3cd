// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::protocol::Status;
use thiserror::Error;

/// The three error classes the dispatch layer distinguishes. `User` and `Internal`/
/// `Transport` map onto `RESULT.status` 1 and 2 respectively; `Config` only
/// ever surfaces at startup, before any command channel is open.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("{0}")]
    User(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl TestError {
    pub fn user(msg: impl Into<String>) -> Self {
        TestError::User(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        TestError::Internal(msg.into())
    }

    /// The `RESULT.status` a dispatch handler should report for this error.
    /// `Config` never reaches a dispatcher, so it has no mapping and is
    /// intentionally excluded from this match.
    pub fn status(&self) -> Status {
        match self {
            TestError::User(_) => Status::UserErr,
            TestError::Transport(_) | TestError::Internal(_) => Status::InternalErr,
            TestError::Config(_) => Status::InternalErr,
        }
    }
}

pub type TestResult<T> = Result<T, TestError>;
