// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup: a console subscriber at the level configured in
//! `[logging]`, plus an optional rolling file appender when
//! `[logging].file_logging` is set.

use crate::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;

/// `init` returns the appender's [`WorkerGuard`]; the caller must keep it
/// alive for the lifetime of the process or buffered log lines are dropped
/// on exit.
pub fn init(party: &str, logging: &LoggingConfig) -> Option<WorkerGuard> {
    let console_level = logging.console.as_tracing_level();

    if !logging.file_logging {
        tracing_subscriber::fmt()
            .with_max_level(console_level)
            .with_ansi(false)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::never(".", format!("{party}_debug.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_max_level(console_level)
        .with_ansi(false)
        .with_writer(non_blocking)
        .init();

    Some(guard)
}
