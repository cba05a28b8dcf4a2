// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use owo_colors::OwoColorize;
use ptsbot_runner::errors::{
    CatalogParseError, ConfigParseError, HistoryLoadError, HistorySaveError,
};
use std::error::Error;
use thiserror::Error;
use tracing::error;

/// Documented exit codes for `ptsbot` failures.
///
/// Unknown or unexpected failures always result in exit code 1.
pub enum PtsbotExitCode {}

impl PtsbotExitCode {
    /// No errors occurred and ptsbot exited normally.
    pub const OK: i32 = 0;

    /// One or more test cases regressed compared to the recorded history.
    pub const REGRESSIONS_FOUND: i32 = 100;

    /// The status history could not be read or written.
    pub const HISTORY_ERROR: i32 = 97;

    /// An error was encountered while setting up ptsbot: reading the config, the catalog or
    /// an input file.
    pub const SETUP_ERROR: i32 = 96;

    /// Writing output to stdout failed.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;
}

// The #[error()] strings are placeholders: errors are meant to be printed with
// display_to_stderr, which colorizes them.

/// An expected error, reported to the user without a backtrace.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("catalog parse error")]
    CatalogParseError {
        path: Utf8PathBuf,
        #[source]
        err: CatalogParseError,
    },
    #[error("error reading results file")]
    ResultsReadError {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing results file")]
    ResultsParseError {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },
    #[error("history load error")]
    HistoryLoadError {
        #[from]
        err: HistoryLoadError,
    },
    #[error("history save error")]
    HistorySaveError {
        #[from]
        err: HistorySaveError,
    },
    #[error("error writing output")]
    WriteOutputError {
        #[source]
        err: std::io::Error,
    },
}

impl ExpectedError {
    pub(crate) fn catalog_parse_error(path: impl Into<Utf8PathBuf>, err: CatalogParseError) -> Self {
        Self::CatalogParseError {
            path: path.into(),
            err,
        }
    }

    pub(crate) fn write_output_error(err: std::io::Error) -> Self {
        Self::WriteOutputError { err }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::ConfigParseError { .. }
            | Self::CatalogParseError { .. }
            | Self::ResultsReadError { .. }
            | Self::ResultsParseError { .. } => PtsbotExitCode::SETUP_ERROR,
            Self::HistoryLoadError { .. } | Self::HistorySaveError { .. } => {
                PtsbotExitCode::HISTORY_ERROR
            }
            Self::WriteOutputError { .. } => PtsbotExitCode::WRITE_OUTPUT_ERROR,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::ConfigParseError { err } => {
                error!(
                    "failed to parse ptsbot config at `{}`",
                    err.config_file().style(styles.bold)
                );
                Some(err.kind() as &dyn Error)
            }
            Self::CatalogParseError { path, err } => {
                error!(
                    "failed to load test-case catalog at `{}`",
                    path.style(styles.bold)
                );
                Some(err.kind() as &dyn Error)
            }
            Self::ResultsReadError { path, err } => {
                error!("failed to read results file `{}`", path.style(styles.bold));
                Some(err as &dyn Error)
            }
            Self::ResultsParseError { path, err } => {
                error!(
                    "results file `{}` is neither a batch outcome nor a map of test-case \
                     statuses",
                    path.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::HistoryLoadError { err } => {
                error!("{err}");
                error!(
                    target: NO_HEADING_TARGET,
                    "({}: remove the history file to start afresh)",
                    "hint".style(styles.warning_text)
                );
                err.source()
            }
            Self::HistorySaveError { err } => {
                error!("{err}");
                err.source()
            }
            Self::WriteOutputError { err } => {
                error!("error writing output");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
