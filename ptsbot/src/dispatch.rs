// Copyright (c) The ptsbot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError, PtsbotExitCode,
    output::{OutputContext, OutputOpts, StdoutStyles, clap_styles},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand, ValueEnum};
use itertools::Itertools;
use owo_colors::OwoColorize;
use ptsbot_runner::{
    catalog::Catalog,
    config::{BotConfig, DEFAULT_CONFIG_PATH},
    handlers::HandlerSets,
    reporter::{HistoryStore, Regression, RunResults, TestStatus, compute_regressions},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, io::Write};
use tracing::{debug, info};

/// Unattended Bluetooth qualification runs.
///
/// ptsbot drives a remote qualification tool through a catalog of test cases and answers its
/// operator prompts automatically.
#[derive(Debug, Parser)]
#[command(version, styles = clap_styles::style())]
pub struct PtsbotApp {
    #[command(flatten)]
    output: OutputOpts,

    #[command(flatten)]
    config_opts: ConfigOpts,

    #[command(subcommand)]
    command: Command,
}

impl PtsbotApp {
    /// Initializes the output context: colors and the logger.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, writing regular output to `writer`. Returns the process exit code.
    pub fn exec(self, output: OutputContext, writer: &mut dyn Write) -> Result<i32, ExpectedError> {
        match self.command {
            Command::List(opts) => opts.exec(&self.config_opts, output, writer),
            Command::Regressions(opts) => opts.exec(&self.config_opts, output, writer),
        }
    }
}

#[derive(Debug, Args)]
struct ConfigOpts {
    /// Config file
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH,
        env = "PTSBOT_CONFIG"
    )]
    config_file: Utf8PathBuf,
}

impl ConfigOpts {
    fn make_config(&self) -> Result<BotConfig, ExpectedError> {
        let config = BotConfig::from_path(&self.config_file)?;
        debug!(config_file = %self.config_file, "loaded config");
        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the test cases each device configuration selects from a catalog
    List(ListOpts),

    /// Compare a results file against the recorded status history
    ///
    /// Exits with code 100 if any test case regressed.
    Regressions(RegressionsOpts),
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
enum MessageFormat {
    /// Human-readable output
    #[default]
    Human,
    /// JSON output
    Json,
}

#[derive(Debug, Args)]
struct ListOpts {
    /// The test-case catalog
    #[arg(long, value_name = "PATH")]
    catalog: Utf8PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t, value_name = "FORMAT")]
    message_format: MessageFormat,
}

/// The test cases selected by one device configuration.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ConfigurationSelection<'a> {
    name: &'a str,
    test_cases: Vec<&'a str>,
}

impl ListOpts {
    fn exec(
        &self,
        config_opts: &ConfigOpts,
        output: OutputContext,
        writer: &mut dyn Write,
    ) -> Result<i32, ExpectedError> {
        let config = config_opts.make_config()?;
        let catalog = load_catalog(&self.catalog)?;

        let configurations = config.configurations();
        let selected: Vec<_> = configurations
            .iter()
            .map(|configuration| (configuration, configurations.select(configuration, &catalog)))
            .collect();
        let selections: Vec<_> = selected
            .iter()
            .map(|(configuration, cases)| ConfigurationSelection {
                name: configuration.name(),
                test_cases: cases.iter().map(|case| case.id()).collect(),
            })
            .collect();

        match self.message_format {
            MessageFormat::Human => {
                write_selections(&selections, &output.stdout_styles(), writer)
                    .map_err(ExpectedError::write_output_error)?;
            }
            MessageFormat::Json => {
                serde_json::to_writer_pretty(&mut *writer, &selections)
                    .map_err(|err| ExpectedError::write_output_error(err.into()))?;
                writeln!(writer).map_err(ExpectedError::write_output_error)?;
            }
        }

        let unselected = catalog.len()
            - selections
                .iter()
                .flat_map(|selection| selection.test_cases.iter())
                .unique()
                .count();
        if unselected > 0 && output.verbose {
            info!("{unselected} test cases in the catalog are not selected by any configuration");
        }

        Ok(PtsbotExitCode::OK)
    }
}

fn load_catalog(path: &Utf8Path) -> Result<Catalog, ExpectedError> {
    Catalog::from_path(path, &HandlerSets::builtin())
        .map_err(|err| ExpectedError::catalog_parse_error(path, err))
}

fn write_selections(
    selections: &[ConfigurationSelection<'_>],
    styles: &StdoutStyles,
    writer: &mut dyn Write,
) -> std::io::Result<()> {
    for selection in selections {
        writeln!(
            writer,
            "{} ({} {}):",
            selection.name.style(styles.heading),
            selection.test_cases.len().style(styles.count),
            plural_test_cases(selection.test_cases.len()),
        )?;
        for id in &selection.test_cases {
            writeln!(writer, "    {}", id.style(styles.test_case))?;
        }
    }
    Ok(())
}

fn plural_test_cases(count: usize) -> &'static str {
    if count == 1 { "test case" } else { "test cases" }
}

#[derive(Debug, Args)]
struct RegressionsOpts {
    /// A results file: a batch outcome, or a JSON map of test-case id to status
    #[arg(long, value_name = "PATH")]
    results: Utf8PathBuf,

    /// The status history file [default: `history-file` from the config]
    #[arg(long, value_name = "PATH")]
    history: Option<Utf8PathBuf>,

    /// Record the statuses in the results file into the history afterwards
    #[arg(long)]
    record: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t, value_name = "FORMAT")]
    message_format: MessageFormat,
}

/// A results file, as written by a batch run or by hand.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResultsFile {
    Outcome { results: RunResults },
    Statuses(BTreeMap<String, TestStatus>),
}

impl ResultsFile {
    fn into_statuses(self) -> BTreeMap<String, TestStatus> {
        match self {
            Self::Outcome { results } => results
                .statuses()
                .map(|(case_id, status)| (case_id.to_owned(), status))
                .collect(),
            Self::Statuses(statuses) => statuses,
        }
    }
}

impl RegressionsOpts {
    fn exec(
        &self,
        config_opts: &ConfigOpts,
        output: OutputContext,
        writer: &mut dyn Write,
    ) -> Result<i32, ExpectedError> {
        let statuses = read_results(&self.results)?;

        let history_file = match &self.history {
            Some(history) => history.clone(),
            None => config_opts.make_config()?.run().history_file.clone(),
        };
        let store = HistoryStore::new(history_file);
        let history = store.load_statuses()?;

        let regressions = compute_regressions(
            statuses.iter().map(|(case_id, status)| (case_id.as_str(), *status)),
            &history,
        );

        match self.message_format {
            MessageFormat::Human => {
                write_regressions(&regressions, statuses.len(), &output.stdout_styles(), writer)
                    .map_err(ExpectedError::write_output_error)?;
            }
            MessageFormat::Json => {
                serde_json::to_writer_pretty(&mut *writer, &regressions)
                    .map_err(|err| ExpectedError::write_output_error(err.into()))?;
                writeln!(writer).map_err(ExpectedError::write_output_error)?;
            }
        }

        if self.record {
            store.record(
                statuses
                    .iter()
                    .map(|(case_id, status)| (case_id.as_str(), *status)),
            )?;
            info!("recorded {} statuses to {}", statuses.len(), store.path());
        }

        if regressions.is_empty() {
            Ok(PtsbotExitCode::OK)
        } else {
            Ok(PtsbotExitCode::REGRESSIONS_FOUND)
        }
    }
}

fn read_results(path: &Utf8Path) -> Result<BTreeMap<String, TestStatus>, ExpectedError> {
    let contents =
        std::fs::read_to_string(path).map_err(|err| ExpectedError::ResultsReadError {
            path: path.to_owned(),
            err,
        })?;
    let results: ResultsFile =
        serde_json::from_str(&contents).map_err(|err| ExpectedError::ResultsParseError {
            path: path.to_owned(),
            err,
        })?;
    Ok(results.into_statuses())
}

fn write_regressions(
    regressions: &[Regression],
    total: usize,
    styles: &StdoutStyles,
    writer: &mut dyn Write,
) -> std::io::Result<()> {
    for regression in regressions {
        writeln!(
            writer,
            "{}: {} -> {}",
            regression.case_id.style(styles.test_case),
            regression.previous.style(styles.status_good),
            regression.current.style(styles.status_bad),
        )?;
    }
    writeln!(
        writer,
        "{} of {} {} regressed",
        regressions.len().style(styles.count),
        total,
        plural_test_cases(total),
    )
}
