// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drives ingestion over a range of days and then keeps following today's log.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Days, NaiveDate, NaiveDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::errors::{ConfigError, GestorError};
use crate::event::build;
use crate::log_source::{first_log_day, LogSource, SourceMode, SourceSettings, LOG_FILE_FORMAT};
use crate::parser::parse;
use crate::sink::{CheckpointedSink, LastCheckpoint};
use crate::store::ReportingStore;

/// A day as given on the command line or in the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateSpec {
    Today,
    /// The day after the last checkpointed log.
    LastScan,
    /// The oldest log in the accounting directory.
    FirstLog,
    Day(NaiveDate),
}

impl FromStr for DateSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        match value.to_ascii_lowercase().as_str() {
            "today" => Ok(DateSpec::Today),
            "lastscan" => Ok(DateSpec::LastScan),
            "firstlog" => Ok(DateSpec::FirstLog),
            _ if value.len() == 8 => NaiveDate::parse_from_str(value, LOG_FILE_FORMAT)
                .map(DateSpec::Day)
                .map_err(|_| ConfigError::InvalidDate(s.to_string())),
            _ => Err(ConfigError::InvalidDate(s.to_string())),
        }
    }
}

impl fmt::Display for DateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DateSpec::Today => f.write_str("today"),
            DateSpec::LastScan => f.write_str("lastscan"),
            DateSpec::FirstLog => f.write_str("firstlog"),
            DateSpec::Day(day) => write!(f, "{}", day.format(LOG_FILE_FORMAT)),
        }
    }
}

/// Every day between `from` and `till`, both included, in ascending order.
#[must_use]
pub fn plan_days(from: NaiveDate, till: NaiveDate) -> Vec<NaiveDate> {
    let (first, last) = if from <= till {
        (from, till)
    } else {
        (till, from)
    };
    first.iter_days().take_while(|day| *day <= last).collect()
}

pub struct Orchestrator<S> {
    accounting_dir: PathBuf,
    from: DateSpec,
    till: DateSpec,
    sink: CheckpointedSink<S>,
    clock: Arc<dyn Clock>,
    settings: SourceSettings,
}

impl<S: ReportingStore> Orchestrator<S> {
    pub fn new(
        accounting_dir: impl Into<PathBuf>,
        from: DateSpec,
        till: DateSpec,
        sink: CheckpointedSink<S>,
        clock: Arc<dyn Clock>,
        settings: SourceSettings,
    ) -> Self {
        Orchestrator {
            accounting_dir: accounting_dir.into(),
            from,
            till,
            sink,
            clock,
            settings,
        }
    }

    pub fn sink(&self) -> &CheckpointedSink<S> {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut CheckpointedSink<S> {
        &mut self.sink
    }

    /// Turns a [`DateSpec`] into a calendar day.
    ///
    /// # Errors
    ///
    /// Fails when the store can't be queried for `lastscan` or the accounting directory has no
    /// logs for `firstlog`.
    pub async fn resolve_date(&mut self, spec: DateSpec) -> Result<NaiveDate, GestorError> {
        let day = match spec {
            DateSpec::Today => self.clock.today(),
            DateSpec::LastScan => match self.sink.last_checkpoint().await? {
                LastCheckpoint::Day(day) => day.checked_add_days(Days::new(1)).unwrap_or(day),
                LastCheckpoint::FirstLog => first_log_day(&self.accounting_dir)?,
            },
            DateSpec::FirstLog => first_log_day(&self.accounting_dir)?,
            DateSpec::Day(day) => day,
        };
        Ok(day)
    }

    /// One source per day to read. Today gets a live source; past days without a log file are
    /// left out unless the range is that single day.
    #[must_use]
    pub fn build_sources(&self, days: &[NaiveDate]) -> Vec<LogSource> {
        let today = self.clock.today();
        let single_day = days.len() == 1;
        days.iter()
            .filter_map(|day| {
                if *day == today {
                    return Some(self.live_source());
                }
                let source = LogSource::for_day(
                    &self.accounting_dir,
                    *day,
                    Arc::clone(&self.clock),
                    self.settings,
                );
                if source.mode() == SourceMode::None && !single_day {
                    debug!("Skipping {}, no accounting log", day.format(LOG_FILE_FORMAT));
                    return None;
                }
                Some(source)
            })
            .collect()
    }

    fn live_source(&self) -> LogSource {
        LogSource::today(&self.accounting_dir, Arc::clone(&self.clock), self.settings)
    }

    /// Ingests the configured range, then follows today's log until cancelled.
    ///
    /// # Errors
    ///
    /// [`GestorError::Cancelled`] once `cancel` fires; any other error is fatal to the run.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), GestorError> {
        let from = self.resolve_date(self.from).await?;
        let till = self.resolve_date(self.till).await?;
        info!(
            "Will be reading logs from day: {}, till day: {}",
            from.format(LOG_FILE_FORMAT),
            till.format(LOG_FILE_FORMAT)
        );

        let days = plan_days(from, till);
        let mut sources: VecDeque<LogSource> = self.build_sources(&days).into();
        if sources.is_empty() {
            info!("No accounting logs in the requested range, going to today's logs");
            sources.push_back(self.live_source());
        }

        while let Some(mut source) = sources.pop_front() {
            self.process(&mut source, cancel).await?;
            let today = self.clock.today();
            if sources.is_empty() && source.current_day() != today {
                info!(
                    "Processed past logs till {}, going to today's logs: {}",
                    source.current_day().format(LOG_FILE_FORMAT),
                    today.format(LOG_FILE_FORMAT)
                );
                sources.push_back(self.live_source());
            }
        }
        info!("Exiting PBS Gestor");
        Ok(())
    }

    async fn process(
        &mut self,
        source: &mut LogSource,
        cancel: &CancellationToken,
    ) -> Result<(), GestorError> {
        let mut day = source.current_day();
        let mut window_start = self.clock.now();
        let mut count: u64 = 0;
        info!("Processing log {}", day.format(LOG_FILE_FORMAT));

        while let Some(line) = source.next_line(cancel).await? {
            // file reads never suspend, give the signal handler a turn per line
            tokio::task::yield_now().await;
            if cancel.is_cancelled() {
                return Err(GestorError::Cancelled);
            }
            if let Some(completed) = source.take_rotation() {
                let now = self.clock.now();
                self.checkpoint(completed, window_start, now, cancel).await?;
                window_start = now;
                count = 0;
                day = source.current_day();
                info!("Processing log {}", day.format(LOG_FILE_FORMAT));
            }

            let event = match parse(&line) {
                Ok(event) => event,
                Err(e) => {
                    error!(
                        "Log file: {}. Log line: {}. {}",
                        day.format(LOG_FILE_FORMAT),
                        line,
                        e
                    );
                    continue;
                }
            };
            let record = build(&event);
            debug!(
                "Successfully parsed job {}, event {}",
                record.job_id, record.event_type
            );

            // the sink only suspends before opening its transaction
            let stored = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(GestorError::Cancelled),
                stored = self.sink.upsert_job(&record) => stored,
            };
            match stored {
                Ok(()) => count += 1,
                Err(e) if e.is_record_error() => {
                    error!("Log file: {}. Skipping record: {}", day.format(LOG_FILE_FORMAT), e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if count > 0 {
            let now = self.clock.now();
            self.checkpoint(day, window_start, now, cancel).await?;
        }
        Ok(())
    }

    async fn checkpoint(
        &mut self,
        day: NaiveDate,
        start: NaiveDateTime,
        end: NaiveDateTime,
        cancel: &CancellationToken,
    ) -> Result<(), GestorError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(GestorError::Cancelled),
            written = self.sink.upsert_checkpoint(day, start, end) => written.map_err(|e| {
                error!("Saving checkpoint for {} failed: {}", day.format(LOG_FILE_FORMAT), e);
                GestorError::from(e)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::retry::RetryStrategy;
    use crate::store::{SqliteStore, TableNames};
    use duplicate::duplicate_item;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2018, 11, d).unwrap()
    }

    fn orchestrator(dir: &std::path::Path, today: NaiveDate) -> Orchestrator<SqliteStore> {
        let mut store = SqliteStore::in_memory(TableNames::default()).unwrap();
        store.provision().unwrap();
        Orchestrator::new(
            dir,
            DateSpec::Today,
            DateSpec::Today,
            CheckpointedSink::new(store, RetryStrategy::Immediate(1)),
            Arc::new(ManualClock::at_day(today)),
            SourceSettings::default(),
        )
    }

    #[duplicate_item(
        test_name                       input           expected;
        [test_date_spec_today]          ["today"]       [DateSpec::Today];
        [test_date_spec_lastscan]       ["lastscan"]    [DateSpec::LastScan];
        [test_date_spec_firstlog]       ["FirstLog"]    [DateSpec::FirstLog];
        [test_date_spec_day]            ["20181112"]    [DateSpec::Day(day(12))];
    )]
    #[test]
    fn test_name() {
        assert_eq!(input.parse::<DateSpec>().unwrap(), expected);
    }

    #[test]
    fn test_invalid_date_specs() {
        for input in ["", "yesterday", "2018-11-12", "20181332", "201811120"] {
            assert_eq!(
                input.parse::<DateSpec>(),
                Err(ConfigError::InvalidDate(input.to_string())),
                "{input}"
            );
        }
    }

    #[test]
    fn test_date_spec_display() {
        assert_eq!(DateSpec::Day(day(2)).to_string(), "20181102");
        assert_eq!(DateSpec::LastScan.to_string(), "lastscan");
    }

    #[test]
    fn test_plan_days() {
        assert_eq!(plan_days(day(12), day(12)), vec![day(12)]);
        assert_eq!(plan_days(day(10), day(12)), vec![day(10), day(11), day(12)]);
        assert_eq!(plan_days(day(12), day(10)), vec![day(10), day(11), day(12)]);
        let month_end = plan_days(NaiveDate::from_ymd_opt(2018, 10, 30).unwrap(), day(2));
        assert_eq!(month_end.len(), 4);
    }

    #[tokio::test]
    async fn test_resolve_lastscan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20181105"), "").unwrap();
        let mut orchestrator = orchestrator(dir.path(), day(12));

        // nothing checkpointed yet
        assert_eq!(
            orchestrator.resolve_date(DateSpec::LastScan).await.unwrap(),
            day(5)
        );

        let at = day(9).and_hms_opt(1, 0, 0).unwrap();
        orchestrator
            .sink_mut()
            .upsert_checkpoint(day(8), at, at)
            .await
            .unwrap();
        assert_eq!(
            orchestrator.resolve_date(DateSpec::LastScan).await.unwrap(),
            day(9)
        );
        assert_eq!(
            orchestrator.resolve_date(DateSpec::Today).await.unwrap(),
            day(12)
        );
        assert_eq!(
            orchestrator.resolve_date(DateSpec::FirstLog).await.unwrap(),
            day(5)
        );
    }

    #[tokio::test]
    async fn test_resolve_firstlog_without_logs() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = orchestrator(dir.path(), day(12));
        let err = orchestrator
            .resolve_date(DateSpec::FirstLog)
            .await
            .unwrap_err();
        assert!(matches!(err, GestorError::Source(_)));
    }

    #[test]
    fn test_build_sources_skips_missing_days() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20181109"), "").unwrap();
        let orchestrator = orchestrator(dir.path(), day(12));

        let sources = orchestrator.build_sources(&plan_days(day(9), day(12)));
        let planned: Vec<_> = sources
            .iter()
            .map(|s| (s.current_day(), s.mode()))
            .collect();
        assert_eq!(
            planned,
            vec![(day(9), SourceMode::Manual), (day(12), SourceMode::Live)]
        );

        // a single missing day is kept
        let sources = orchestrator.build_sources(&[day(10)]);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].mode(), SourceMode::None);
    }
}
