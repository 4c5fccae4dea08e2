// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Idempotent, checkpointed writes into the reporting store.
//!
//! Every job is written in its own transaction: the job row is upserted by PBS job id and each
//! resource entry is inserted only if the exact `(job, resource, value)` triple is new, so a
//! replayed log merges into what is already stored. One checkpoint row per completed log day
//! tells the next run where to resume.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::errors::SinkError;
use crate::event::JobRecord;
use crate::retry::RetryStrategy;
use crate::store::{ReportingStore, Row, Table, UpsertMode, Value};

/// Kind tag for job payloads passed to [`CheckpointedSink::write`].
pub const JOB_INFO: &str = "job_info";
/// Kind tag for checkpoint payloads passed to [`CheckpointedSink::write`].
pub const LOG_INFO: &str = "log_info";

const DAY_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Where the previous run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastCheckpoint {
    /// The last fully processed log day.
    Day(NaiveDate),
    /// Nothing was ever checkpointed, start at the first available log.
    FirstLog,
}

#[derive(Debug, Deserialize)]
struct CheckpointPayload {
    filename: NaiveDate,
    start: NaiveDateTime,
    end: NaiveDateTime,
}

pub struct CheckpointedSink<S> {
    store: S,
    retry_strategy: RetryStrategy,
}

impl<S: ReportingStore> CheckpointedSink<S> {
    pub fn new(store: S, retry_strategy: RetryStrategy) -> Self {
        CheckpointedSink {
            store,
            retry_strategy,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Writes a job and its resource entries.
    ///
    /// # Errors
    ///
    /// [`SinkError::InvalidRecord`] when a timestamp or counter can't be converted, in which case
    /// nothing is written. [`SinkError::Connection`] when the store stays unreachable.
    pub async fn upsert_job(&mut self, record: &JobRecord) -> Result<(), SinkError> {
        self.ensure_connected().await?;
        let row = job_row(record)?;
        self.in_transaction(|store| {
            let job_idx =
                store.upsert_by_key(Table::Job, &["ji_jobid"], &row, UpsertMode::Overwrite)?;
            for entry in record.resource_entries() {
                let resource = Row::from([
                    ("ji_pbsjobidx".to_string(), Value::Integer(job_idx)),
                    ("ji_arrresource".to_string(), Value::from(entry.name)),
                    ("ji_arrvalue".to_string(), Value::from(entry.value)),
                ]);
                store.upsert_by_key(
                    Table::JobResource,
                    &["ji_pbsjobidx", "ji_arrresource", "ji_arrvalue"],
                    &resource,
                    UpsertMode::InsertIfAbsent,
                )?;
            }
            Ok(())
        })?;
        debug!("Job {} stored as {}", record.job_id, record.event_type);
        Ok(())
    }

    /// Records that the log of `day` was fully processed between `start` and `end`.
    ///
    /// # Errors
    ///
    /// [`SinkError::Connection`] when the store stays unreachable, or the store error.
    pub async fn upsert_checkpoint(
        &mut self,
        day: NaiveDate,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<(), SinkError> {
        self.ensure_connected().await?;
        let row = Row::from([
            (
                "filename".to_string(),
                Value::from(day.format(DAY_FORMAT).to_string()),
            ),
            (
                "start".to_string(),
                Value::from(start.format(TIMESTAMP_FORMAT).to_string()),
            ),
            (
                "end".to_string(),
                Value::from(end.format(TIMESTAMP_FORMAT).to_string()),
            ),
        ]);
        self.in_transaction(|store| {
            store.upsert_by_key(Table::Log, &["filename"], &row, UpsertMode::Overwrite)?;
            Ok(())
        })?;
        info!("Checkpoint written for log {}", day.format("%Y%m%d"));
        Ok(())
    }

    /// Returns the most recent checkpointed day.
    ///
    /// # Errors
    ///
    /// [`SinkError::Connection`] when the store stays unreachable,
    /// [`SinkError::CorruptCheckpoint`] when the stored day can't be read back.
    pub async fn last_checkpoint(&mut self) -> Result<LastCheckpoint, SinkError> {
        self.ensure_connected().await?;
        let Some(row) = self.store.query_latest(Table::Log, "filename")? else {
            return Ok(LastCheckpoint::FirstLog);
        };
        let filename = row
            .get("filename")
            .and_then(Value::as_text)
            .unwrap_or_default();
        NaiveDate::parse_from_str(filename, DAY_FORMAT)
            .map(LastCheckpoint::Day)
            .map_err(|_| SinkError::CorruptCheckpoint(filename.to_string()))
    }

    /// Generic entry point taking a kind tag ([`JOB_INFO`] or [`LOG_INFO`]) and a JSON object.
    ///
    /// # Errors
    ///
    /// [`SinkError::InvalidArgument`] when `data` isn't an object,
    /// [`SinkError::Configuration`] for an unknown kind, [`SinkError::InvalidRecord`] when the
    /// object doesn't describe a record of that kind, plus whatever the write itself returns.
    pub async fn write(&mut self, kind: &str, data: &serde_json::Value) -> Result<(), SinkError> {
        if !data.is_object() {
            return Err(SinkError::InvalidArgument(json_type(data).to_string()));
        }
        match kind {
            JOB_INFO => {
                let record: JobRecord =
                    serde_json::from_value(data.clone()).map_err(|e| SinkError::InvalidRecord {
                        job_id: payload_job_id(data),
                        reason: e.to_string(),
                    })?;
                self.upsert_job(&record).await
            }
            LOG_INFO => {
                let checkpoint: CheckpointPayload = serde_json::from_value(data.clone())
                    .map_err(|e| SinkError::InvalidRecord {
                        job_id: String::new(),
                        reason: format!("checkpoint: {e}"),
                    })?;
                self.upsert_checkpoint(checkpoint.filename, checkpoint.start, checkpoint.end)
                    .await
            }
            other => Err(SinkError::Configuration(other.to_string())),
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), SinkError> {
        if self.store.is_alive() {
            return Ok(());
        }
        let attempts = self.retry_strategy.attempts();
        for attempt in 1..=attempts {
            warn!(
                "Reporting store unreachable, reconnecting (attempt {}/{})",
                attempt, attempts
            );
            match self.store.reconnect() {
                Ok(()) if self.store.is_alive() => {
                    info!("Reconnected to reporting store");
                    return Ok(());
                }
                Ok(()) => warn!("Reconnected to reporting store but it does not respond"),
                Err(e) => warn!("Failed to reconnect to reporting store: {}", e),
            }
            if attempt < attempts {
                if let Some(delay) = self.retry_strategy.delay() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
        error!(
            "Connection to reporting store not available after {} attempts",
            attempts
        );
        Err(SinkError::Connection { attempts })
    }

    fn in_transaction<F>(&mut self, f: F) -> Result<(), SinkError>
    where
        F: FnOnce(&mut S) -> Result<(), SinkError>,
    {
        self.store.begin()?;
        let result = match f(&mut self.store) {
            Ok(()) => self.store.commit().map_err(SinkError::from),
            Err(e) => Err(e),
        };
        // a failed commit leaves the transaction open too
        if result.is_err() {
            if let Err(rollback) = self.store.rollback() {
                warn!("Failed to roll back transaction: {}", rollback);
            }
        }
        result
    }
}

/// Converts a record into job table columns.
fn job_row(record: &JobRecord) -> Result<Row, SinkError> {
    let invalid = |reason: String| SinkError::InvalidRecord {
        job_id: record.job_id.clone(),
        reason,
    };
    let timestamp = |column: &str, value: &Option<String>| -> Result<Value, SinkError> {
        match value {
            None => Ok(Value::Null),
            Some(value) => epoch_to_iso(value)
                .map(Value::Text)
                .ok_or_else(|| invalid(format!("{column} '{value}' is not an epoch timestamp"))),
        }
    };
    let integer = |column: &str, value: &Option<String>| -> Result<Value, SinkError> {
        match value {
            None => Ok(Value::Null),
            Some(value) => value
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| invalid(format!("{column} '{value}' is not an integer"))),
        }
    };
    let hosts = |column: &str, value: &Option<Vec<String>>| -> Result<Value, SinkError> {
        match value {
            None => Ok(Value::Null),
            Some(list) => serde_json::to_string(list)
                .map(Value::Text)
                .map_err(|e| invalid(format!("{column}: {e}"))),
        }
    };

    let mut row = Row::new();
    row.insert("ji_jobid".into(), Value::from(record.job_id.as_str()));
    row.insert("ji_jobname".into(), Value::from(record.job_name.as_str()));
    row.insert("ji_user".into(), Value::from(record.user.as_str()));
    row.insert("ji_group".into(), Value::from(record.group.as_str()));
    row.insert("ji_project".into(), Value::from(record.project.as_str()));
    row.insert("ji_sv_name".into(), Value::from(record.server_name.as_str()));
    row.insert("ji_queue".into(), Value::from(record.queue.as_str()));
    row.insert("ji_priority".into(), Value::Integer(record.priority));
    row.insert("ji_cr_time".into(), timestamp("ctime", &record.created_at)?);
    row.insert("ji_quetime".into(), timestamp("qtime", &record.queued_at)?);
    row.insert("ji_start_time".into(), timestamp("start", &record.start_time)?);
    row.insert("ji_end_time".into(), timestamp("end", &record.end_time)?);
    row.insert("ji_eligible_time".into(), integer("etime", &record.eligible_time)?);
    row.insert("ji_runcount".into(), integer("run_count", &record.run_count)?);
    row.insert("ji_sessionid".into(), integer("session", &record.session_id)?);
    row.insert("ji_exitstat".into(), integer("Exit_status", &record.exit_status)?);
    row.insert("ji_exechost".into(), hosts("exec_host", &record.exec_host)?);
    row.insert("ji_execvnode".into(), hosts("exec_vnode", &record.exec_vnode)?);
    row.insert("ji_event_type".into(), Value::from(record.event_type.as_str()));
    Ok(row)
}

/// `1542010810` -> `2018-11-12T08:20:10` (UTC). Fractional seconds are dropped.
#[allow(clippy::cast_possible_truncation)]
fn epoch_to_iso(value: &str) -> Option<String> {
    let value = value.trim();
    let seconds = match value.parse::<i64>() {
        Ok(seconds) => seconds,
        Err(_) => {
            let seconds = value.parse::<f64>().ok().filter(|s| s.is_finite())?;
            seconds.trunc() as i64
        }
    };
    DateTime::from_timestamp(seconds, 0)
        .map(|dt| dt.naive_utc().format(TIMESTAMP_FORMAT).to_string())
}

fn payload_job_id(data: &serde_json::Value) -> String {
    data.get("ji_jobid")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn json_type(data: &serde_json::Value) -> &'static str {
    match data {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::event::{build, EventType};
    use crate::parser::{fixtures::*, parse};
    use crate::store::{SqliteStore, TableNames};
    use serde_json::json;

    fn sink() -> CheckpointedSink<SqliteStore> {
        let mut store = SqliteStore::in_memory(TableNames::default()).unwrap();
        store.provision().unwrap();
        CheckpointedSink::new(store, RetryStrategy::Immediate(1))
    }

    fn record(line: &str) -> JobRecord {
        build(&parse(line).unwrap())
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2018, 11, d).unwrap()
    }

    /// A store that never comes back.
    #[derive(Default)]
    struct DeadStore {
        reconnects: u32,
    }

    impl ReportingStore for DeadStore {
        fn is_alive(&mut self) -> bool {
            false
        }
        fn reconnect(&mut self) -> Result<(), StoreError> {
            self.reconnects += 1;
            Err(StoreError::Disconnected)
        }
        fn begin(&mut self) -> Result<(), StoreError> {
            Err(StoreError::Disconnected)
        }
        fn commit(&mut self) -> Result<(), StoreError> {
            Err(StoreError::Disconnected)
        }
        fn rollback(&mut self) -> Result<(), StoreError> {
            Err(StoreError::Disconnected)
        }
        fn upsert_by_key(
            &mut self,
            _table: Table,
            _key_columns: &[&str],
            _row: &Row,
            _mode: UpsertMode,
        ) -> Result<i64, StoreError> {
            Err(StoreError::Disconnected)
        }
        fn query_latest(
            &mut self,
            _table: Table,
            _order_column: &str,
        ) -> Result<Option<Row>, StoreError> {
            Err(StoreError::Disconnected)
        }
    }

    #[test]
    fn test_epoch_to_iso() {
        assert_eq!(epoch_to_iso("1542010810").as_deref(), Some("2018-11-12T08:20:10"));
        assert_eq!(epoch_to_iso("1542010810.75").as_deref(), Some("2018-11-12T08:20:10"));
        assert_eq!(epoch_to_iso("yesterday"), None);
        assert_eq!(epoch_to_iso("NaN"), None);
    }

    #[tokio::test]
    async fn test_queue_start_end_merge_into_one_job() {
        let mut sink = sink();
        for line in [QUEUE_EVENT, START_EVENT, END_EVENT] {
            sink.upsert_job(&record(line)).await.unwrap();
        }

        let store = sink.store_mut();
        assert_eq!(store.count_rows(Table::Job).unwrap(), 1);
        let job = store.find_job("0.cylc-vm").unwrap().unwrap();
        assert_eq!(job["ji_event_type"], Value::from("END"));
        assert_eq!(job["ji_sv_name"], Value::from("cylc-vm"));
        assert_eq!(job["ji_start_time"], Value::from("2018-11-12T08:20:10"));
        assert_eq!(job["ji_end_time"], Value::from("2018-11-12T08:20:20"));
        assert_eq!(job["ji_exitstat"], Value::Integer(0));
        assert_eq!(job["ji_sessionid"], Value::Integer(61461));
        assert_eq!(job["ji_exechost"], Value::from(r#"["cylc-vm/0"]"#));

        let resources = store.resources_for("0.cylc-vm").unwrap();
        assert!(resources.contains(&("u_walltime".to_string(), "00:00:11".to_string())));
        assert!(resources.contains(&("l_place".to_string(), "pack".to_string())));
    }

    #[tokio::test]
    async fn test_upsert_twice_keeps_latest_attributes() {
        let mut sink = sink();
        sink.upsert_job(&record(START_EVENT)).await.unwrap();
        let mut updated = record(START_EVENT);
        updated.queue = "express".to_string();
        sink.upsert_job(&updated).await.unwrap();

        let store = sink.store_mut();
        assert_eq!(store.count_rows(Table::Job).unwrap(), 1);
        let job = store.find_job("0.cylc-vm").unwrap().unwrap();
        assert_eq!(job["ji_queue"], Value::from("express"));
    }

    #[tokio::test]
    async fn test_resource_entries_are_append_only() {
        let mut sink = sink();
        for _ in 0..3 {
            sink.upsert_job(&record(END_EVENT)).await.unwrap();
        }
        let expected = record(END_EVENT).resources.len() as i64;
        assert_eq!(sink.store_mut().count_rows(Table::JobResource).unwrap(), expected);

        // a new value for the same resource is a new triple
        let mut changed = record(END_EVENT);
        changed
            .resources
            .insert("u_walltime".to_string(), "00:00:12".to_string());
        sink.upsert_job(&changed).await.unwrap();
        assert_eq!(
            sink.store_mut().count_rows(Table::JobResource).unwrap(),
            expected + 1
        );
    }

    #[tokio::test]
    async fn test_invalid_timestamp_writes_nothing() {
        let mut sink = sink();
        let mut bad = record(START_EVENT);
        bad.created_at = Some("not-a-time".to_string());
        let err = sink.upsert_job(&bad).await.unwrap_err();
        assert!(err.is_record_error());
        let store = sink.store_mut();
        assert_eq!(store.count_rows(Table::Job).unwrap(), 0);
        assert_eq!(store.count_rows(Table::JobResource).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_last_checkpoint() {
        let mut sink = sink();
        assert_eq!(sink.last_checkpoint().await.unwrap(), LastCheckpoint::FirstLog);

        let start = day(12).and_hms_opt(0, 0, 1).unwrap();
        let end = day(13).and_hms_opt(0, 0, 2).unwrap();
        sink.upsert_checkpoint(day(12), start, end).await.unwrap();
        sink.upsert_checkpoint(day(11), start, end).await.unwrap();
        assert_eq!(
            sink.last_checkpoint().await.unwrap(),
            LastCheckpoint::Day(day(12))
        );

        // same day again overwrites
        sink.upsert_checkpoint(day(12), start, end).await.unwrap();
        assert_eq!(sink.store_mut().count_rows(Table::Log).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_write_job_info() {
        let mut sink = sink();
        let data = serde_json::to_value(record(QUEUE_EVENT)).unwrap();
        sink.write(JOB_INFO, &data).await.unwrap();
        let job = sink.store_mut().find_job("0.cylc-vm").unwrap().unwrap();
        assert_eq!(job["ji_event_type"], Value::from(EventType::Queued.as_str()));
        assert_eq!(job["ji_start_time"], Value::Null);
    }

    #[tokio::test]
    async fn test_write_log_info() {
        let mut sink = sink();
        let data = json!({
            "filename": "2018-11-12",
            "start": "2018-11-12T00:00:01",
            "end": "2018-11-13T00:00:01",
        });
        sink.write(LOG_INFO, &data).await.unwrap();
        assert_eq!(
            sink.last_checkpoint().await.unwrap(),
            LastCheckpoint::Day(day(12))
        );
    }

    #[tokio::test]
    async fn test_write_validation() {
        let mut sink = sink();
        let err = sink.write(JOB_INFO, &json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, SinkError::InvalidArgument(kind) if kind == "array"));

        let err = sink.write("node_info", &json!({})).await.unwrap_err();
        assert!(matches!(err, SinkError::Configuration(kind) if kind == "node_info"));

        let err = sink
            .write(JOB_INFO, &json!({ "ji_jobid": "3.srv" }))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::InvalidRecord { job_id, .. } if job_id == "3.srv"));

        let err = sink
            .write(LOG_INFO, &json!({ "filename": "20181112" }))
            .await
            .unwrap_err();
        assert!(err.is_record_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_is_a_connection_error() {
        let mut sink = CheckpointedSink::new(DeadStore::default(), RetryStrategy::LinearBackoff(3, 50));
        let err = sink.upsert_job(&record(QUEUE_EVENT)).await.unwrap_err();
        assert!(matches!(err, SinkError::Connection { attempts: 3 }));
        assert_eq!(sink.store().reconnects, 3);

        let err = sink.last_checkpoint().await.unwrap_err();
        assert!(matches!(err, SinkError::Connection { .. }));
    }

    /// Wraps a working store and refuses the next commit.
    struct RefusingCommit {
        inner: SqliteStore,
        refuse: bool,
    }

    impl ReportingStore for RefusingCommit {
        fn is_alive(&mut self) -> bool {
            self.inner.is_alive()
        }
        fn reconnect(&mut self) -> Result<(), StoreError> {
            self.inner.reconnect()
        }
        fn begin(&mut self) -> Result<(), StoreError> {
            self.inner.begin()
        }
        fn commit(&mut self) -> Result<(), StoreError> {
            if std::mem::take(&mut self.refuse) {
                return Err(StoreError::Disconnected);
            }
            self.inner.commit()
        }
        fn rollback(&mut self) -> Result<(), StoreError> {
            self.inner.rollback()
        }
        fn upsert_by_key(
            &mut self,
            table: Table,
            key_columns: &[&str],
            row: &Row,
            mode: UpsertMode,
        ) -> Result<i64, StoreError> {
            self.inner.upsert_by_key(table, key_columns, row, mode)
        }
        fn query_latest(
            &mut self,
            table: Table,
            order_column: &str,
        ) -> Result<Option<Row>, StoreError> {
            self.inner.query_latest(table, order_column)
        }
    }

    #[tokio::test]
    async fn test_failed_commit_is_rolled_back() {
        let mut inner = SqliteStore::in_memory(TableNames::default()).unwrap();
        inner.provision().unwrap();
        let store = RefusingCommit { inner, refuse: true };
        let mut sink = CheckpointedSink::new(store, RetryStrategy::Immediate(1));

        let err = sink.upsert_job(&record(QUEUE_EVENT)).await.unwrap_err();
        assert!(matches!(err, SinkError::Store(StoreError::Disconnected)));
        assert_eq!(sink.store_mut().inner.count_rows(Table::Job).unwrap(), 0);

        // the next transaction can begin
        sink.upsert_job(&record(START_EVENT)).await.unwrap();
        let job = sink.store_mut().inner.find_job("0.cylc-vm").unwrap().unwrap();
        assert_eq!(job["ji_event_type"], Value::from("START"));
    }

    #[tokio::test]
    async fn test_reconnects_lost_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SqliteStore::open(dir.path().join("gestor.db"), TableNames::default()).unwrap();
        store.provision().unwrap();
        let mut sink = CheckpointedSink::new(store, RetryStrategy::Immediate(2));

        sink.upsert_job(&record(QUEUE_EVENT)).await.unwrap();
        sink.store_mut().disconnect();
        sink.upsert_job(&record(START_EVENT)).await.unwrap();

        let store = sink.store_mut();
        assert!(store.is_alive());
        assert_eq!(store.count_rows(Table::Job).unwrap(), 1);
        let job = store.find_job("0.cylc-vm").unwrap().unwrap();
        assert_eq!(job["ji_event_type"], Value::from("START"));
    }
}
