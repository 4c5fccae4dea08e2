// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parser for PBS accounting log lines.
//!
//! A line has the shape `<timestamp>;<job_state>;<job_id>;<key=value ...>`. Attributes are
//! sorted into three buckets: job attributes allowed for the job state, requested resources
//! (`Resource_List.*`) and used resources (`resources_used.*`). Anything else is dropped so
//! that newer PBS releases adding attributes don't break ingestion.

use std::collections::BTreeMap;
use std::fmt;

use tracing::info;

use crate::errors::ParseError;

const REQUESTED_PREFIX: &str = "Resource_List.";
const USED_PREFIX: &str = "resources_used.";

/// Record type PBS uses for its own license/diagnostic entries.
const DIAGNOSTIC_RECORD: &str = "L";

const QUEUED_ATTRIBUTES: &[&str] = &["queue"];

const STARTED_ATTRIBUTES: &[&str] = &[
    "accounting_id",
    "ctime",
    "etime",
    "exec_host",
    "exec_vnode",
    "group",
    "jobname",
    "project",
    "qtime",
    "queue",
    "session",
    "start",
    "user",
];

const ENDED_ATTRIBUTES: &[&str] = &[
    "account",
    "accounting_id",
    "alt_id",
    "ctime",
    "eligible_time",
    "end",
    "etime",
    "exec_host",
    "exec_vnode",
    "Exit_status",
    "group",
    "jobname",
    "project",
    "qtime",
    "queue",
    "run_count",
    "session",
    "start",
    "user",
];

/// Job state transition recorded by an accounting line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Started,
    Ended,
}

impl JobState {
    fn from_code(code: &str) -> Option<Self> {
        match code {
            "Q" => Some(JobState::Queued),
            "S" => Some(JobState::Started),
            "E" => Some(JobState::Ended),
            _ => None,
        }
    }

    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            JobState::Queued => "Q",
            JobState::Started => "S",
            JobState::Ended => "E",
        }
    }

    /// Attributes stored verbatim for this state. End records carry the superset.
    #[must_use]
    pub fn attributes(self) -> &'static [&'static str] {
        match self {
            JobState::Queued => QUEUED_ATTRIBUTES,
            JobState::Started => STARTED_ATTRIBUTES,
            JobState::Ended => ENDED_ATTRIBUTES,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One accounting line split into its structured parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    pub log_date: String,
    pub job_state: JobState,
    pub job_id: String,
    /// Whitelisted job attributes for `job_state`.
    pub attributes: BTreeMap<String, String>,
    /// `Resource_List.<name>` values keyed by `<name>`.
    pub requested: BTreeMap<String, String>,
    /// `resources_used.<name>` values keyed by `<name>`.
    pub used: BTreeMap<String, String>,
}

/// Returns true for the `L` records PBS writes into the accounting log for its own use.
#[must_use]
pub fn is_diagnostic(line: &str) -> bool {
    let mut fields = line.split(';');
    let record_type = fields.nth(1);
    record_type == Some(DIAGNOSTIC_RECORD) && line.split(';').count() == 4
}

/// Parses a single accounting log line.
///
/// # Errors
///
/// Returns a [`ParseError`] when the line doesn't have exactly four `;`-separated fields, when
/// the job state is not one of `Q`, `S`, `E`, or when an attribute token has no `=`.
pub fn parse(line: &str) -> Result<ParsedEvent, ParseError> {
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    let fields: Vec<&str> = line.split(';').collect();
    let [log_date, state, job_id, attributes] = fields.as_slice() else {
        return Err(ParseError::FieldCount {
            found: fields.len(),
            line: line.to_string(),
        });
    };

    let job_state = JobState::from_code(state).ok_or_else(|| ParseError::UnknownJobState {
        state: (*state).to_string(),
        job_id: (*job_id).to_string(),
    })?;

    let mut event = ParsedEvent {
        log_date: (*log_date).to_string(),
        job_state,
        job_id: (*job_id).to_string(),
        attributes: BTreeMap::new(),
        requested: BTreeMap::new(),
        used: BTreeMap::new(),
    };

    let allowed = job_state.attributes();
    for token in attributes.split(' ') {
        let Some((key, value)) = token.split_once('=') else {
            return Err(malformed(token, job_id));
        };

        if allowed.contains(&key) {
            event
                .attributes
                .insert(key.to_string(), value.trim().to_string());
        } else if let Some(name) = key.strip_prefix(REQUESTED_PREFIX) {
            if name.is_empty() {
                return Err(malformed(token, job_id));
            }
            event.requested.insert(name.to_string(), value.to_string());
        } else if let Some(name) = key.strip_prefix(USED_PREFIX) {
            if name.is_empty() {
                return Err(malformed(token, job_id));
            }
            event.used.insert(name.to_string(), value.to_string());
        } else {
            info!(
                "Found an undefined PBS job variable {} with value {} for job {}, skipping it",
                key, value, job_id
            );
        }
    }

    Ok(event)
}

fn malformed(token: &str, job_id: &str) -> ParseError {
    ParseError::MalformedToken {
        token: token.to_string(),
        job_id: job_id.to_string(),
    }
}
