// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Canonical job records built from parsed accounting events.
//!
//! The queue, start and end lines of one job arrive separately; each one is built into a full
//! [`JobRecord`] and the store merges them by `job_id`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::parser::ParsedEvent;

/// Prefix for resources requested at submission (`Resource_List.*`).
pub const REQUESTED_RESOURCE_PREFIX: &str = "l_";
/// Prefix for resources reported as consumed (`resources_used.*`).
pub const USED_RESOURCE_PREFIX: &str = "u_";

const EXEC_HOST: &str = "exec_host";
const EXEC_VNODE: &str = "exec_vnode";

/// Priority is not part of the accounting records, every job gets the same value.
const DEFAULT_PRIORITY: i64 = 1;

/// Lifecycle stage of a job, derived from its start and end timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Queued,
    Start,
    End,
    Unknown,
}

impl EventType {
    /// Classifies a job from its start and end attributes.
    ///
    /// The outer `Option` tells whether the attribute exists on the record at all, the inner one
    /// whether it holds a value.
    #[must_use]
    pub fn classify(start: Option<Option<&str>>, end: Option<Option<&str>>) -> Self {
        let (Some(start), Some(end)) = (start, end) else {
            return EventType::Unknown;
        };
        match (start, end) {
            (Some(_), Some(_)) => EventType::End,
            (Some(_), None) => EventType::Start,
            (None, None) => EventType::Queued,
            (None, Some(_)) => EventType::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Queued => "QUEUED",
            EventType::Start => "START",
            EventType::End => "END",
            EventType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as stored in the reporting database.
///
/// Timestamps and counters are kept as the raw strings found in the log, conversion to typed
/// columns happens when the record is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(rename = "ji_jobid")]
    pub job_id: String,
    #[serde(rename = "ji_jobname", default)]
    pub job_name: String,
    #[serde(rename = "ji_user", default)]
    pub user: String,
    #[serde(rename = "ji_group", default)]
    pub group: String,
    #[serde(rename = "ji_project", default)]
    pub project: String,
    #[serde(rename = "ji_sv_name", default)]
    pub server_name: String,
    #[serde(rename = "ji_queue", default)]
    pub queue: String,
    #[serde(rename = "ji_priority", default = "default_priority")]
    pub priority: i64,
    #[serde(rename = "ji_cr_time", default)]
    pub created_at: Option<String>,
    #[serde(rename = "ji_quetime", default)]
    pub queued_at: Option<String>,
    #[serde(rename = "ji_eligible_time", default)]
    pub eligible_time: Option<String>,
    #[serde(rename = "ji_start_time", default)]
    pub start_time: Option<String>,
    #[serde(rename = "ji_end_time", default)]
    pub end_time: Option<String>,
    #[serde(rename = "ji_runcount", default)]
    pub run_count: Option<String>,
    #[serde(rename = "ji_sessionid", default)]
    pub session_id: Option<String>,
    #[serde(rename = "ji_exitstat", default)]
    pub exit_status: Option<String>,
    #[serde(rename = "ji_exechost", default)]
    pub exec_host: Option<Vec<String>>,
    #[serde(rename = "ji_execvnode", default)]
    pub exec_vnode: Option<Vec<String>>,
    /// `l_<name>` / `u_<name>` resource names to their values.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    pub event_type: EventType,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

/// A single `(job, resource, value)` row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceEntry {
    pub job_id: String,
    pub name: String,
    pub value: String,
}

impl JobRecord {
    /// Resource rows for this job, in name order.
    #[must_use]
    pub fn resource_entries(&self) -> Vec<ResourceEntry> {
        self.resources
            .iter()
            .map(|(name, value)| ResourceEntry {
                job_id: self.job_id.clone(),
                name: name.clone(),
                value: value.clone(),
            })
            .collect()
    }
}

/// Builds the canonical record for a parsed event. Never fails: missing attributes fall back
/// to `None` or an empty string.
#[must_use]
pub fn build(event: &ParsedEvent) -> JobRecord {
    let attr = |key: &str| event.attributes.get(key).cloned();
    let text = |key: &str| attr(key).unwrap_or_default();

    let server_name = event
        .job_id
        .split('.')
        .nth(1)
        .unwrap_or_default()
        .to_string();

    let mut resources = BTreeMap::new();
    for (name, value) in &event.requested {
        if name.is_empty() && value.is_empty() {
            continue;
        }
        resources.insert(format!("{REQUESTED_RESOURCE_PREFIX}{name}"), value.clone());
    }

    let mut exec_host = None;
    let mut exec_vnode = None;
    for (name, value) in &event.used {
        if name.is_empty() && value.is_empty() {
            continue;
        }
        match name.as_str() {
            EXEC_HOST => exec_host = Some(split_hosts(value)),
            EXEC_VNODE => exec_vnode = Some(split_hosts(value)),
            _ => {
                resources.insert(format!("{USED_RESOURCE_PREFIX}{name}"), value.clone());
            }
        }
    }
    // S and E records carry the placement at top level as well
    let exec_host = exec_host.or_else(|| attr(EXEC_HOST).map(|v| split_hosts(&v)));
    let exec_vnode = exec_vnode.or_else(|| attr(EXEC_VNODE).map(|v| split_hosts(&v)));

    let start_time = attr("start");
    let end_time = attr("end");
    let event_type = EventType::classify(Some(start_time.as_deref()), Some(end_time.as_deref()));

    JobRecord {
        job_id: event.job_id.clone(),
        job_name: text("jobname"),
        user: text("user"),
        group: text("group"),
        project: text("project"),
        server_name,
        queue: text("queue"),
        priority: DEFAULT_PRIORITY,
        created_at: attr("ctime"),
        queued_at: attr("qtime"),
        eligible_time: attr("etime"),
        start_time,
        end_time,
        run_count: attr("run_count"),
        session_id: attr("session"),
        exit_status: attr("Exit_status"),
        exec_host,
        exec_vnode,
        resources,
        event_type,
    }
}

fn split_hosts(value: &str) -> Vec<String> {
    value.split('+').map(str::to_string).collect()
}
