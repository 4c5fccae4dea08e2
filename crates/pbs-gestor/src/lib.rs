// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion of PBS Pro accounting logs into a relational reporting store.
//!
//! Lines flow from a [`LogSource`] through [`parser::parse`] and [`event::build`] into a
//! [`CheckpointedSink`]; the [`Orchestrator`] sequences sources over a date range and then
//! keeps following the current day's log.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod clock;
pub mod config;
pub mod errors;
pub mod event;
pub mod log_source;
pub mod orchestrator;
pub mod parser;
pub mod retry;
pub mod sink;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GestorConfig;
pub use errors::{ConfigError, GestorError, ParseError, SinkError, SourceError, StoreError};
pub use event::{EventType, JobRecord};
pub use log_source::{LogSource, SourceMode, SourceSettings};
pub use orchestrator::{DateSpec, Orchestrator};
pub use retry::RetryStrategy;
pub use sink::{CheckpointedSink, LastCheckpoint};
pub use store::{ReportingStore, SqliteStore, TableNames};
