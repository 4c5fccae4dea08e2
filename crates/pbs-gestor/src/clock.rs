// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wall-clock access.
//!
//! Log rotation and date resolution depend on "today", so the clock is injected and tests drive
//! it with [`ManualClock`].

use std::sync::{Arc, Mutex};

use chrono::{Duration, Local, NaiveDate, NaiveDateTime};

pub trait Clock: Send + Sync {
    /// Current local time.
    fn now(&self) -> NaiveDateTime;

    /// Current local calendar day. Accounting files are named after it.
    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<NaiveDateTime>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(now: NaiveDateTime) -> Self {
        ManualClock {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Starts the clock at midday on `day`.
    #[must_use]
    pub fn at_day(day: NaiveDate) -> Self {
        Self::new(day.and_hms_opt(12, 0, 0).unwrap_or_default())
    }

    pub fn set(&self, now: NaiveDateTime) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_across_midnight() {
        let day = NaiveDate::from_ymd_opt(2018, 11, 12).unwrap();
        let clock = ManualClock::at_day(day);
        assert_eq!(clock.today(), day);

        clock.advance(Duration::hours(13));
        assert_eq!(clock.today(), day.succ_opt().unwrap());
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let day = NaiveDate::from_ymd_opt(2018, 11, 12).unwrap();
        let clock = ManualClock::at_day(day);
        let shared = clock.clone();
        clock.set(day.and_hms_opt(23, 59, 59).unwrap());
        assert_eq!(shared.now(), day.and_hms_opt(23, 59, 59).unwrap());
    }
}
