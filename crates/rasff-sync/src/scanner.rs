//! Which weekly bulletins are still missing from the store.

use std::iter::FusedIterator;

use chrono::NaiveDate;
use rasff_core::Period;
use rasff_storage::{AlertStore, StoreError};

/// Ascending periods after the latest stored one, up to and including the
/// week containing the as-of date.
#[derive(Debug, Clone)]
pub struct MissingPeriods {
    next: Option<Period>,
    last: Period,
}

impl Iterator for MissingPeriods {
    type Item = Period;

    fn next(&mut self) -> Option<Period> {
        let current = self.next?;
        if current > self.last {
            self.next = None;
            return None;
        }
        self.next = Some(current.next());
        Some(current)
    }
}

impl FusedIterator for MissingPeriods {}

/// Starts after `latest`, or at `epoch` itself when nothing is stored yet.
pub fn missing_periods(latest: Option<Period>, epoch: Period, as_of: NaiveDate) -> MissingPeriods {
    let first = match latest {
        Some(latest) => latest.next(),
        None => epoch,
    };
    MissingPeriods {
        next: Some(first),
        last: Period::containing(as_of),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PeriodScanner {
    epoch: Period,
}

impl PeriodScanner {
    pub fn new(epoch: Period) -> Self {
        Self { epoch }
    }

    pub fn epoch(&self) -> Period {
        self.epoch
    }

    pub async fn scan(&self, store: &AlertStore, as_of: NaiveDate) -> Result<MissingPeriods, StoreError> {
        let latest = store.latest_period().await?;
        Ok(missing_periods(latest, self.epoch, as_of))
    }
}
