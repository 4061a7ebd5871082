use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use types::{PublisherId, SignalSample, Variant};

pub const EMS_NAME: &str = "EMSName";
pub const TIME: &str = "Time";
pub const PRICE: &str = "price";

/// Properties a publisher is subscribed for.
pub const SIGNAL_PROPERTIES: [&str; 3] = [EMS_NAME, TIME, PRICE];

/// One decoded entry of a property-change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalUpdate {
    Price(i32),
    Time(u32),
    Unknown(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("change set is not an array of entries (got '{0}')")]
    NotEntries(&'static str),
    #[error("invalid property change: expected '{{sv}}' entry, got '{0}'")]
    MalformedEntry(&'static str),
    #[error("property {name} expected '{expected}', got '{found}'")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Decodes a single `{sv}` entry.
pub fn decode_entry(entry: &Variant) -> Result<SignalUpdate, DecodeError> {
    let (name, value) = match entry {
        Variant::Entry(name, value) => (name.as_str(), value.as_ref()),
        other => return Err(DecodeError::MalformedEntry(other.kind())),
    };

    match name {
        PRICE => match value {
            Variant::I32(price) => Ok(SignalUpdate::Price(*price)),
            other => Err(mismatch(name, "i", other)),
        },
        TIME => match value {
            Variant::U32(time) => Ok(SignalUpdate::Time(*time)),
            other => Err(mismatch(name, "u", other)),
        },
        _ => Ok(SignalUpdate::Unknown(name.to_string())),
    }
}

/// Decodes an `a{sv}` change set. The outer error means nothing in the set was usable;
/// inner errors belong to individual entries only.
pub fn decode_changes(
    changed: &Variant,
) -> Result<Vec<Result<SignalUpdate, DecodeError>>, DecodeError> {
    match changed {
        Variant::Array(entries) => Ok(entries.iter().map(decode_entry).collect()),
        other => Err(DecodeError::NotEntries(other.kind())),
    }
}

fn mismatch(name: &str, expected: &'static str, found: &Variant) -> DecodeError {
    DecodeError::TypeMismatch {
        name: name.to_string(),
        expected,
        found: found.kind(),
    }
}

/// Writes one update into a sample. Returns whether a field was touched.
pub fn apply_update(sample: &mut SignalSample, update: &SignalUpdate) -> bool {
    match update {
        SignalUpdate::Price(price) => {
            sample.price = *price;
            true
        }
        SignalUpdate::Time(time) => {
            sample.time = *time;
            true
        }
        SignalUpdate::Unknown(_) => false,
    }
}

/// Outcome of applying one change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied: usize,
    pub ignored: usize,
    pub failed: usize,
}

/// Latest signal per publisher. Entries outlive the publisher's presence on the bus.
#[derive(Debug, Default)]
pub struct SignalStore {
    samples: Mutex<HashMap<PublisherId, SignalSample>>,
}

impl SignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty sample for the publisher unless one already exists.
    pub fn register(&self, publisher: &PublisherId) {
        self.lock().entry(publisher.clone()).or_default();
    }

    pub fn apply_changes(
        &self,
        publisher: &PublisherId,
        changed: &Variant,
    ) -> Result<ApplyReport, DecodeError> {
        let updates = decode_changes(changed)?;
        let mut report = ApplyReport::default();
        let mut samples = self.lock();
        let sample = samples.entry(publisher.clone()).or_default();

        for update in updates {
            match update {
                Ok(update) => {
                    if apply_update(sample, &update) {
                        report.applied += 1;
                    } else {
                        debug!(publisher = %publisher, update = ?update, "ignoring property");
                        report.ignored += 1;
                    }
                }
                Err(err) => {
                    warn!(publisher = %publisher, error = %err, "skipping property entry");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    pub fn get(&self, publisher: &PublisherId) -> Option<SignalSample> {
        self.lock().get(publisher).copied()
    }

    pub fn snapshot(&self) -> Vec<(PublisherId, SignalSample)> {
        let mut all: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, sample)| (id.clone(), *sample))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PublisherId, SignalSample>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
