use std::fmt;

use serde::{Deserialize, Serialize};

/// A value as carried on the message bus, before it is decoded into a typed signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variant {
    Bool(bool),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Array(Vec<Variant>),
    /// A single `name -> value` dictionary entry.
    Entry(String, Box<Variant>),
}

impl Variant {
    pub fn entry(name: impl Into<String>, value: Variant) -> Self {
        Variant::Entry(name.into(), Box::new(value))
    }

    /// Short signature-style tag, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Variant::Bool(_) => "b",
            Variant::I32(_) => "i",
            Variant::U32(_) => "u",
            Variant::I64(_) => "x",
            Variant::U64(_) => "t",
            Variant::F64(_) => "d",
            Variant::Str(_) => "s",
            Variant::Array(_) => "a",
            Variant::Entry(..) => "{sv}",
        }
    }
}

/// Unique bus address of a remote publisher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublisherId {
    pub unique_name: String,
    pub path: String,
}

impl PublisherId {
    pub fn new(unique_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            unique_name: unique_name.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.unique_name, self.path)
    }
}

/// Latest time/price signal advertised by one publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSample {
    pub time: u32,
    pub price: i32,
}

/// Setpoints and energy accumulators of the local resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub import_watts: u32,
    pub export_watts: u32,
    pub import_energy_wh: f64,
    pub export_energy_wh: f64,
}
