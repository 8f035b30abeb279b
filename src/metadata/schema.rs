//! Identity schema per data kind and metadata fingerprints
//!
//! The fingerprint is the canonicalized identity-defining subset of a
//! Datasource's metadata. Two uploads with the same fingerprint belong to
//! the same logical series.

use super::value::{Filters, Metadata};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Metadata key naming the data kind.
pub const DATA_TYPE_KEY: &str = "data_type";

/// Kinds of data held in a bucket, each with its own identity keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Surface,
    Column,
    Flux,
    Footprint,
    BoundaryConditions,
    FluxTimeseries,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Surface => "surface",
            Self::Column => "column",
            Self::Flux => "flux",
            Self::Footprint => "footprint",
            Self::BoundaryConditions => "boundary_conditions",
            Self::FluxTimeseries => "flux_timeseries",
        }
    }

    /// Identity keys that must be present.
    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            Self::Surface => &["site", "species", "inlet"],
            Self::Column => &["species"],
            Self::Flux => &["species", "source", "domain"],
            Self::Footprint => &["site", "domain", "model", "inlet"],
            Self::BoundaryConditions => &["species", "bc_input", "domain"],
            Self::FluxTimeseries => &["species", "source", "region"],
        }
    }

    /// Identity keys that join the fingerprint when present.
    pub fn optional_keys(&self) -> &'static [&'static str] {
        match self {
            Self::Surface => &["network", "instrument", "sampling_period"],
            Self::Column => &["satellite", "site", "domain", "selection", "platform"],
            Self::Flux => &["database", "model"],
            Self::Footprint => &["species", "met_model", "time_resolved"],
            Self::BoundaryConditions => &[],
            Self::FluxTimeseries => &[],
        }
    }

    /// Whether `key` takes part in this kind's identity.
    pub fn is_identity_key(&self, key: &str) -> bool {
        key == DATA_TYPE_KEY
            || self.required_keys().contains(&key)
            || self.optional_keys().contains(&key)
    }

    /// Read the kind from the `data_type` metadata key.
    pub fn from_metadata(metadata: &Metadata) -> Result<Self> {
        let raw = metadata.canonical(DATA_TYPE_KEY).ok_or_else(|| {
            Error::InvalidMetadata(format!("metadata has no scalar '{}' key", DATA_TYPE_KEY))
        })?;
        raw.parse()
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "surface" => Ok(Self::Surface),
            "column" => Ok(Self::Column),
            "flux" | "emissions" => Ok(Self::Flux),
            "footprint" | "footprints" => Ok(Self::Footprint),
            "boundary_conditions" => Ok(Self::BoundaryConditions),
            "flux_timeseries" => Ok(Self::FluxTimeseries),
            other => Err(Error::InvalidMetadata(format!(
                "unknown data_type '{}'; expected one of surface, column, flux, footprint, boundary_conditions, flux_timeseries",
                other
            ))),
        }
    }
}

/// Canonicalized identity of a Datasource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint {
    kind: DataKind,
    pairs: BTreeMap<String, String>,
}

impl Fingerprint {
    /// Compute the fingerprint of `metadata`.
    pub fn of(metadata: &Metadata) -> Result<Self> {
        let kind = DataKind::from_metadata(metadata)?;
        let mut pairs = BTreeMap::new();

        for key in kind.required_keys() {
            let value = metadata.canonical(key).ok_or_else(|| {
                Error::InvalidMetadata(format!(
                    "{} data requires a scalar '{}' key",
                    kind, key
                ))
            })?;
            if value.is_empty() {
                return Err(Error::InvalidMetadata(format!(
                    "{} data has an empty '{}' value",
                    kind, key
                )));
            }
            pairs.insert(key.to_string(), value);
        }

        for key in kind.optional_keys() {
            if let Some(value) = metadata.canonical(key) {
                pairs.insert(key.to_string(), value);
            }
        }

        Ok(Self { kind, pairs })
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }

    /// Exact-match filters selecting candidates for this fingerprint.
    pub fn to_filters(&self) -> Filters {
        self.pairs.iter().fold(
            Filters::new().with(DATA_TYPE_KEY, self.kind.as_str()),
            |filters, (key, value)| filters.with(key, value.as_str()),
        )
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", DATA_TYPE_KEY, self.kind)?;
        for (key, value) in &self.pairs {
            write!(f, ";{}={}", key, value)?;
        }
        Ok(())
    }
}
