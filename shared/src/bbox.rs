use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Geographic bounding box in degrees, ordered the way the data API expects it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// `W,S,E,N` as sent in the `bbox` query parameter.
    pub fn to_query_value(&self) -> String {
        format!("{},{},{},{}", self.west, self.south, self.east, self.north)
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query_value())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoundingBoxParseError {
    #[error("expected four comma-separated numbers, got {0}")]
    WrongArity(usize),
    #[error("invalid coordinate {0:?}")]
    InvalidNumber(String),
    #[error("coordinates must be finite")]
    NonFinite,
}

impl FromStr for BoundingBox {
    type Err = BoundingBoxParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(BoundingBoxParseError::WrongArity(parts.len()));
        }
        let mut values = [0.0; 4];
        for (slot, part) in values.iter_mut().zip(&parts) {
            *slot = part
                .parse::<f64>()
                .map_err(|_| BoundingBoxParseError::InvalidNumber((*part).to_string()))?;
            if !slot.is_finite() {
                return Err(BoundingBoxParseError::NonFinite);
            }
        }
        Ok(Self::new(values[0], values[1], values[2], values[3]))
    }
}
