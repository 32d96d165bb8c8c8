use serde::{Deserialize, Serialize};

/// Optional numeric bounds applied to a parcel query. `None` is unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParcelFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_sqft: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sqft: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterValidationError {
    #[error("Min Value ({min}) must not exceed Max Value ({max})")]
    ValueRange { min: f64, max: f64 },
    #[error("Min Sqft ({min}) must not exceed Max Sqft ({max})")]
    SqftRange { min: f64, max: f64 },
    #[error("{field} must be a number, got {input:?}")]
    NotANumber { field: &'static str, input: String },
    #[error("{field} must be a finite number")]
    NonFinite { field: &'static str },
}

impl ParcelFilters {
    pub fn is_empty(&self) -> bool {
        self.min_value.is_none()
            && self.max_value.is_none()
            && self.min_sqft.is_none()
            && self.max_sqft.is_none()
    }

    /// Rejects non-finite bounds and inverted ranges. Nothing is clamped.
    pub fn validate(&self) -> Result<(), FilterValidationError> {
        for (field, bound) in [
            ("Min Value", self.min_value),
            ("Max Value", self.max_value),
            ("Min Sqft", self.min_sqft),
            ("Max Sqft", self.max_sqft),
        ] {
            if bound.is_some_and(|v| !v.is_finite()) {
                return Err(FilterValidationError::NonFinite { field });
            }
        }
        if let (Some(min), Some(max)) = (self.min_value, self.max_value) {
            if min > max {
                return Err(FilterValidationError::ValueRange { min, max });
            }
        }
        if let (Some(min), Some(max)) = (self.min_sqft, self.max_sqft) {
            if min > max {
                return Err(FilterValidationError::SqftRange { min, max });
            }
        }
        Ok(())
    }

    /// Query parameters for the bounds that are set, in a stable order.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        [
            ("minValue", self.min_value),
            ("maxValue", self.max_value),
            ("minSqft", self.min_sqft),
            ("maxSqft", self.max_sqft),
        ]
        .into_iter()
        .filter_map(|(name, bound)| bound.map(|v| (name, v.to_string())))
        .collect()
    }
}

/// Raw text of the four filter inputs, as typed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterDraft {
    pub min_value: String,
    pub max_value: String,
    pub min_sqft: String,
    pub max_sqft: String,
}

impl FilterDraft {
    pub fn from_filters(filters: &ParcelFilters) -> Self {
        let show = |bound: Option<f64>| bound.map(|v| v.to_string()).unwrap_or_default();
        Self {
            min_value: show(filters.min_value),
            max_value: show(filters.max_value),
            min_sqft: show(filters.min_sqft),
            max_sqft: show(filters.max_sqft),
        }
    }

    /// Parses and validates the draft. Blank inputs are unset bounds.
    pub fn parse(&self) -> Result<ParcelFilters, FilterValidationError> {
        let filters = ParcelFilters {
            min_value: parse_bound("Min Value", &self.min_value)?,
            max_value: parse_bound("Max Value", &self.max_value)?,
            min_sqft: parse_bound("Min Sqft", &self.min_sqft)?,
            max_sqft: parse_bound("Max Sqft", &self.max_sqft)?,
        };
        filters.validate()?;
        Ok(filters)
    }
}

fn parse_bound(field: &'static str, input: &str) -> Result<Option<f64>, FilterValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let not_a_number = || FilterValidationError::NotANumber {
        field,
        input: input.to_string(),
    };
    let value = trimmed
        .replace(',', "")
        .parse::<f64>()
        .map_err(|_| not_a_number())?;
    if !value.is_finite() {
        return Err(not_a_number());
    }
    Ok(Some(value))
}
