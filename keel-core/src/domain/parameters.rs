//! Job parameters and instance identity
//!
//! A job's parameters are split into identifying and non-identifying entries.
//! Only the identifying entries take part in the [`JobKey`], so two launches
//! that differ solely in non-identifying values resolve to the same instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Errors raised while deriving parameter identity
#[derive(Debug, thiserror::Error)]
pub enum ParameterError {
    #[error("Failed to canonicalize job parameters: {0}")]
    Canonicalization(String),

    #[error("Job parameter '{name}' must be a finite number, got {value}")]
    NonFiniteDouble { name: String, value: f64 },
}

/// Typed value of a single job parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Date(DateTime<Utc>),
    Boolean(bool),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::String(value) => write!(f, "{}", value),
            ParameterValue::Long(value) => write!(f, "{}", value),
            ParameterValue::Double(value) => write!(f, "{}", value),
            ParameterValue::Date(value) => write!(f, "{}", value.to_rfc3339()),
            ParameterValue::Boolean(value) => write!(f, "{}", value),
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Long(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Double(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Boolean(value)
    }
}

impl From<DateTime<Utc>> for ParameterValue {
    fn from(value: DateTime<Utc>) -> Self {
        ParameterValue::Date(value)
    }
}

/// A parameter value plus whether it contributes to instance identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: ParameterValue,
    pub identifying: bool,
}

impl JobParameter {
    pub fn identifying(value: impl Into<ParameterValue>) -> Self {
        Self {
            value: value.into(),
            identifying: true,
        }
    }

    pub fn non_identifying(value: impl Into<ParameterValue>) -> Self {
        Self {
            value: value.into(),
            identifying: false,
        }
    }
}

/// Parameter set for a job launch, ordered by parameter name
///
/// Equality compares every entry. Compare [`JobParameters::identifying`]
/// subsets to check identity only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters {
    entries: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> JobParametersBuilder {
        JobParametersBuilder::default()
    }

    /// Inserts a parameter, returning the previous entry under that name
    pub fn insert(&mut self, name: impl Into<String>, parameter: JobParameter) -> Option<JobParameter> {
        self.entries.insert(name.into(), parameter)
    }

    pub fn get(&self, name: &str) -> Option<&JobParameter> {
        self.entries.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&ParameterValue> {
        self.entries.get(name).map(|p| &p.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobParameter)> {
        self.entries.iter()
    }

    /// Returns the identifying subset of these parameters
    pub fn identifying(&self) -> JobParameters {
        let entries = self
            .entries
            .iter()
            .filter(|(_, p)| p.identifying)
            .map(|(name, p)| (name.clone(), p.clone()))
            .collect();

        JobParameters { entries }
    }

    pub fn has_identifying(&self) -> bool {
        self.entries.values().any(|p| p.identifying)
    }

    /// Rejects values that cannot be stored and read back as JSON
    ///
    /// NaN and the infinities serialize to `null`, which would both collapse
    /// distinct identities and fail to deserialize later.
    pub fn validate(&self) -> Result<(), ParameterError> {
        for (name, parameter) in &self.entries {
            if let ParameterValue::Double(value) = parameter.value {
                if !value.is_finite() {
                    return Err(ParameterError::NonFiniteDouble {
                        name: name.clone(),
                        value,
                    });
                }
            }
        }
        Ok(())
    }

    /// Derives the instance identity key for these parameters
    pub fn job_key(&self) -> Result<JobKey, ParameterError> {
        JobKey::from_parameters(self)
    }
}

impl fmt::Display for JobParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (idx, (name, parameter)) in self.entries.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, parameter.value)?;
            if !parameter.identifying {
                write!(f, " (non-identifying)")?;
            }
        }
        write!(f, "}}")
    }
}

/// Builder for [`JobParameters`]
#[derive(Debug, Default)]
pub struct JobParametersBuilder {
    parameters: JobParameters,
}

impl JobParametersBuilder {
    /// Adds an identifying parameter
    pub fn add(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(name, JobParameter::identifying(value));
        self
    }

    /// Adds a parameter that is recorded on the execution but ignored for identity
    pub fn add_non_identifying(
        mut self,
        name: impl Into<String>,
        value: impl Into<ParameterValue>,
    ) -> Self {
        self.parameters
            .insert(name, JobParameter::non_identifying(value));
        self
    }

    pub fn build(self) -> JobParameters {
        self.parameters
    }
}

/// Stable identity key of a job instance
///
/// Lowercase hex SHA-256 of the RFC 8785 canonical JSON of the identifying
/// parameters. The job name is not part of the key; instances are looked up
/// by `(job_name, job_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn from_parameters(parameters: &JobParameters) -> Result<Self, ParameterError> {
        parameters.identifying().validate()?;

        let identifying: BTreeMap<&str, &ParameterValue> = parameters
            .entries
            .iter()
            .filter(|(_, p)| p.identifying)
            .map(|(name, p)| (name.as_str(), &p.value))
            .collect();

        let canonical = serde_json_canonicalizer::to_vec(&identifying)
            .map_err(|e| ParameterError::Canonicalization(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Wraps a key previously produced by [`JobKey::from_parameters`]
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
