//! Configuration-related errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building routing policy from user configuration.
///
/// These are never retried: they surface at construction time.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum ConfigError {
    /// `application_region` is not a recognized region name
    #[error("Invalid application region '{region}': not a recognized region name")]
    InvalidRegion {
        /// The region string exactly as supplied
        region: String,
    },

    /// Both `application_region` and `preferred_regions` were supplied
    #[error("application_region and preferred_regions cannot both be set")]
    ConflictingRegionOptions,

    /// A regional default endpoint did not match any region of the account
    #[error("Regional endpoint {endpoint} does not match any region of the account")]
    UnresolvedRegionalEndpoint {
        /// The default endpoint supplied by the caller
        endpoint: String,
    },

    /// An endpoint string could not be parsed as an absolute URL
    #[error("Invalid endpoint '{endpoint}': {message}")]
    InvalidEndpoint {
        /// The offending endpoint string
        endpoint: String,
        /// Description of the parse failure
        message: String,
    },

    /// Config validation error (invalid values)
    #[error("Config validation error for {field}: {message}")]
    ValidationError {
        /// Name of the field that failed validation
        field: String,
        /// Description of the validation failure
        message: String,
    },

    /// Environment override could not be parsed
    #[error("Config parse error: {message}")]
    ParseError {
        /// Description of the parse failure
        message: String,
    },
}

impl ConfigError {
    /// Create a parse error from a serde_json error.
    pub fn from_json_error(e: &serde_json::Error) -> Self {
        Self::ParseError { message: e.to_string() }
    }

    /// Flatten validator output into the first failing field.
    ///
    /// Nested config sections are named by their dotted path (`quorum.max_replica_set_size`).
    pub fn from_validation_errors(errors: &validator::ValidationErrors) -> Self {
        let (field, message) =
            first_field_error(errors, "").unwrap_or_else(|| ("config".to_string(), errors.to_string()));
        Self::ValidationError { field, message }
    }
}

fn first_field_error(errors: &validator::ValidationErrors, prefix: &str) -> Option<(String, String)> {
    let mut entries: Vec<_> = errors.errors().iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries.into_iter().find_map(|(field, kind)| {
        let path = if prefix.is_empty() { field.to_string() } else { format!("{prefix}.{field}") };
        match kind {
            validator::ValidationErrorsKind::Field(errs) => errs.first().map(|e| {
                let message = e.message.as_ref().map_or_else(|| e.code.to_string(), ToString::to_string);
                (path, message)
            }),
            validator::ValidationErrorsKind::Struct(nested) => first_field_error(nested, &path),
            validator::ValidationErrorsKind::List(items) => {
                items.iter().find_map(|(index, nested)| first_field_error(nested, &format!("{path}[{index}]")))
            },
        }
    })
}
