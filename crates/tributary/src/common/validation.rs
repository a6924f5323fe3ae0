//! Connection parameter validation
//!
//! Identifiers travel into SQL and protocol packets; reject anything that
//! is not a plain SQL identifier before a connection is opened.

use crate::common::{CdcError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

const MAX_IDENTIFIER_LENGTH: usize = 255;

static IDENTIFIER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]{0,254}$").unwrap());

/// Validator for connection inputs
pub struct Validator;

impl Validator {
    /// Validate a SQL identifier (user, database, table).
    pub fn validate_identifier(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(CdcError::config("identifier cannot be empty"));
        }

        if name.len() > MAX_IDENTIFIER_LENGTH {
            return Err(CdcError::config(format!(
                "identifier too long: {} chars (max: {MAX_IDENTIFIER_LENGTH})",
                name.len()
            )));
        }

        if !IDENTIFIER_REGEX.is_match(name) {
            return Err(CdcError::config(format!(
                "invalid identifier '{name}': must start with a letter or underscore and \
                 contain only alphanumeric characters and underscores"
            )));
        }

        Ok(())
    }
}
