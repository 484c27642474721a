use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Expiration rule binding a (table, column) pair to a maximum row age.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlPolicy {
    pub table_name: String,
    pub column_name: String,
    /// Rows whose column value is older than this many seconds are deleted.
    pub expire_after_seconds: i64,
    /// Inactive policies are kept but never applied.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateTtlPolicy {
    /// Table to expire rows from (case-sensitive)
    #[validate(length(min = 1, max = 63), custom(function = "validate_identifier"))]
    pub table_name: String,
    /// Timestamp, timestamptz or date column holding the row's age
    #[validate(length(min = 1, max = 63), custom(function = "validate_identifier"))]
    pub column_name: String,
    /// Maximum row age in seconds
    #[validate(range(min = 1))]
    pub expire_after_seconds: i64,
}

/// Identifiers are quoted when interpolated into SQL, but NUL can never be
/// part of one.
fn validate_identifier(value: &str) -> Result<(), validator::ValidationError> {
    if value.contains('\0') {
        return Err(validator::ValidationError::new("identifier_contains_nul"));
    }
    Ok(())
}

/// Column types a policy may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalType {
    Timestamp,
    TimestampTz,
    Date,
}

impl TemporalType {
    /// Classify a declared column type as reported by the database catalog.
    ///
    /// Returns `None` for anything that isn't a timestamp or date type.
    pub fn from_type_name(type_name: &str) -> Option<Self> {
        match type_name.trim().to_ascii_lowercase().as_str() {
            "timestamp" | "timestamp without time zone" | "datetime" => Some(Self::Timestamp),
            "timestamptz" | "timestamp with time zone" => Some(Self::TimestampTz),
            "date" => Some(Self::Date),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporal_type_from_postgres_names() {
        assert_eq!(
            TemporalType::from_type_name("timestamp without time zone"),
            Some(TemporalType::Timestamp)
        );
        assert_eq!(
            TemporalType::from_type_name("timestamp with time zone"),
            Some(TemporalType::TimestampTz)
        );
        assert_eq!(TemporalType::from_type_name("date"), Some(TemporalType::Date));
    }

    #[test]
    fn test_temporal_type_from_sqlite_names() {
        assert_eq!(
            TemporalType::from_type_name("DATETIME"),
            Some(TemporalType::Timestamp)
        );
        assert_eq!(
            TemporalType::from_type_name("TIMESTAMPTZ"),
            Some(TemporalType::TimestampTz)
        );
        assert_eq!(TemporalType::from_type_name(" Date "), Some(TemporalType::Date));
    }

    #[test]
    fn test_non_temporal_types_rejected() {
        for name in ["text", "integer", "time", "interval", "timestamp[]", ""] {
            assert_eq!(TemporalType::from_type_name(name), None, "{name}");
        }
    }

    #[test]
    fn test_create_policy_validation() {
        let valid = CreateTtlPolicy {
            table_name: "orders".into(),
            column_name: "created_at".into(),
            expire_after_seconds: 86400,
        };
        assert!(valid.validate().is_ok());

        let zero = CreateTtlPolicy {
            expire_after_seconds: 0,
            ..valid.clone()
        };
        assert!(zero.validate().is_err());

        let empty = CreateTtlPolicy {
            table_name: String::new(),
            ..valid.clone()
        };
        assert!(empty.validate().is_err());

        let nul = CreateTtlPolicy {
            column_name: "created\0at".into(),
            ..valid
        };
        assert!(nul.validate().is_err());
    }
}
