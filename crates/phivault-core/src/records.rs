use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::VaultError;

/// Opaque identifier for one encrypted record. Minted randomly, never derived from PHI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(Uuid);

impl BlobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight characters, enough to tell records apart in a list.
    pub fn short(&self) -> String {
        self.0.to_string().chars().take(8).collect()
    }
}

impl Default for BlobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for BlobId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| VaultError::InvalidInput {
                reason: format!("not a record id: {e}"),
            })
    }
}

/// Human-facing fields shown for a record in lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayFields {
    pub subject_name: String,
    /// Conventionally `YYYYMMDD`; rendered as `MM/DD/YYYY` when it has that shape.
    pub date_of_birth: String,
}

impl DisplayFields {
    pub fn new(subject_name: impl Into<String>, date_of_birth: impl Into<String>) -> Self {
        Self {
            subject_name: subject_name.into(),
            date_of_birth: date_of_birth.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.subject_name.trim().is_empty() && !self.date_of_birth.trim().is_empty()
    }

    pub fn render(&self) -> String {
        format!(
            "{} - {}",
            self.subject_name.trim(),
            render_date_of_birth(self.date_of_birth.trim())
        )
    }
}

/// Descriptor stored in the metadata index for each live blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(flatten)]
    pub display_fields: DisplayFields,
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "displayName")]
    pub rendered_display_name: String,
}

impl FileMetadata {
    pub fn new(display_fields: DisplayFields, created_at: DateTime<Utc>) -> Self {
        let rendered_display_name = display_fields.render();
        Self {
            display_fields,
            created_at,
            updated_at: created_at,
            rendered_display_name,
        }
    }

    /// Same record, new fields. Keeps `created_at`.
    pub fn revised(&self, display_fields: DisplayFields, updated_at: DateTime<Utc>) -> Self {
        Self {
            rendered_display_name: display_fields.render(),
            display_fields,
            created_at: self.created_at,
            updated_at,
        }
    }
}

/// Display value for a blob that has no index entry.
pub fn fallback_display_name(id: &BlobId) -> String {
    format!("Unindexed record {}", id.short())
}

fn render_date_of_birth(dob: &str) -> String {
    if dob.len() == 8 && dob.bytes().all(|b| b.is_ascii_digit()) {
        format!("{}/{}/{}", &dob[4..6], &dob[6..8], &dob[0..4])
    } else {
        dob.to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn renders_compact_dates_as_us_format() {
        let fields = DisplayFields::new("Jane Roe", "19800214");
        assert_eq!(fields.render(), "Jane Roe - 02/14/1980");
    }

    #[test]
    fn leaves_other_date_shapes_alone() {
        let fields = DisplayFields::new("Jane Roe", "Feb 1980");
        assert_eq!(fields.render(), "Jane Roe - Feb 1980");
    }

    #[test]
    fn incomplete_fields_are_detected() {
        assert!(!DisplayFields::new("  ", "19800214").is_complete());
        assert!(!DisplayFields::new("Jane", "").is_complete());
        assert!(DisplayFields::new("Jane", "19800214").is_complete());
    }

    #[test]
    fn revised_metadata_keeps_creation_time() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let first = FileMetadata::new(DisplayFields::new("A", "20000101"), created);
        let second = first.revised(DisplayFields::new("B", "20000102"), later);

        assert_eq!(second.created_at, created);
        assert_eq!(second.updated_at, later);
        assert_eq!(second.rendered_display_name, "B - 01/02/2000");
    }

    #[test]
    fn blob_id_parses_its_own_display() {
        let id = BlobId::new();
        let parsed: BlobId = id.to_string().parse().expect("parse");
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<BlobId>().is_err());
    }

    #[test]
    fn fallback_uses_short_id() {
        let id: BlobId = "0f8fad5b-d9cb-469f-a165-70867728950e".parse().unwrap();
        assert_eq!(fallback_display_name(&id), "Unindexed record 0f8fad5b");
    }
}
