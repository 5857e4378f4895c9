//! Column mapping (import step 2) and the row re-validation that runs
//! under it.
//!
//! A mapping ties source column names to a closed set of target fields.
//! It is validated as a whole before anything is applied; applying it
//! turns positional raw rows into immutable field rows and collects every
//! per-row problem instead of stopping at the first.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::ImportError;
use crate::normalize::normalize;
use crate::session::{Issue, RawRow};

/// The fields an import can populate. Closed set; the mapping step rejects
/// anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetField {
    Name,
    ClassGroup,
    StudentNo,
    BirthDate,
    Email,
}

impl TargetField {
    pub const ALL: [TargetField; 5] = [
        TargetField::Name,
        TargetField::ClassGroup,
        TargetField::StudentNo,
        TargetField::BirthDate,
        TargetField::Email,
    ];

    pub const REQUIRED: [TargetField; 2] = [TargetField::Name, TargetField::ClassGroup];

    /// Fields that discriminate between people who share a name.
    pub const SECONDARY: [TargetField; 3] = [
        TargetField::StudentNo,
        TargetField::BirthDate,
        TargetField::Email,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TargetField::Name => "name",
            TargetField::ClassGroup => "class_group",
            TargetField::StudentNo => "student_no",
            TargetField::BirthDate => "birth_date",
            TargetField::Email => "email",
        }
    }

    pub fn from_str(s: &str) -> Option<TargetField> {
        TargetField::ALL.into_iter().find(|f| f.as_str() == s)
    }
}

/// Validated source-column → target-field association.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    /// (header index, target field), in source order.
    entries: Vec<(usize, TargetField)>,
}

impl ColumnMapping {
    /// Checks a raw mapping against the session's headers: every source
    /// column must exist, no target may be mapped twice, and all required
    /// targets must be covered. Fatal to the call; the session stays put.
    pub fn validate(
        raw: &[(String, TargetField)],
        headers: &[String],
    ) -> Result<ColumnMapping, ImportError> {
        let mut entries = Vec::with_capacity(raw.len());
        let mut seen = HashSet::new();
        for (source, field) in raw {
            let Some(index) = headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(source.trim()))
            else {
                return Err(ImportError::mapping(format!(
                    "source column '{source}' not found in file headers"
                )));
            };
            if !seen.insert(*field) {
                return Err(ImportError::mapping(format!(
                    "target field '{}' is mapped more than once",
                    field.as_str()
                )));
            }
            entries.push((index, *field));
        }
        for required in TargetField::REQUIRED {
            if !seen.contains(&required) {
                return Err(ImportError::mapping(format!(
                    "required target field '{}' is not mapped",
                    required.as_str()
                )));
            }
        }
        Ok(ColumnMapping { entries })
    }

    pub fn contains(&self, field: TargetField) -> bool {
        self.entries.iter().any(|(_, f)| *f == field)
    }

    pub fn fields(&self) -> impl Iterator<Item = TargetField> + '_ {
        self.entries.iter().map(|(_, f)| *f)
    }
}

/// One row after mapping application. Immutable from here on; later steps
/// only read it.
#[derive(Debug, Clone)]
pub struct Row {
    /// Index into the session's raw rows.
    pub row_index: usize,
    /// 1-based source line number.
    pub line: usize,
    pub fields: BTreeMap<TargetField, String>,
}

impl Row {
    pub fn get(&self, field: TargetField) -> &str {
        self.fields.get(&field).map(String::as_str).unwrap_or("")
    }
}

/// Applies a validated mapping to the raw rows. Rows that fail field
/// validation (or repeat an earlier row) are excluded from the returned
/// set; their problems are reported as issues.
pub fn apply(
    raw_rows: &[RawRow],
    mapping: &ColumnMapping,
    known_class_keys: &HashSet<String>,
) -> (Vec<Row>, Vec<Issue>) {
    let mut rows = Vec::with_capacity(raw_rows.len());
    let mut issues = Vec::new();
    let mut digests: HashMap<[u8; 32], usize> = HashMap::new();

    for (row_index, raw) in raw_rows.iter().enumerate() {
        let mut fields = BTreeMap::new();
        for (col, field) in &mapping.entries {
            let value = raw.cells.get(*col).map(|c| c.trim()).unwrap_or("");
            let value = match field {
                TargetField::Email => value.to_ascii_lowercase(),
                _ => value.to_string(),
            };
            fields.insert(*field, value);
        }
        let row = Row {
            row_index,
            line: raw.line,
            fields,
        };

        let mut ok = true;
        for required in TargetField::REQUIRED {
            if mapping.contains(required) && row.get(required).is_empty() {
                issues.push(Issue::field(
                    raw.line,
                    required,
                    format!("required field '{}' is empty", required.as_str()),
                ));
                ok = false;
            }
        }
        for field in [TargetField::Name, TargetField::ClassGroup] {
            let value = row.get(field);
            if !value.is_empty() && !supported_text(value) {
                issues.push(Issue::field(
                    raw.line,
                    field,
                    format!("'{value}' contains unsupported characters"),
                ));
                ok = false;
            }
        }
        let email = row.get(TargetField::Email);
        if !email.is_empty() && !email_shape_ok(email) {
            issues.push(Issue::field(
                raw.line,
                TargetField::Email,
                format!("invalid email address '{email}'"),
            ));
            ok = false;
        }
        let class_group = row.get(TargetField::ClassGroup);
        if ok && !known_class_keys.contains(&normalize(class_group)) {
            issues.push(Issue::field(
                raw.line,
                TargetField::ClassGroup,
                format!("class '{class_group}' does not exist"),
            ));
            ok = false;
        }
        if !ok {
            continue;
        }

        // Exact repeats of an earlier row are dropped, keyed on the
        // canonical mapped values so case and accents don't hide them.
        let digest = row_digest(&row);
        match digests.get(&digest) {
            Some(first_line) => {
                issues.push(Issue::line(
                    raw.line,
                    format!("duplicate of line {first_line}"),
                ));
                continue;
            }
            None => {
                digests.insert(digest, raw.line);
            }
        }

        rows.push(row);
    }

    (rows, issues)
}

fn row_digest(row: &Row) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for field in TargetField::ALL {
        hasher.update(normalize(row.get(field)).as_bytes());
        hasher.update([0x1f]);
    }
    hasher.finalize().into()
}

/// Letters (accented included), digits, and spaces only. Everything else
/// trips up the downstream systems the roster feeds.
fn supported_text(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_alphanumeric() || c.is_whitespace())
}

fn email_shape_ok(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty()
        || !local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return false;
    }
    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
    {
        return false;
    }
    let tld = labels[labels.len() - 1];
    (2..=6).contains(&tld.len()) && tld.chars().all(|c| c.is_ascii_alphabetic())
}
