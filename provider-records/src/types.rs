//! Record API wire types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Field name to value map of a record.
pub type Fields = serde_json::Map<String, Value>;

/// Identifies one table inside one base.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRef {
    pub base_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(base_id: impl Into<String>, table_id: impl Into<String>) -> Self {
        Self {
            base_id: base_id.into(),
            table_id: table_id.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.base_id.trim().is_empty() && !self.table_id.trim().is_empty()
    }

    /// `/v0/{base}/{table}` with both segments percent-encoded.
    pub fn path(&self) -> String {
        format!(
            "/v0/{}/{}",
            urlencoding::encode(&self.base_id),
            urlencoding::encode(&self.table_id)
        )
    }

    pub fn record_path(&self, record_id: &str) -> String {
        format!("{}/{}", self.path(), urlencoding::encode(record_id))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base_id, self.table_id)
    }
}

/// A row of a remote table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub fields: Fields,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: Fields, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            fields,
            created_at,
            updated_at: None,
            version: None,
        }
    }

    /// Shallow-merge `patch` into the record's fields.
    pub fn merge_fields(&mut self, patch: &Fields) {
        for (name, value) in patch {
            self.fields.insert(name.clone(), value.clone());
        }
    }

    /// Whether `other` describes a strictly older state of the same record.
    ///
    /// Compares `version` when both sides carry one, `updated_at` otherwise.
    /// Returns false when neither carries ordering information.
    pub fn is_newer_than(&self, other: &Record) -> bool {
        if let (Some(mine), Some(theirs)) = (self.version, other.version) {
            return mine > theirs;
        }
        match (self.updated_at, other.updated_at) {
            (Some(mine), Some(theirs)) => mine > theirs,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Parameters of a list request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    /// Server-side filter expression
    pub filter_formula: Option<String>,
    pub sort: Vec<SortSpec>,
    /// Field projection; empty returns every field
    pub fields: Vec<String>,
    pub page_size: Option<u32>,
    /// Continuation token from a previous page
    pub offset: Option<String>,
    pub max_records: Option<u32>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, formula: impl Into<String>) -> Self {
        self.filter_formula = Some(formula.into());
        self
    }

    pub fn sort_by(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(name.into());
        self
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn offset(mut self, offset: impl Into<String>) -> Self {
        self.offset = Some(offset.into());
        self
    }

    pub fn max_records(mut self, max: u32) -> Self {
        self.max_records = Some(max);
        self
    }

    /// Encode as URL query parameters, without the leading `?`.
    pub fn to_query_string(&self) -> String {
        let mut params: Vec<String> = Vec::new();

        if let Some(formula) = &self.filter_formula {
            params.push(format!("filterByFormula={}", urlencoding::encode(formula)));
        }
        for (index, sort) in self.sort.iter().enumerate() {
            params.push(format!(
                "{}={}",
                urlencoding::encode(&format!("sort[{}][field]", index)),
                urlencoding::encode(&sort.field)
            ));
            params.push(format!(
                "{}={}",
                urlencoding::encode(&format!("sort[{}][direction]", index)),
                sort.direction.as_str()
            ));
        }
        for field in &self.fields {
            params.push(format!(
                "{}={}",
                urlencoding::encode("fields[]"),
                urlencoding::encode(field)
            ));
        }
        if let Some(size) = self.page_size {
            params.push(format!("pageSize={}", size));
        }
        if let Some(offset) = &self.offset {
            params.push(format!("offset={}", urlencoding::encode(offset)));
        }
        if let Some(max) = self.max_records {
            params.push(format!("maxRecords={}", max));
        }

        params.join("&")
    }
}

/// One page of a list response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPage {
    pub records: Vec<Record>,
    /// Continuation token; `None` on the last page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct FieldsBody<'a> {
    pub fields: &'a Fields,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeleteResponse {
    #[allow(dead_code)]
    pub id: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct EvaluateBody<'a> {
    pub formula: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EvaluateResponse {
    pub result: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_deserialize_minimal() {
        let record: Record = serde_json::from_value(json!({
            "id": "rec1",
            "fields": {"Name": "A"},
            "createdAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(record.id, "rec1");
        assert_eq!(record.fields["Name"], json!("A"));
        assert!(record.version.is_none());
    }

    #[test]
    fn test_is_newer_than_prefers_version() {
        let created = Utc::now();
        let mut older = Record::new("rec1", Fields::new(), created);
        older.version = Some(3);
        older.updated_at = Some(created + chrono::Duration::seconds(10));

        let mut newer = older.clone();
        newer.version = Some(4);
        newer.updated_at = Some(created);

        assert!(newer.is_newer_than(&older));
        assert!(!older.is_newer_than(&newer));
    }

    #[test]
    fn test_is_newer_than_without_ordering_info() {
        let a = Record::new("rec1", Fields::new(), Utc::now());
        assert!(!a.is_newer_than(&a.clone()));
    }

    #[test]
    fn test_query_string() {
        let query = ListQuery::new()
            .filter("{Status} = 'Done'")
            .sort_by(SortSpec::desc("Priority"))
            .field("Name")
            .page_size(50)
            .offset("itr/abc");

        let encoded = query.to_query_string();
        assert!(encoded.contains("filterByFormula=%7BStatus%7D%20%3D%20%27Done%27"));
        assert!(encoded.contains("sort%5B0%5D%5Bfield%5D=Priority"));
        assert!(encoded.contains("sort%5B0%5D%5Bdirection%5D=desc"));
        assert!(encoded.contains("fields%5B%5D=Name"));
        assert!(encoded.contains("pageSize=50"));
        assert!(encoded.contains("offset=itr%2Fabc"));
    }

    #[test]
    fn test_table_paths_are_encoded() {
        let table = TableRef::new("app1", "Tasks & Bugs");
        assert_eq!(table.path(), "/v0/app1/Tasks%20%26%20Bugs");
        assert_eq!(table.record_path("rec/1"), "/v0/app1/Tasks%20%26%20Bugs/rec%2F1");
    }
}
