//! Catalog entries and schema versions produced by discovery.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            description: None,
        }
    }
}

/// One version of a source's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub id: String,
    pub source_id: String,
    pub version: u32,
    pub fields: Vec<Field>,
    pub timestamp: DateTime<Utc>,
}

impl Schema {
    pub fn new(source_id: impl Into<String>, version: u32, fields: Vec<Field>) -> Self {
        let source_id = source_id.into();
        Self {
            id: format!("{source_id}-v{version}"),
            source_id,
            version,
            fields,
            timestamp: Utc::now(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    TypeChanged,
    /// Nullability changed.
    Modified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub source_id: String,
    pub change_type: ChangeKind,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Compare two versions of a schema.
///
/// Order is deterministic: additions in new-schema order, removals in
/// old-schema order, then type and nullability changes in old-schema order.
pub fn detect_schema_changes(old: &Schema, new: &Schema) -> Vec<SchemaChange> {
    let now = Utc::now();
    let old_fields: HashMap<&str, &Field> = old.fields.iter().map(|f| (f.name.as_str(), f)).collect();
    let new_fields: HashMap<&str, &Field> = new.fields.iter().map(|f| (f.name.as_str(), f)).collect();

    let change = |kind, name: &str, old_value: Option<String>, new_value: Option<String>| SchemaChange {
        source_id: new.source_id.clone(),
        change_type: kind,
        field_name: name.to_string(),
        old_value,
        new_value,
        detected_at: now,
    };

    let mut changes = Vec::new();

    for field in &new.fields {
        if !old_fields.contains_key(field.name.as_str()) {
            changes.push(change(ChangeKind::Added, &field.name, None, Some(field.data_type.clone())));
        }
    }

    for field in &old.fields {
        if !new_fields.contains_key(field.name.as_str()) {
            changes.push(change(ChangeKind::Removed, &field.name, Some(field.data_type.clone()), None));
        }
    }

    for old_field in &old.fields {
        let Some(new_field) = new_fields.get(old_field.name.as_str()) else {
            continue;
        };
        if old_field.data_type != new_field.data_type {
            changes.push(change(
                ChangeKind::TypeChanged,
                &old_field.name,
                Some(old_field.data_type.clone()),
                Some(new_field.data_type.clone()),
            ));
        }
        if old_field.nullable != new_field.nullable {
            changes.push(change(
                ChangeKind::Modified,
                &old_field.name,
                Some(format!("nullable={}", old_field.nullable)),
                Some(format!("nullable={}", new_field.nullable)),
            ));
        }
    }

    changes
}

/// Catalog record for a discovered source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub source_id: String,
    pub name: String,
    pub schema: Schema,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogEntry {
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        let now = Utc::now();
        Self {
            source_id: schema.source_id.clone(),
            name: name.into(),
            schema,
            row_count: None,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Filter for `MetadataStore::query_catalog`. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogQuery {
    pub source_id: Option<String>,
    pub name_contains: Option<String>,
    /// Only entries whose schema has a field with this name.
    pub field: Option<String>,
}

impl CatalogQuery {
    pub fn by_source(source_id: impl Into<String>) -> Self {
        Self {
            source_id: Some(source_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &CatalogEntry) -> bool {
        if let Some(source_id) = &self.source_id {
            if &entry.source_id != source_id {
                return false;
            }
        }
        if let Some(needle) = &self.name_contains {
            if !entry.name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(field) = &self.field {
            if entry.schema.field(field).is_none() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_v1() -> Schema {
        Schema::new(
            "pg-users",
            1,
            vec![
                Field::new("id", "integer", false),
                Field::new("email", "varchar", false),
                Field::new("age", "integer", true),
            ],
        )
    }

    #[test]
    fn test_identical_schemas_have_no_changes() {
        assert!(detect_schema_changes(&users_v1(), &users_v1()).is_empty());
    }

    #[test]
    fn test_detects_every_change_kind_in_order() {
        let v2 = Schema::new(
            "pg-users",
            2,
            vec![
                Field::new("id", "bigint", false),
                Field::new("email", "varchar", true),
                Field::new("created_at", "timestamp", false),
            ],
        );

        let changes = detect_schema_changes(&users_v1(), &v2);
        let summary: Vec<(ChangeKind, &str)> = changes
            .iter()
            .map(|c| (c.change_type, c.field_name.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ChangeKind::Added, "created_at"),
                (ChangeKind::Removed, "age"),
                (ChangeKind::TypeChanged, "id"),
                (ChangeKind::Modified, "email"),
            ]
        );
        assert_eq!(changes[2].old_value.as_deref(), Some("integer"));
        assert_eq!(changes[2].new_value.as_deref(), Some("bigint"));
    }

    #[test]
    fn test_catalog_query_filters() {
        let entry = CatalogEntry::new("Users table", users_v1());
        assert!(CatalogQuery::default().matches(&entry));
        assert!(CatalogQuery::by_source("pg-users").matches(&entry));
        assert!(!CatalogQuery::by_source("s3-logs").matches(&entry));

        let by_name = CatalogQuery {
            name_contains: Some("users".into()),
            ..CatalogQuery::default()
        };
        assert!(by_name.matches(&entry));

        let by_field = CatalogQuery {
            field: Some("missing".into()),
            ..CatalogQuery::default()
        };
        assert!(!by_field.matches(&entry));
    }
}
