//! Schema management for document structure definition.

use std::collections::BTreeMap;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::schema::field::{FieldConfig, FieldId, FieldType};
use crate::schema::value::AttributeValue;
use crate::storage::{Storage, read_all, write_atomic};

/// Identifier of a schema snapshot. Every alter produces the next id.
pub type SchemaId = u32;

/// File holding the current schema.
pub const SCHEMA_FILE: &str = "schema.json";

/// File holding the schema snapshot with the given id.
pub fn schema_file_name(schema_id: SchemaId) -> String {
    format!("schema_{schema_id}.json")
}

/// The attribute fields of a partition at one point in time.
///
/// Field ids are dense, assigned in insertion order and never reused, so a
/// field keeps its id across alters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    schema_id: SchemaId,
    fields: Vec<FieldConfig>,
    #[serde(skip)]
    by_name: AHashMap<String, FieldId>,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.schema_id == other.schema_id && self.fields == other.fields
    }
}

impl Schema {
    /// Create a new empty schema.
    pub fn new(schema_id: SchemaId) -> Self {
        Schema {
            schema_id,
            fields: Vec::new(),
            by_name: AHashMap::new(),
        }
    }

    /// Create a builder for constructing schemas.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder {
            schema: Schema::new(0),
        }
    }

    pub fn schema_id(&self) -> SchemaId {
        self.schema_id
    }

    /// Add a field, returning its id.
    pub fn add_field(
        &mut self,
        name: impl Into<String>,
        field_type: FieldType,
        updatable: bool,
    ) -> Result<FieldId> {
        let name = name.into();
        if name.is_empty() {
            return Err(TesseraError::invalid_argument("field name cannot be empty"));
        }
        if self.by_name.contains_key(&name) {
            return Err(TesseraError::invalid_argument(format!(
                "field '{name}' already exists"
            )));
        }

        let id = self.fields.iter().map(|f| f.id + 1).max().unwrap_or(0);
        let mut config = FieldConfig::new(id, name.clone(), field_type);
        config.updatable = updatable;
        self.fields.push(config);
        self.by_name.insert(name, id);
        Ok(id)
    }

    /// Look up a field id by name.
    pub fn field_id(&self, name: &str) -> Option<FieldId> {
        self.by_name.get(name).copied()
    }

    /// Look up a field type by id.
    pub fn field_type(&self, id: FieldId) -> Option<FieldType> {
        self.field(id).map(|f| f.field_type)
    }

    pub fn field(&self, id: FieldId) -> Option<&FieldConfig> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldConfig> {
        self.field_id(name).and_then(|id| self.field(id))
    }

    /// Like [`Schema::field_by_name`] but fails with `UnknownField`.
    pub fn require_field(&self, name: &str) -> Result<&FieldConfig> {
        self.field_by_name(name)
            .ok_or_else(|| TesseraError::unknown_field(name.to_string()))
    }

    pub fn fields(&self) -> &[FieldConfig] {
        &self.fields
    }

    /// Fields that accept patches, in field id order.
    pub fn updatable_fields(&self) -> Vec<&FieldConfig> {
        let mut fields: Vec<_> = self.fields.iter().filter(|f| f.updatable).collect();
        fields.sort_by_key(|f| f.id);
        fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Derive the next schema snapshot with `name` retyped to `new_type`.
    pub fn alter_field(&self, name: &str, new_type: FieldType) -> Result<Schema> {
        let id = self
            .field_id(name)
            .ok_or_else(|| TesseraError::unknown_field(name.to_string()))?;
        let mut next = self.clone();
        next.schema_id = self.schema_id + 1;
        for field in next.fields.iter_mut().filter(|f| f.id == id) {
            field.field_type = new_type;
        }
        Ok(next)
    }

    /// Derive the next schema snapshot with an extra field.
    pub fn with_added_field(&self, name: &str, field_type: FieldType) -> Result<Schema> {
        let mut next = self.clone();
        next.schema_id = self.schema_id + 1;
        next.add_field(name, field_type, true)?;
        Ok(next)
    }

    fn rebuild_index(&mut self) -> Result<()> {
        self.by_name.clear();
        for field in &self.fields {
            if self.by_name.insert(field.name.clone(), field.id).is_some() {
                return Err(TesseraError::corrupt(format!(
                    "duplicate field '{}' in schema {}",
                    field.name, self.schema_id
                )));
            }
        }
        Ok(())
    }

    /// Parse a schema from JSON.
    pub fn from_json(text: &str) -> Result<Schema> {
        let mut schema: Schema = serde_json::from_str(text)?;
        schema.rebuild_index()?;
        Ok(schema)
    }

    /// Load the schema stored at `path`.
    pub fn load(storage: &dyn Storage, path: &str) -> Result<Schema> {
        let bytes = read_all(storage, path)?;
        let text = String::from_utf8(bytes)
            .map_err(|e| TesseraError::corrupt(format!("{path} is not UTF-8: {e}")))?;
        Self::from_json(&text)
    }

    /// Load the snapshot with id `schema_id`.
    pub fn load_by_id(storage: &dyn Storage, schema_id: SchemaId) -> Result<Schema> {
        let name = schema_file_name(schema_id);
        if storage.file_exists(&name) {
            return Self::load(storage, &name);
        }
        let current = Self::load(storage, SCHEMA_FILE)?;
        if current.schema_id == schema_id {
            Ok(current)
        } else {
            Err(TesseraError::not_found(name))
        }
    }

    /// Persist as both the id-specific snapshot and the current schema.
    pub fn store(&self, storage: &dyn Storage) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(storage, &schema_file_name(self.schema_id), &json)?;
        write_atomic(storage, SCHEMA_FILE, &json)
    }
}

/// A builder for constructing schemas in a fluent manner.
#[derive(Debug)]
pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    /// Set the id of the schema being built.
    pub fn schema_id(mut self, schema_id: SchemaId) -> Self {
        self.schema.schema_id = schema_id;
        self
    }

    /// Add an updatable field.
    pub fn add_field(mut self, name: &str, field_type: FieldType) -> Result<Self> {
        self.schema.add_field(name, field_type, true)?;
        Ok(self)
    }

    /// Add a field that rejects updates.
    pub fn add_fixed_field(mut self, name: &str, field_type: FieldType) -> Result<Self> {
        self.schema.add_field(name, field_type, false)?;
        Ok(self)
    }

    pub fn build(self) -> Schema {
        self.schema
    }
}

/// A document to add to a partition: field name to value, absent or `None`
/// meaning null.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Document {
    fields: BTreeMap<String, Option<AttributeValue>>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Document::default()
    }

    /// Set a field value (builder style).
    pub fn with(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.fields.insert(name.to_string(), Some(value.into()));
        self
    }

    /// Set a field value.
    pub fn set(&mut self, name: &str, value: Option<AttributeValue>) {
        self.fields.insert(name.to_string(), value);
    }

    /// Get a field value; `None` when absent or null.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.fields.get(name).and_then(|v| v.as_ref())
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check that every field exists in `schema` and every value converts
    /// to its field type.
    pub fn validate_against_schema(&self, schema: &Schema) -> Result<()> {
        for (name, value) in &self.fields {
            let field = schema.require_field(name)?;
            if let Some(value) = value {
                value.convert_to(field.field_type)?;
            }
        }
        Ok(())
    }
}
