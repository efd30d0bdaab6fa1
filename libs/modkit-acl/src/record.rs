use modkit_security::AclValue;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

/// A row of an entity type, keyed by column name.
///
/// The identifier lives among the fields under the entity's id column; a record
/// without one has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    entity_type: String,
    fields: Map<String, Value>,
}

impl Record {
    #[must_use]
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            fields: Map::new(),
        }
    }

    pub(crate) fn from_fields(entity_type: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            entity_type: entity_type.into(),
            fields,
        }
    }

    /// Build a record from any serializable model.
    ///
    /// # Errors
    /// Fails when `model` does not serialize to a JSON object.
    pub fn from_model<T: Serialize>(
        entity_type: impl Into<String>,
        model: &T,
    ) -> Result<Self, serde_json::Error> {
        let fields = match serde_json::to_value(model)? {
            Value::Object(map) => map,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "expected an object, got {other}"
                )));
            }
        };
        Ok(Self::from_fields(entity_type, fields))
    }

    /// Deserialize the fields into a model.
    ///
    /// # Errors
    /// Fails when the fields do not match `T`.
    pub fn to_model<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Field value; JSON `null` reads as absent.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|v| !v.is_null())
    }

    /// Field value as a comparable scalar.
    #[must_use]
    pub fn value_of(&self, field: &str) -> Option<AclValue> {
        self.get(field).and_then(AclValue::from_json)
    }

    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Overlay `other`'s fields onto this record.
    pub(crate) fn merge_from(&mut self, other: &Self) {
        for (k, v) in &other.fields {
            self.fields.insert(k.clone(), v.clone());
        }
    }
}
