use crate::error::{Result, StoreError};
use crate::record::{AttrValue, FieldUpdate, Fields};

/// Working copy of a record's declared fields for one update attempt.
///
/// Only fields named in the attempt's update keys may be written; reading an
/// undeclared field yields `None` because it was never fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    update_keys: Vec<String>,
    fields: Fields,
    existed: bool,
}

impl Draft {
    pub(crate) fn new(update_keys: &[String], original: &Fields, existed: bool) -> Self {
        Self {
            update_keys: update_keys.to_vec(),
            fields: original.clone(),
            existed,
        }
    }

    /// Whether the record existed when this attempt read it.
    pub fn existed(&self) -> bool {
        self.existed
    }

    pub fn update_keys(&self) -> &[String] {
        &self.update_keys
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&AttrValue> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(AttrValue::as_text)
    }

    pub fn number(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(AttrValue::as_number)
    }

    /// The list stored at `field`; a missing or non-list field reads as empty.
    pub fn list(&self, field: &str) -> &[AttrValue] {
        self.get(field).and_then(AttrValue::as_list).unwrap_or(&[])
    }

    pub fn set(&mut self, field: &str, value: impl Into<AttrValue>) -> Result<()> {
        self.ensure_declared(field)?;
        self.fields.insert(field.to_string(), value.into());
        Ok(())
    }

    /// Marks `field` for deletion.
    pub fn remove(&mut self, field: &str) -> Result<Option<AttrValue>> {
        self.ensure_declared(field)?;
        Ok(self.fields.remove(field))
    }

    /// Appends `value` to the list at `field` unless already present.
    /// Returns whether the list changed.
    pub fn list_push_unique(&mut self, field: &str, value: impl Into<AttrValue>) -> Result<bool> {
        self.ensure_declared(field)?;
        let value = value.into();
        let mut items = self.list(field).to_vec();
        if items.contains(&value) {
            return Ok(false);
        }
        items.push(value);
        self.fields.insert(field.to_string(), AttrValue::List(items));
        Ok(true)
    }

    /// Removes every occurrence of `value` from the list at `field`.
    /// Returns whether the list changed.
    pub fn list_remove(&mut self, field: &str, value: &AttrValue) -> Result<bool> {
        self.ensure_declared(field)?;
        let items = self.list(field);
        if !items.contains(value) {
            return Ok(false);
        }
        let kept: Vec<AttrValue> = items.iter().filter(|v| *v != value).cloned().collect();
        self.fields.insert(field.to_string(), AttrValue::List(kept));
        Ok(true)
    }

    /// Field-level difference between `original` and the draft, restricted
    /// to the declared update keys.
    pub fn diff(&self, original: &Fields) -> FieldUpdate {
        let mut update = FieldUpdate::default();
        for field in &self.update_keys {
            match (original.get(field), self.fields.get(field)) {
                (before, Some(after)) if before != Some(after) => {
                    update.set.insert(field.clone(), after.clone());
                }
                (Some(_), None) => update.remove.push(field.clone()),
                _ => {}
            }
        }
        update
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }

    fn ensure_declared(&self, field: &str) -> Result<()> {
        if self.update_keys.iter().any(|k| k == field) {
            Ok(())
        } else {
            Err(StoreError::Validation(format!(
                "field '{field}' is not among the declared update keys"
            )))
        }
    }
}
