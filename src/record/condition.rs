use super::{AttrValue, Fields};

/// Precondition evaluated against a record's current fields at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Exists,
    NotExists,
    FieldEquals { field: String, value: AttrValue },
    FieldAbsent(String),
    FieldPresent(String),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

/// What the store observed when a condition did not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionActual {
    Missing,
    Present,
    Field {
        field: String,
        value: Option<AttrValue>,
    },
    Unsatisfied,
}

impl Condition {
    pub fn field_equals(field: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Condition::FieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Guard for an optimistic write: every projected field still has the
    /// value it had when it was read, and fields that were absent still are.
    pub fn expect_fields(projection: &[String], original: &Fields) -> Self {
        Condition::All(
            projection
                .iter()
                .map(|field| match original.get(field) {
                    Some(value) => Condition::FieldEquals {
                        field: field.clone(),
                        value: value.clone(),
                    },
                    None => Condition::FieldAbsent(field.clone()),
                })
                .collect(),
        )
    }

    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::All(mut parts) => {
                parts.push(other);
                Condition::All(parts)
            }
            first => Condition::All(vec![first, other]),
        }
    }

    /// Returns `None` when the condition holds, otherwise the first
    /// observation that contradicted it. A missing record has no fields.
    pub fn evaluate(&self, record: Option<&Fields>) -> Option<ConditionActual> {
        match self {
            Condition::Exists => record.is_none().then_some(ConditionActual::Missing),
            Condition::NotExists => record.is_some().then_some(ConditionActual::Present),
            Condition::FieldEquals { field, value } => {
                let actual = record.and_then(|fields| fields.get(field));
                if actual == Some(value) {
                    None
                } else {
                    Some(ConditionActual::Field {
                        field: field.clone(),
                        value: actual.cloned(),
                    })
                }
            }
            Condition::FieldAbsent(field) => {
                let actual = record.and_then(|fields| fields.get(field));
                actual.map(|value| ConditionActual::Field {
                    field: field.clone(),
                    value: Some(value.clone()),
                })
            }
            Condition::FieldPresent(field) => {
                let present = record.is_some_and(|fields| fields.contains_key(field));
                (!present).then(|| ConditionActual::Field {
                    field: field.clone(),
                    value: None,
                })
            }
            Condition::All(parts) => parts.iter().find_map(|part| part.evaluate(record)),
            Condition::Any(parts) => {
                let mut last = ConditionActual::Unsatisfied;
                for part in parts {
                    match part.evaluate(record) {
                        None => return None,
                        Some(actual) => last = actual,
                    }
                }
                Some(last)
            }
            Condition::Not(inner) => match inner.evaluate(record) {
                None => Some(ConditionActual::Unsatisfied),
                Some(_) => None,
            },
        }
    }

    pub fn holds(&self, record: Option<&Fields>) -> bool {
        self.evaluate(record).is_none()
    }
}
