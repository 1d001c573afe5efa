//! Stream schemas: ordered, uniquely named attributes.

use indexmap::IndexSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("a schema must declare at least one attribute")]
    Empty,

    #[error("duplicate attribute {0:?} in schema")]
    DuplicateField(String),

    #[error("attribute {0:?} is not part of the schema")]
    UnknownField(String),
}

/// The ordered attribute names of one stream. Fixed at declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: IndexSet<String>,
}

impl Schema {
    pub fn new<I, S>(fields: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = IndexSet::new();
        for field in fields {
            let field = field.into();
            if set.contains(&field) {
                return Err(SchemaError::DuplicateField(field));
            }
            set.insert(field);
        }

        if set.is_empty() {
            return Err(SchemaError::Empty);
        }

        Ok(Self { fields: set })
    }

    /// The number of attributes, and therefore the arity of every record.
    pub fn width(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> + '_ {
        self.fields.iter().map(String::as_str)
    }

    pub fn index_of(&self, field: &str) -> Option<usize> {
        self.fields.get_index_of(field)
    }

    /// Resolve a list of attribute names to their positions in this schema.
    pub fn indices_of<S: AsRef<str>>(&self, fields: &[S]) -> Result<Vec<usize>, SchemaError> {
        fields
            .iter()
            .map(|f| {
                let f = f.as_ref();
                self.index_of(f)
                    .ok_or_else(|| SchemaError::UnknownField(f.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_positions() {
        let schema = Schema::new(["user", "page", "ts"]).unwrap();
        assert_eq!(schema.width(), 3);
        assert_eq!(schema.index_of("page"), Some(1));
        assert_eq!(schema.indices_of(&["ts", "user"]).unwrap(), vec![2, 0]);
        assert_eq!(schema.fields().collect::<Vec<_>>(), vec!["user", "page", "ts"]);
    }

    #[test]
    fn schema_rejects_bad_declarations() {
        assert!(matches!(
            Schema::new(Vec::<String>::new()),
            Err(SchemaError::Empty)
        ));
        assert!(matches!(
            Schema::new(["a", "a"]),
            Err(SchemaError::DuplicateField(f)) if f == "a"
        ));

        let schema = Schema::new(["a"]).unwrap();
        assert!(matches!(
            schema.indices_of(&["b"]),
            Err(SchemaError::UnknownField(f)) if f == "b"
        ));
    }
}
