use tantivy::schema::{Field, Schema, STORED, STRING, TEXT};

pub const FIELD_ID: &str = "id";
pub const FIELD_NAME: &str = "name";
pub const FIELD_TITLE: &str = "title";
pub const FIELD_BODY: &str = "body";
pub const FIELD_META: &str = "meta";

/// Index layout: `id` is an exact, stored key (the only way to address a
/// document for deletion); everything else is tokenized and not stored.
#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub schema: Schema,
    pub id: Field,
    pub name: Field,
    pub title: Field,
    pub body: Field,
    pub meta: Field,
}

impl IndexSchema {
    pub fn build() -> Self {
        let mut builder = Schema::builder();
        let id = builder.add_text_field(FIELD_ID, STRING | STORED);
        let name = builder.add_text_field(FIELD_NAME, TEXT);
        let title = builder.add_text_field(FIELD_TITLE, TEXT);
        let body = builder.add_text_field(FIELD_BODY, TEXT);
        let meta = builder.add_text_field(FIELD_META, TEXT);
        Self {
            schema: builder.build(),
            id,
            name,
            title,
            body,
            meta,
        }
    }

    /// Fields a free-text query searches.
    pub fn default_fields(&self) -> Vec<Field> {
        vec![self.name, self.title, self.body, self.meta]
    }
}

impl Default for IndexSchema {
    fn default() -> Self {
        Self::build()
    }
}
