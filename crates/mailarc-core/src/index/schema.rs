//! Tantivy schema for archived messages

use tantivy::schema::{Field, Schema, STORED, STRING, TEXT};

/// Handles to every field of the message index
#[derive(Debug, Clone)]
pub struct MessageSchema {
    pub schema: Schema,
    /// Content address, exact match only
    pub id: Field,
    /// Artifact location, stored only
    pub path: Field,
    pub subject: Field,
    pub from: Field,
    pub to: Field,
    pub cc: Field,
    pub body: Field,
    pub attachments: Field,
    pub attachment_count: Field,
    pub size: Field,
}

impl MessageSchema {
    pub fn new() -> Self {
        let mut builder = Schema::builder();

        let id = builder.add_text_field("id", STRING | STORED);
        let path = builder.add_text_field("path", STORED);
        let subject = builder.add_text_field("subject", TEXT | STORED);
        let from = builder.add_text_field("from", TEXT | STORED);
        let to = builder.add_text_field("to", TEXT | STORED);
        let cc = builder.add_text_field("cc", TEXT | STORED);
        let body = builder.add_text_field("body", TEXT | STORED);
        let attachments = builder.add_text_field("attachments", TEXT | STORED);
        let attachment_count = builder.add_u64_field("attachment_count", STORED);
        let size = builder.add_u64_field("size", STORED);

        Self {
            schema: builder.build(),
            id,
            path,
            subject,
            from,
            to,
            cc,
            body,
            attachments,
            attachment_count,
            size,
        }
    }

    /// Fields searched by free-text queries
    pub fn default_search_fields(&self) -> Vec<Field> {
        vec![
            self.subject,
            self.from,
            self.to,
            self.cc,
            self.body,
            self.attachments,
        ]
    }
}

impl Default for MessageSchema {
    fn default() -> Self {
        Self::new()
    }
}
