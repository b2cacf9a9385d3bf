use std::fmt;

use serde::{Deserialize, Serialize};

/// The six migratable entity collections, in dependency order.
/// Parents come before the rows that reference them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Categories,
    Users,
    Books,
    Videos,
    Orders,
    OrderItems,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Categories,
        EntityKind::Users,
        EntityKind::Books,
        EntityKind::Videos,
        EntityKind::Orders,
        EntityKind::OrderItems,
    ];

    /// Table (or collection) name shared by every backend.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Categories => "categories",
            EntityKind::Users => "users",
            EntityKind::Books => "books",
            EntityKind::Videos => "videos",
            EntityKind::Orders => "orders",
            EntityKind::OrderItems => "order_items",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Portable rows. Cross-backend references are expressed through natural
/// keys, never through backend-local row ids: a book points at its
/// category by name, an order at its user by email. Each adapter resolves
/// these to whatever its own storage uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub name: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub email: String,
    pub display_name: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRecord {
    pub title: String,
    pub author: String,
    pub category: Option<String>,
    pub price_cents: i64,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub title: String,
    pub category: Option<String>,
    pub duration_seconds: i64,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_ref: String,
    pub user_email: String,
    pub total_cents: i64,
    pub placed_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItemRecord {
    pub order_ref: String,
    pub line_no: i64,
    pub book_title: String,
    pub book_author: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityRecord {
    Category(CategoryRecord),
    User(UserRecord),
    Book(BookRecord),
    Video(VideoRecord),
    Order(OrderRecord),
    OrderItem(OrderItemRecord),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRecord::Category(_) => EntityKind::Categories,
            EntityRecord::User(_) => EntityKind::Users,
            EntityRecord::Book(_) => EntityKind::Books,
            EntityRecord::Video(_) => EntityKind::Videos,
            EntityRecord::Order(_) => EntityKind::Orders,
            EntityRecord::OrderItem(_) => EntityKind::OrderItems,
        }
    }

    /// Natural-key components as (field, value) pairs, in a fixed order.
    pub fn key_fields(&self) -> Vec<(&'static str, String)> {
        match self {
            EntityRecord::Category(c) => vec![("name", c.name.clone())],
            EntityRecord::User(u) => vec![("email", u.email.clone())],
            EntityRecord::Book(b) => vec![
                ("title", b.title.clone()),
                ("author", b.author.clone()),
            ],
            EntityRecord::Video(v) => vec![("title", v.title.clone())],
            EntityRecord::Order(o) => vec![("order_ref", o.order_ref.clone())],
            EntityRecord::OrderItem(i) => vec![
                ("order_ref", i.order_ref.clone()),
                ("line_no", i.line_no.to_string()),
            ],
        }
    }

    /// Human-readable key, used in logs and row error messages.
    pub fn key_display(&self) -> String {
        self.key_fields()
            .iter()
            .map(|(field, value)| format!("{field}={value}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ENTITY_TABLES;

    #[test]
    fn kind_order_matches_schema_tables() {
        let names: Vec<&str> = EntityKind::ALL.iter().map(|k| k.table()).collect();
        assert_eq!(names, ENTITY_TABLES.to_vec());
    }

    #[test]
    fn composite_keys_render_in_field_order() {
        let record = EntityRecord::Book(BookRecord {
            title: "Dune".into(),
            author: "Frank Herbert".into(),
            category: Some("Sci-Fi".into()),
            price_cents: 1299,
            created_at_ms: 0,
        });
        assert_eq!(record.kind(), EntityKind::Books);
        assert_eq!(record.key_display(), "title=Dune, author=Frank Herbert");
    }

    #[test]
    fn order_item_key_includes_line_number() {
        let record = EntityRecord::OrderItem(OrderItemRecord {
            order_ref: "ORD-1001".into(),
            line_no: 2,
            book_title: "Dune".into(),
            book_author: "Frank Herbert".into(),
            quantity: 1,
            unit_price_cents: 1299,
        });
        assert_eq!(record.key_display(), "order_ref=ORD-1001, line_no=2");
    }

    #[test]
    fn entity_kind_serializes_as_table_name() {
        let json = serde_json::to_string(&EntityKind::OrderItems).unwrap();
        assert_eq!(json, "\"order_items\"");
    }
}
