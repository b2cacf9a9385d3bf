//! SQL shared by the sqlite and mysql adapters. Both drivers take `?`
//! placeholders, so only the introspection queries differ.
//!
//! Reads resolve row ids back to natural keys (category name, user email,
//! order ref) so the canonical records never leak backend-local ids.
//! `LEFT JOIN` keeps rows with dangling references visible; the adapter
//! turns their NULL key columns into row errors instead of dropping them.

pub const PING: &str = "SELECT 1";

pub const SQLITE_TABLE_EXISTS: &str =
    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?";

pub const MYSQL_TABLE_EXISTS: &str =
    "SELECT table_name FROM information_schema.tables \
     WHERE table_schema = DATABASE() AND table_name = ?";

// Full-table reads in canonical form, ordered by insertion id so
// migration output is deterministic.

pub const SELECT_ALL_CATEGORIES: &str =
    "SELECT name, created_at FROM categories ORDER BY id";

pub const SELECT_ALL_USERS: &str =
    "SELECT email, display_name, created_at FROM users ORDER BY id";

pub const SELECT_ALL_BOOKS: &str = "SELECT b.title, b.author, b.category_id, \
     c.name AS category, b.price_cents, b.created_at \
     FROM books b LEFT JOIN categories c ON c.id = b.category_id \
     ORDER BY b.id";

pub const SELECT_ALL_VIDEOS: &str = "SELECT v.title, v.category_id, \
     c.name AS category, v.duration_seconds, v.created_at \
     FROM videos v LEFT JOIN categories c ON c.id = v.category_id \
     ORDER BY v.id";

pub const SELECT_ALL_ORDERS: &str = "SELECT o.order_ref, u.email AS user_email, \
     o.total_cents, o.placed_at \
     FROM orders o LEFT JOIN users u ON u.id = o.user_id \
     ORDER BY o.id";

pub const SELECT_ALL_ORDER_ITEMS: &str = "SELECT o.order_ref, i.line_no, \
     b.title AS book_title, b.author AS book_author, \
     i.quantity, i.unit_price_cents \
     FROM order_items i \
     LEFT JOIN orders o ON o.id = i.order_id \
     LEFT JOIN books b ON b.id = i.book_id \
     ORDER BY i.id";

// Point reads by natural key, used to decide insert vs update vs skip.

pub const SELECT_CATEGORY_BY_NAME: &str =
    "SELECT name, created_at FROM categories WHERE name = ?";

pub const SELECT_USER_BY_EMAIL: &str =
    "SELECT email, display_name, created_at FROM users WHERE email = ?";

pub const SELECT_BOOK_BY_KEY: &str = "SELECT b.title, b.author, b.category_id, \
     c.name AS category, b.price_cents, b.created_at \
     FROM books b LEFT JOIN categories c ON c.id = b.category_id \
     WHERE b.title = ? AND b.author = ?";

pub const SELECT_VIDEO_BY_TITLE: &str = "SELECT v.title, v.category_id, \
     c.name AS category, v.duration_seconds, v.created_at \
     FROM videos v LEFT JOIN categories c ON c.id = v.category_id \
     WHERE v.title = ?";

pub const SELECT_ORDER_BY_REF: &str = "SELECT o.order_ref, u.email AS user_email, \
     o.total_cents, o.placed_at \
     FROM orders o LEFT JOIN users u ON u.id = o.user_id \
     WHERE o.order_ref = ?";

pub const SELECT_ORDER_ITEM_BY_KEY: &str = "SELECT o.order_ref, i.line_no, \
     b.title AS book_title, b.author AS book_author, \
     i.quantity, i.unit_price_cents \
     FROM order_items i \
     JOIN orders o ON o.id = i.order_id \
     LEFT JOIN books b ON b.id = i.book_id \
     WHERE o.order_ref = ? AND i.line_no = ?";

// Reference resolution: natural key to row id.

pub const SELECT_CATEGORY_ID: &str = "SELECT id FROM categories WHERE name = ?";
pub const SELECT_USER_ID: &str = "SELECT id FROM users WHERE email = ?";
pub const SELECT_BOOK_ID: &str = "SELECT id FROM books WHERE title = ? AND author = ?";
pub const SELECT_ORDER_ID: &str = "SELECT id FROM orders WHERE order_ref = ?";

pub const INSERT_CATEGORY: &str =
    "INSERT INTO categories (name, created_at) VALUES (?, ?)";

pub const INSERT_USER: &str =
    "INSERT INTO users (email, display_name, created_at) VALUES (?, ?, ?)";

pub const INSERT_BOOK: &str = "INSERT INTO books \
     (title, author, category_id, price_cents, created_at) \
     VALUES (?, ?, ?, ?, ?)";

pub const INSERT_VIDEO: &str = "INSERT INTO videos \
     (title, category_id, duration_seconds, created_at) \
     VALUES (?, ?, ?, ?)";

pub const INSERT_ORDER: &str = "INSERT INTO orders \
     (order_ref, user_id, total_cents, placed_at) \
     VALUES (?, ?, ?, ?)";

pub const INSERT_ORDER_ITEM: &str = "INSERT INTO order_items \
     (order_id, line_no, book_id, quantity, unit_price_cents) \
     VALUES (?, ?, ?, ?, ?)";

pub const UPDATE_CATEGORY: &str = "UPDATE categories SET created_at = ? WHERE name = ?";

pub const UPDATE_USER: &str =
    "UPDATE users SET display_name = ?, created_at = ? WHERE email = ?";

pub const UPDATE_BOOK: &str = "UPDATE books \
     SET category_id = ?, price_cents = ?, created_at = ? \
     WHERE title = ? AND author = ?";

pub const UPDATE_VIDEO: &str = "UPDATE videos \
     SET category_id = ?, duration_seconds = ?, created_at = ? \
     WHERE title = ?";

pub const UPDATE_ORDER: &str = "UPDATE orders \
     SET user_id = ?, total_cents = ?, placed_at = ? \
     WHERE order_ref = ?";

pub const UPDATE_ORDER_ITEM: &str = "UPDATE order_items \
     SET book_id = ?, quantity = ?, unit_price_cents = ? \
     WHERE order_id = ? AND line_no = ?";

/// Row count for one entity table. Table names come from
/// [`crate::store::EntityKind::table`], never from user input.
pub fn count_query(table: &str) -> String {
    format!("SELECT COUNT(*) AS n FROM {table}")
}
