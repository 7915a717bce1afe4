//! Common integration testing utilities and behavioural suites reusable across drivers.

pub mod memory;
pub mod suites;

pub use memory::{Call, FailPoint, MemoryDriver, MemoryProbe, StoredRow};
pub use suites::ConnectionFactory;

/// Schema every suite expects: a single `items` table with a generated `id` and a `name`.
pub mod migrations {
    pub const LIBSQL_ITEMS_SQL: &str =
        "CREATE TABLE IF NOT EXISTS items (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT)";
    pub const POSTGRES_ITEMS_SQL: &str =
        "CREATE TABLE IF NOT EXISTS items (id BIGSERIAL PRIMARY KEY, name TEXT)";
    pub const MEMORY_ITEMS_SQL: &str = "CREATE TABLE items (id, name)";
}
