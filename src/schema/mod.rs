//! Schema evolution
//!
//! - `migrations`: ordered forward/rollback units
//! - `catalog`: indexes and triggers expected per version
//! - `migrator`: applies, rolls back and validates recorded history

mod catalog;
mod migrations;
mod migrator;

pub use catalog::{
    CATALOG, CatalogDrift, CatalogObject, ObjectKind, expected_at, objects_for_table, reconcile,
    verify,
};
pub use migrations::{MIGRATIONS, Migration, Rebuild, Step, latest_version};
pub use migrator::{MigrationState, Migrator};
