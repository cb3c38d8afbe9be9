//! PostgreSQL backing for the hakobi engine: the store implementation and
//! the streaming export source.

pub use sqlx::PgPool;

pub mod source;
pub mod store;

pub use source::{PgExportSource, SourceSetupError};
pub use store::PgStore;
