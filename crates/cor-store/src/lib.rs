pub mod repository;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use repository::{LockRepository, RequestRepository, ResponseTarget, StoreTableConfig};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRequestStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresRequestStore;
