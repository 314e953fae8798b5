pub mod postgres;
pub mod search;
pub mod upsert;

pub use postgres::PgStore;
pub use search::{IndexNames, SearchIndex};
pub use upsert::{PersistReport, UpsertCoordinator};
