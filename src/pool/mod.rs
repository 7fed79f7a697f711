mod manager;
mod transaction;

pub use manager::PoolManager;
pub use transaction::PgTransaction;
