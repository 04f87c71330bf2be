pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod transaction;

pub use ledger::*;
pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;
