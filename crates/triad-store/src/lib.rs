pub mod error;
pub mod history;
pub mod ledger;

pub use error::StoreError;
pub use history::HistoryStore;
pub use ledger::{CoreEntry, CoreLedger};
