pub mod adapter;
pub mod cli;

pub use adapter::{CliDataStore, DataStore, NullDataStore};
pub use cli::{CliOutput, StoreCli};
