pub mod adapter;
pub mod command;
pub mod hash;
pub mod memory;
pub mod remote;
pub mod resp;
pub mod sorted;
pub mod store;

pub use adapter::{Page, StorageAdapter, build_adapter};
pub use command::{Command, Reply, ZAddCondition};
pub use hash::HashAdapter;
pub use memory::MemoryStore;
pub use remote::RespStore;
pub use sorted::SortedSetAdapter;
pub use store::{SharedStore, connect};
