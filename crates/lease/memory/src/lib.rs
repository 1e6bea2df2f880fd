mod store;

pub use store::MemoryLeaseStore;
