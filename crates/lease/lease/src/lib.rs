pub mod error;
pub mod lock;
mod renewal;
pub mod store;
pub mod testing;
pub mod token;

pub use error::{GuardedError, LockError, StoreError};
pub use lock::{HeldLease, LeaseLock, LockState};
pub use store::LeaseStore;
pub use token::HolderToken;
