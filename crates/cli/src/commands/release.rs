use std::sync::Arc;

use clap::Args;
use leasehold::{HolderToken, LeaseStore};

#[derive(Args, Debug)]
pub struct ReleaseArgs {
    /// Lock key naming the protected resource.
    #[arg(long)]
    pub key: String,
    /// Holder token printed by the process that acquired the lease.
    #[arg(long)]
    pub token: String,
}

/// Release a lease on behalf of a holder that can no longer do it, e.g. a
/// crashed process whose token is known from its logs. Only deletes the key
/// if it still holds exactly that token.
pub async fn run(store: Arc<dyn LeaseStore>, args: &ReleaseArgs) -> anyhow::Result<i32> {
    let token = HolderToken::from_raw(args.token.clone());
    if store.compare_and_delete(&args.key, token.as_str()).await? {
        println!("Released lease {} held by {token}.", args.key);
        Ok(0)
    } else {
        eprintln!(
            "Lease {} is not held by {token}; it expired or belongs to another holder.",
            args.key
        );
        Ok(1)
    }
}
