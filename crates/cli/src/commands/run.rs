use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use leasehold::{LeaseLock, LeaseStore, LockError};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::LeaseConfig;

/// Exit code when the lease is held by someone else (`EX_TEMPFAIL`).
pub const EXIT_UNAVAILABLE: i32 = 75;
/// Exit code when the lease was lost while the command ran (`EX_SOFTWARE`).
pub const EXIT_LOST: i32 = 70;
/// Exit code when the store could not be reached (`EX_UNAVAILABLE`).
pub const EXIT_STORE: i32 = 69;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Lock key naming the protected resource.
    #[arg(long)]
    pub key: String,
    /// Lease duration in milliseconds (overrides the config file).
    #[arg(long)]
    pub lease_ms: Option<u64>,
    /// Holder identity embedded in the token (overrides the config file).
    #[arg(long, env = "LEASEHOLD_HOLDER")]
    pub holder: Option<String>,
    /// Kill the command as soon as the lease is lost.
    #[arg(long)]
    pub kill_on_loss: bool,
    /// Program and arguments to run while holding the lease.
    #[arg(required = true, last = true)]
    pub command: Vec<String>,
}

pub async fn run(
    store: Arc<dyn LeaseStore>,
    defaults: &LeaseConfig,
    args: &RunArgs,
) -> anyhow::Result<i32> {
    let lease = args
        .lease_ms
        .map_or_else(|| defaults.duration(), Duration::from_millis);
    let mut lock = LeaseLock::new(store, args.key.clone(), lease)?;
    if let Some(holder) = args.holder.as_ref().or(defaults.holder.as_ref()) {
        lock = lock.with_holder(holder.clone());
    }

    let Some((program, program_args)) = args.command.split_first() else {
        anyhow::bail!("no command given");
    };

    let held = match lock.acquire().await {
        Ok(held) => held,
        Err(LockError::Unavailable(key)) => {
            eprintln!("Lease {key} is held by another owner.");
            return Ok(EXIT_UNAVAILABLE);
        }
        Err(LockError::Store(e)) => {
            eprintln!("Lease store unavailable: {e}");
            return Ok(EXIT_STORE);
        }
        Err(e) => return Err(e.into()),
    };
    info!(
        key = %held.key(),
        token = %held.token(),
        program = %program,
        "running command under lease"
    );

    let mut child = match Command::new(program)
        .args(program_args)
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            if let Err(release_err) = held.release().await {
                warn!(error = %release_err, "failed to release lease after spawn failure");
            }
            return Err(anyhow::Error::new(e).context(format!("failed to start {program}")));
        }
    };

    let status = if args.kill_on_loss {
        tokio::select! {
            status = child.wait() => Some(status?),
            () = held.lost() => {
                warn!(key = %held.key(), "lease lost, killing command");
                child.kill().await?;
                None
            }
        }
    } else {
        Some(child.wait().await?)
    };

    match held.release().await {
        Ok(()) => {}
        Err(LockError::Lost(key)) => {
            eprintln!(
                "Lease {key} was lost while the command ran; exclusivity was not guaranteed."
            );
            return Ok(EXIT_LOST);
        }
        Err(e) => warn!(error = %e, "failed to release lease"),
    }

    Ok(status.and_then(|s| s.code()).unwrap_or(1))
}
