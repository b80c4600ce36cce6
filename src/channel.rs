use async_trait::async_trait;
use tracing::{error, info};

use crate::error::{FenceError, FenceResult};
use crate::models::BlockEntry;

/// One enforcement mechanism: hosts file, packet filter, or process
/// killer. `apply` and `revert` are idempotent; calling either twice in a
/// row is safe and leaves the same external state.
#[async_trait]
pub trait EnforcementChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, blocklist: &[BlockEntry], is_allowlist: bool) -> FenceResult<()>;

    async fn revert(&self) -> FenceResult<()>;

    async fn is_applied(&self) -> bool;
}

/// Borrow a boxed channel list as trait-object references, optionally
/// filtered. `apply_all`/`revert_all` operate on the borrowed form so
/// callers can apply a settings-dependent subset.
pub fn as_refs(channels: &[Box<dyn EnforcementChannel>]) -> Vec<&dyn EnforcementChannel> {
    channels.iter().map(|c| c.as_ref()).collect()
}

/// Apply channels in order. If any apply fails, every channel applied so
/// far is reverted before the error surfaces, so the observable state is
/// "no block in progress" rather than half-applied.
pub async fn apply_all(
    channels: &[&dyn EnforcementChannel],
    blocklist: &[BlockEntry],
    is_allowlist: bool,
) -> FenceResult<()> {
    for (index, channel) in channels.iter().enumerate() {
        if let Err(e) = channel.apply(blocklist, is_allowlist).await {
            error!(channel = channel.name(), error = %e, "channel apply failed, rolling back");
            for applied in channels[..index].iter().rev() {
                if let Err(revert_err) = applied.revert().await {
                    error!(channel = applied.name(), error = %revert_err, "rollback revert failed");
                }
            }
            return Err(FenceError::Enforcement(format!("{}: {e}", channel.name())));
        }
        info!(channel = channel.name(), "channel applied");
    }
    Ok(())
}

/// Revert channels in reverse apply order. Best-effort: every channel is
/// attempted, the first error is surfaced afterwards.
pub async fn revert_all(channels: &[&dyn EnforcementChannel]) -> FenceResult<()> {
    let mut first_error = None;
    for channel in channels.iter().rev() {
        match channel.revert().await {
            Ok(()) => info!(channel = channel.name(), "channel reverted"),
            Err(e) => {
                error!(channel = channel.name(), error = %e, "channel revert failed");
                if first_error.is_none() {
                    first_error = Some(FenceError::Enforcement(format!("{}: {e}", channel.name())));
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use std::sync::Arc;

    /// Records apply/revert calls into a shared log; optionally fails its
    /// apply.
    pub struct FakeChannel {
        pub name: &'static str,
        pub fail_apply: bool,
        pub applied: AtomicBool,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeChannel {
        pub fn new(name: &'static str) -> Self {
            Self::with_log(name, Arc::new(Mutex::new(Vec::new())))
        }

        pub fn with_log(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                fail_apply: false,
                applied: AtomicBool::new(false),
                log,
            }
        }

        pub fn failing(name: &'static str) -> Self {
            Self {
                fail_apply: true,
                ..Self::new(name)
            }
        }

        pub fn failing_with_log(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                fail_apply: true,
                ..Self::with_log(name, log)
            }
        }
    }

    #[async_trait]
    impl EnforcementChannel for FakeChannel {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn apply(&self, _blocklist: &[BlockEntry], _is_allowlist: bool) -> FenceResult<()> {
            self.log.lock().unwrap().push(format!("{}:apply", self.name));
            if self.fail_apply {
                return Err(FenceError::Enforcement("simulated failure".to_string()));
            }
            self.applied.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn revert(&self) -> FenceResult<()> {
            self.log.lock().unwrap().push(format!("{}:revert", self.name));
            self.applied.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn is_applied(&self) -> bool {
            self.applied.load(Ordering::SeqCst)
        }
    }
}
