//! Optimistic command helper
//!
//! Shared shape for every persisting operation: snapshot the prior state,
//! apply the change locally, await the store, and put the snapshot back
//! if the store says no. Local state is never left ahead of a failed
//! persistence call.

use std::future::Future;

use vhc_common::Result;

/// Await a persistence future; on failure run the revert before
/// propagating the error.
///
/// The caller applies its optimistic change *before* calling this and
/// hands over a revert that restores the snapshot it took.
pub async fn commit_or_revert<T, P, R, RFut>(persist: P, revert: R) -> Result<T>
where
    P: Future<Output = Result<T>>,
    R: FnOnce() -> RFut,
    RFut: Future<Output = ()>,
{
    match persist.await {
        Ok(value) => Ok(value),
        Err(e) => {
            revert().await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use vhc_common::Error;

    #[tokio::test]
    async fn test_success_skips_revert() {
        let reverted = Cell::new(false);
        let result = commit_or_revert(async { Ok(7) }, || async {
            reverted.set(true);
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert!(!reverted.get());
    }

    #[tokio::test]
    async fn test_failure_runs_revert_then_propagates() {
        let reverted = Cell::new(false);
        let result: Result<()> = commit_or_revert(
            async { Err(Error::Persistence("store down".into())) },
            || async {
                reverted.set(true);
            },
        )
        .await;
        assert!(result.is_err());
        assert!(reverted.get());
    }
}
