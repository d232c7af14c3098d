//! Transactional executor.
//!
//! Runs a unit of work inside a store transaction and replays it, with
//! exponential backoff, while the store reports a transient conflict.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};

use super::{Store, Writer};
use crate::error::{Result, ServerError, StoreContext};

/// Backoff applied between transaction attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Replays allowed after the first attempt.
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
    }
}

/// A replayable unit of work.
///
/// `run` may be called once per attempt, each time against a fresh writer.
#[async_trait]
pub trait Work: Send + Sync {
    type Output: Send;

    async fn run(&self, writer: &mut dyn Writer) -> Result<Self::Output>;
}

#[derive(Clone)]
pub struct TxExecutor {
    store: Arc<dyn Store>,
    policy: RetryPolicy,
}

impl TxExecutor {
    pub fn new(store: Arc<dyn Store>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Run `work` until it commits, fails permanently, or the retry budget
    /// is spent. Exhaustion surfaces the last error.
    pub async fn do_tx<W: Work>(
        &self,
        op: &'static str,
        work: &W,
    ) -> Result<W::Output> {
        let store = &self.store;

        (move || async move {
            let mut writer = store.begin().await.context(op, "begin")?;

            match work.run(writer.as_mut()).await {
                Ok(output) => {
                    writer.commit().await.context(op, "commit")?;
                    Ok(output)
                },
                Err(err) => {
                    if let Err(rollback) = writer.rollback().await {
                        tracing::warn!(%op, error = %rollback, "rollback failed");
                    }
                    Err(err)
                },
            }
        })
        .retry(self.policy.backoff())
        .when(ServerError::is_retryable)
        .notify(|err: &ServerError, after: Duration| {
            metrics::counter!("store_transaction_retries_total", "op" => op)
                .increment(1);
            tracing::warn!(%op, error = %err, ?after, "retrying transaction");
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::account::{AccountKind, PasswordAccount};
    use crate::database::memory::MemoryStore;

    struct Insert {
        account: PasswordAccount,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Work for Insert {
        type Output = ();

        async fn run(&self, writer: &mut dyn Writer) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            writer
                .create(&self.account.clone().into_account())
                .await
                .context("test.insert", &self.account.base.public_id)?;
            Ok(())
        }
    }

    fn insert(public_id: &str) -> Insert {
        let mut account = PasswordAccount::new("ampw_1", public_id);
        account.base.public_id = public_id.to_owned();
        Insert {
            account,
            attempts: AtomicUsize::new(0),
        }
    }

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_conflicts_are_replayed() {
        let store = MemoryStore::default();
        store.fail_next_commits(2);
        let executor = TxExecutor::new(Arc::new(store.clone()), fast_policy(3));

        let work = insert("apw_0000000001");
        executor.do_tx("test", &work).await.unwrap();

        assert_eq!(work.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_conflict() {
        let store = MemoryStore::default();
        store.fail_next_commits(10);
        let executor = TxExecutor::new(Arc::new(store.clone()), fast_policy(2));

        let work = insert("apw_0000000001");
        let err = executor.do_tx("test", &work).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(work.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_replayed() {
        let store = MemoryStore::default();
        let executor = TxExecutor::new(Arc::new(store.clone()), fast_policy(3));

        executor.do_tx("test", &insert("apw_0000000001")).await.unwrap();

        let duplicate = insert("apw_0000000001");
        let err = executor.do_tx("test", &duplicate).await.unwrap_err();

        assert_eq!(err.unique_constraint(), Some("auth_password_account_pkey"));
        assert_eq!(duplicate.attempts.load(Ordering::SeqCst), 1);
    }
}
