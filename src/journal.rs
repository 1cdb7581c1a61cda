//! Replay log for orchestrations.
//!
//! Each orchestration step is keyed by `(run_id, step_key)`. The first time a
//! step runs its output is serialized into the `steps` table; on any later
//! visit, typically after a restart, the recorded output is returned and the
//! step body is not executed again. Timers record their due instant so a
//! resumed run only waits for what is left.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::db::{self, Pool};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("checkpoint log unavailable: {0:#}")]
    Store(#[from] anyhow::Error),
    #[error("checkpoint for step '{step}' is unreadable: {source}")]
    Codec {
        step: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Journal {
    pool: Pool,
}

impl Journal {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn replayed<T: DeserializeOwned>(
        &self,
        run_id: &str,
        step: &str,
    ) -> Result<Option<T>, JournalError> {
        match db::load_step(&self.pool, run_id, step).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| JournalError::Codec {
                    step: step.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    pub async fn record<T: Serialize>(
        &self,
        run_id: &str,
        step: &str,
        value: &T,
    ) -> Result<(), JournalError> {
        let raw = serde_json::to_string(value).map_err(|source| JournalError::Codec {
            step: step.to_string(),
            source,
        })?;
        db::record_step(&self.pool, run_id, step, &raw).await?;
        Ok(())
    }

    /// Run `body` once for this step; later visits return the recorded output.
    pub async fn step<T, F, Fut>(&self, run_id: &str, step: &str, body: F) -> Result<T, JournalError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(value) = self.replayed(run_id, step).await? {
            debug!(run_id, step, "replayed step");
            return Ok(value);
        }
        let value = body().await;
        self.record(run_id, step, &value).await?;
        Ok(value)
    }

    /// Like [`Journal::step`], but only a successful output is recorded; an
    /// error leaves the step open so a later visit runs it again.
    pub async fn try_step<T, E, F, Fut>(&self, run_id: &str, step: &str, body: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<JournalError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.replayed(run_id, step).await? {
            debug!(run_id, step, "replayed step");
            return Ok(value);
        }
        let value = body().await?;
        self.record(run_id, step, &value).await?;
        Ok(value)
    }

    /// Durable timer.
    pub async fn sleep(&self, run_id: &str, step: &str, delay: Duration) -> Result<(), JournalError> {
        let due: DateTime<Utc> = self
            .step(run_id, step, || async move {
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
            })
            .await?;
        let remaining = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !remaining.is_zero() {
            debug!(run_id, step, ?remaining, "waiting on timer");
            tokio::time::sleep(remaining).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn journal() -> Journal {
        Journal::new(db::memory_pool().await.unwrap())
    }

    #[tokio::test]
    async fn step_body_runs_once() {
        let journal = journal().await;
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: u32 = journal
                .step("run", "count", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    7
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_try_step_is_not_recorded() {
        let journal = journal().await;
        let first: Result<u32, JournalError> = journal
            .try_step("run", "flaky", || async {
                Err(JournalError::Store(anyhow::anyhow!("down")))
            })
            .await;
        assert!(first.is_err());

        let second: Result<u32, JournalError> =
            journal.try_step("run", "flaky", || async { Ok(3) }).await;
        assert_eq!(second.unwrap(), 3);
        assert_eq!(journal.replayed::<u32>("run", "flaky").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn steps_are_scoped_by_run() {
        let journal = journal().await;
        journal.record("a", "k", &1u8).await.unwrap();
        assert_eq!(journal.replayed::<u8>("a", "k").await.unwrap(), Some(1));
        assert_eq!(journal.replayed::<u8>("b", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_timer_does_not_wait_again() {
        let journal = journal().await;
        let past = Utc::now() - chrono::Duration::seconds(30);
        journal.record("run", "pace:0", &past).await.unwrap();

        let started = std::time::Instant::now();
        journal
            .sleep("run", "pace:0", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
