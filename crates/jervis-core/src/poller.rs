use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::warn;

/// Hooks a polling handler (C5) supplies to the generic sweep loop. `A` is
/// the account/target type (a `Connection`, a Git target, …) the handler
/// enumerates and polls.
#[async_trait]
pub trait PollHandler<A>: Send + Sync
where
    A: Send + Sync,
{
    async fn accounts(&self) -> Result<Vec<A>>;
    async fn last_poll(&self, account: &A) -> Result<Option<DateTime<Utc>>>;
    async fn execute_poll(&self, account: &A) -> Result<()>;
    async fn record_poll(&self, account: &A, at: DateTime<Utc>) -> Result<()>;
    fn label(&self, account: &A) -> String;
}

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub polling_interval_ms: u64,
    pub initial_delay_ms: u64,
    pub cycle_delay_ms: u64,
}

/// Runs the generic sweep loop for one handler until `cancel` is notified.
/// Cancellation is only observed between sweeps / during sleeps — never
/// mid-poll — so an in-flight `execute_poll` always runs to completion.
pub async fn run_poller<A, H>(handler: Arc<H>, config: PollerConfig, cancel: Arc<Notify>)
where
    A: Send + Sync,
    H: PollHandler<A> + ?Sized,
{
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(config.initial_delay_ms)) => {}
        _ = cancel.notified() => return,
    }

    loop {
        let accounts = match handler.accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(error = %e, "poller failed to enumerate accounts");
                Vec::new()
            }
        };

        for account in &accounts {
            let last = match handler.last_poll(account).await {
                Ok(last) => last,
                Err(e) => {
                    warn!(account = %handler.label(account), error = %e, "poller failed to read last_poll");
                    continue;
                }
            };

            let due = match last {
                None => true,
                Some(t) => {
                    let elapsed = Utc::now().signed_duration_since(t);
                    elapsed >= chrono::Duration::milliseconds(config.polling_interval_ms as i64)
                }
            };
            if !due {
                continue;
            }

            // Per-account failures never abort the sweep (§4.1): logged and
            // counted, lastPoll is not advanced.
            match handler.execute_poll(account).await {
                Ok(()) => {
                    let now = Utc::now();
                    if let Err(e) = handler.record_poll(account, now).await {
                        warn!(account = %handler.label(account), error = %e, "poller failed to record_poll after success");
                    }
                }
                Err(e) => {
                    warn!(account = %handler.label(account), error = %e, "poll cycle failed");
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(config.cycle_delay_ms)) => {}
            _ = cancel.notified() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::{self, Instant};

    struct CountingHandler {
        accounts: Vec<&'static str>,
        polled: AtomicU32,
        last_polls: Mutex<std::collections::HashMap<&'static str, DateTime<Utc>>>,
        fail_next: AtomicU32,
    }

    #[async_trait]
    impl PollHandler<&'static str> for CountingHandler {
        async fn accounts(&self) -> Result<Vec<&'static str>> {
            Ok(self.accounts.clone())
        }
        async fn last_poll(&self, account: &&'static str) -> Result<Option<DateTime<Utc>>> {
            Ok(self.last_polls.lock().unwrap().get(account).copied())
        }
        async fn execute_poll(&self, _account: &&'static str) -> Result<()> {
            if self.fail_next.swap(0, Ordering::SeqCst) == 1 {
                anyhow::bail!("simulated failure");
            }
            self.polled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn record_poll(&self, account: &&'static str, at: DateTime<Utc>) -> Result<()> {
            self.last_polls.lock().unwrap().insert(account, at);
            Ok(())
        }
        fn label(&self, account: &&'static str) -> String {
            account.to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_until_cancelled_and_respects_interval() {
        let handler = Arc::new(CountingHandler {
            accounts: vec!["acct-1"],
            polled: AtomicU32::new(0),
            last_polls: Mutex::new(std::collections::HashMap::new()),
            fail_next: AtomicU32::new(0),
        });
        let cancel = Arc::new(Notify::new());
        let config = PollerConfig {
            polling_interval_ms: 1_000,
            initial_delay_ms: 0,
            cycle_delay_ms: 100,
        };

        let cancel_clone = cancel.clone();
        let handler_clone = handler.clone();
        let task = tokio::spawn(async move { run_poller(handler_clone, config, cancel_clone).await });

        time::advance(Duration::from_millis(50)).await;
        assert_eq!(handler.polled.load(Ordering::SeqCst), 1);

        // Within the interval: no second poll yet.
        time::advance(Duration::from_millis(200)).await;
        assert_eq!(handler.polled.load(Ordering::SeqCst), 1);

        // Past the interval: polls again.
        time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(handler.polled.load(Ordering::SeqCst), 2);

        cancel.notify_waiters();
        time::advance(Duration::from_millis(200)).await;
        let _ = time::timeout(Duration::from_millis(500), task).await;
    }

    #[tokio::test]
    async fn per_account_failure_does_not_advance_last_poll() {
        let handler = Arc::new(CountingHandler {
            accounts: vec!["acct-1"],
            polled: AtomicU32::new(0),
            last_polls: Mutex::new(std::collections::HashMap::new()),
            fail_next: AtomicU32::new(1),
        });
        let cancel = Arc::new(Notify::new());
        let config = PollerConfig {
            polling_interval_ms: 1_000,
            initial_delay_ms: 0,
            cycle_delay_ms: 10_000,
        };

        let cancel_clone = cancel.clone();
        let handler_clone = handler.clone();
        let task = tokio::spawn(async move { run_poller(handler_clone, config, cancel_clone).await });

        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.polled.load(Ordering::SeqCst), 0);
        assert!(handler.last_polls.lock().unwrap().is_empty());

        cancel.notify_waiters();
        let _ = time::timeout(Duration::from_millis(500), task).await;
        let _ = Instant::now();
    }
}
