//! Periodic jobs (inactive-thread eviction, user-store flushes) and the
//! shutdown sequence that drains handlers and persists state.

use crate::bot::structured_log::{EventType, LogLevel, StructuredLogger};
use crate::bot::threads::ThreadRegistry;
use crate::bot::users::UserStore;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Delay before the first eviction pass after startup.
pub const FIRST_EVICTION_DELAY: Duration = Duration::from_secs(60);

pub struct Maintenance {
    pub threads: Arc<Mutex<ThreadRegistry>>,
    pub users: Arc<Mutex<UserStore>>,
    pub max_age: chrono::Duration,
    pub eviction_interval: Duration,
    pub flush_interval: Duration,
    pub logger: StructuredLogger,
}

impl Maintenance {
    /// One eviction pass. Returns the number of threads removed.
    pub async fn evict_once(&self, now: DateTime<Utc>) -> usize {
        let (evicted, remaining) = {
            let mut threads = self.threads.lock().await;
            let evicted = threads.evict_inactive(now, self.max_age);
            (evicted, threads.len())
        };

        let level = if evicted > 0 {
            LogLevel::Info
        } else {
            LogLevel::Debug
        };
        self.logger.log(
            &self
                .logger
                .event(EventType::Eviction, level)
                .with_detail(&format!("evicted {evicted} threads, {remaining} remain")),
        );
        evicted
    }

    /// Write the user store if it changed. Failures are logged and retried
    /// on the next tick.
    pub async fn flush_once(&self) -> bool {
        let result = self.users.lock().await.persist_if_dirty().await;
        match result {
            Ok(true) => {
                self.logger
                    .debug(EventType::UserStore, "known users flushed to disk");
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.logger.error(
                    EventType::UserStore,
                    &format!("failed to flush known users: {e:#}"),
                );
                false
            }
        }
    }

    /// Run both timers until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut eviction = interval_at(
            Instant::now() + FIRST_EVICTION_DELAY.min(self.eviction_interval),
            self.eviction_interval,
        );
        eviction.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flush = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = eviction.tick() => {
                    self.evict_once(Utc::now()).await;
                }
                _ = flush.tick() => {
                    self.flush_once().await;
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        self.logger
            .debug(EventType::Lifecycle, "maintenance task stopped");
    }
}

/// Give in-flight handlers `grace` to finish, then abort the rest.
/// Returns how many were aborted.
pub async fn drain_handlers<T: 'static>(
    handlers: &mut JoinSet<T>,
    grace: Duration,
    logger: &StructuredLogger,
) -> usize {
    let drained = tokio::time::timeout(grace, async {
        while handlers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_ok() {
        return 0;
    }

    let remaining = handlers.len();
    logger.warn(
        EventType::Lifecycle,
        &format!(
            "{remaining} handlers still running after {}s, aborting",
            grace.as_secs()
        ),
    );
    handlers.abort_all();
    while handlers.join_next().await.is_some() {}
    remaining
}

/// Write the thread snapshot and any unsaved user changes. Failures are
/// logged; returns whether both writes succeeded.
pub async fn persist_state(
    threads: &Mutex<ThreadRegistry>,
    users: &Mutex<UserStore>,
    history_path: &Path,
    logger: &StructuredLogger,
) -> bool {
    let mut ok = true;

    let saved = threads.lock().await.save(history_path).await;
    if let Err(e) = saved {
        logger.error(
            EventType::Thread,
            &format!("failed to save thread snapshot: {e:#}"),
        );
        ok = false;
    }

    let flushed = users.lock().await.persist_if_dirty().await;
    match flushed {
        Ok(true) => logger.debug(EventType::UserStore, "known users saved"),
        Ok(false) => {}
        Err(e) => {
            logger.error(
                EventType::UserStore,
                &format!("failed to save known users: {e:#}"),
            );
            ok = false;
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::context::HistoryBudget;
    use crate::bot::threads::{Role, ThreadKey, ThreadMessage};
    use crate::bot::users::ProfileUpdate;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn maintenance(dir: &TempDir) -> Maintenance {
        Maintenance {
            threads: Arc::new(Mutex::new(ThreadRegistry::new(HistoryBudget::new(40, 8192)))),
            users: Arc::new(Mutex::new(UserStore::new(dir.path().join("users.yaml")))),
            max_age: chrono::Duration::days(3),
            eviction_interval: Duration::from_secs(3600),
            flush_interval: Duration::from_secs(300),
            logger: StructuredLogger::disabled(),
        }
    }

    #[tokio::test]
    async fn eviction_removes_only_stale_threads() {
        let dir = TempDir::new().unwrap();
        let m = maintenance(&dir);
        let now = Utc::now();
        {
            let mut threads = m.threads.lock().await;
            threads.append(
                ThreadKey::new(1, 1),
                ThreadMessage::new(Role::User, "old", now - chrono::Duration::days(4)),
            );
            threads.append(
                ThreadKey::new(1, 2),
                ThreadMessage::new(Role::User, "fresh", now - chrono::Duration::hours(1)),
            );
        }

        assert_eq!(m.evict_once(now).await, 1);
        let threads = m.threads.lock().await;
        assert!(!threads.contains(&ThreadKey::new(1, 1)));
        assert!(threads.contains(&ThreadKey::new(1, 2)));
    }

    #[tokio::test]
    async fn flush_writes_only_when_dirty() {
        let dir = TempDir::new().unwrap();
        let m = maintenance(&dir);
        assert!(!m.flush_once().await);
        assert!(!dir.path().join("users.yaml").exists());

        m.users.lock().await.upsert(
            7,
            ProfileUpdate {
                name: Some("Bo".into()),
                description: Some("likes tea".into()),
            },
        );
        assert!(m.flush_once().await);
        assert!(dir.path().join("users.yaml").exists());
        assert!(!m.flush_once().await);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_aborts_handlers_past_the_grace_period() {
        let logger = StructuredLogger::disabled();
        let finished = Arc::new(AtomicBool::new(false));
        let mut handlers = JoinSet::new();

        let flag = finished.clone();
        handlers.spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flag.store(true, Ordering::SeqCst);
        });
        handlers.spawn(std::future::pending::<()>());

        let started = Instant::now();
        let aborted = drain_handlers(&mut handlers, Duration::from_secs(10), &logger).await;

        assert_eq!(aborted, 1);
        assert!(finished.load(Ordering::SeqCst));
        assert!(handlers.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_returns_early_when_handlers_finish() {
        let logger = StructuredLogger::disabled();
        let mut handlers = JoinSet::new();
        handlers.spawn(async { tokio::time::sleep(Duration::from_secs(2)).await });

        let started = Instant::now();
        assert_eq!(
            drain_handlers(&mut handlers, Duration::from_secs(10), &logger).await,
            0
        );
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn persist_state_writes_threads_and_users() {
        let dir = TempDir::new().unwrap();
        let m = maintenance(&dir);
        let history = dir.path().join("threads.json");
        m.threads.lock().await.append(
            ThreadKey::new(-1, 10),
            ThreadMessage::new(Role::User, "hello", Utc::now()),
        );
        m.users.lock().await.observe(42, Some("Ann"));

        assert!(persist_state(&m.threads, &m.users, &history, &m.logger).await);

        let mut restored = ThreadRegistry::new(HistoryBudget::new(40, 8192));
        let report = restored
            .load(&history, Utc::now(), chrono::Duration::days(3))
            .await
            .unwrap();
        assert_eq!(report.restored, 1);
        assert!(restored.contains(&ThreadKey::new(-1, 10)));

        let (users, _) = UserStore::load(dir.path().join("users.yaml")).await.unwrap();
        assert_eq!(users.get(42).unwrap().name.as_deref(), Some("Ann"));
        assert!(!m.users.lock().await.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let m = maintenance(&dir);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(m.run(rx));

        tokio::time::sleep(Duration::from_secs(120)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
