#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use tokio_util::sync::CancellationToken;

    use crate::error::{AppLockError, TransportError};
    use crate::infrastructure::AppLockBackend;
    use crate::infrastructure_in_memory::InMemoryLockServer;
    use crate::orchestrator::{AcquireOptions, AppLockExt};
    use crate::types::{AcquisitionResult, LockScope, ReleaseResult};

    const LOCK: &str = "nightly-settlement";

    #[test]
    fn test_uncontended_acquire_and_release() {
        let server = InMemoryLockServer::new();
        let session = server.connect();

        let mut lock = session.acquire_app_lock(LOCK, &AcquireOptions::default()).unwrap();
        assert!(lock.is_acquired());
        assert_eq!(lock.result(), AcquisitionResult::AcquiredImmediately);
        assert!(server.is_locked(LOCK));

        lock.release().unwrap();
        assert!(!server.is_locked(LOCK));

        // Releasing again through the handle does not hit the server, which
        // would otherwise answer -999 for a lock no longer held.
        lock.release().unwrap();
        lock.dispose().unwrap();
    }

    #[test]
    fn test_contention_timeout_and_wait() {
        let server = InMemoryLockServer::new();
        let holder = server.connect();
        let mut held = holder.acquire_app_lock(LOCK, &AcquireOptions::default()).unwrap();
        assert!(held.is_acquired());

        let short = {
            let session = server.connect();
            thread::spawn(move || {
                let started = Instant::now();
                let lock = session
                    .acquire_app_lock(LOCK, &AcquireOptions::default().with_timeout(1).no_throw())
                    .unwrap();
                (lock.result(), started.elapsed())
            })
        };
        let long = {
            let session = server.connect();
            thread::spawn(move || {
                let lock = session
                    .acquire_app_lock(LOCK, &AcquireOptions::default().with_timeout(10).no_throw())
                    .unwrap();
                (lock.result(), lock.acquisition_wait_time())
            })
        };

        let hold_for = Duration::from_millis(2500);
        thread::sleep(hold_for);
        held.release().unwrap();

        let (short_result, short_elapsed) = short.join().unwrap();
        assert_eq!(short_result, AcquisitionResult::FailedDueToTimeout);
        assert!(short_elapsed >= Duration::from_secs(1));
        assert!(short_elapsed < hold_for);

        let (long_result, long_wait) = long.join().unwrap();
        assert_eq!(long_result, AcquisitionResult::AcquiredAfterWaiting);
        assert!(long_wait >= Duration::from_millis(2000));
        assert!(long_wait < Duration::from_secs(10));
    }

    #[test]
    fn test_waiters_are_granted_in_arrival_order() {
        let server = InMemoryLockServer::new();
        let holder = server.connect();
        let mut held = holder.acquire_app_lock(LOCK, &AcquireOptions::default()).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let mut workers = Vec::new();
        for i in 0..3 {
            let session = server.connect();
            let tx = tx.clone();
            workers.push(thread::spawn(move || {
                let mut lock = session
                    .acquire_app_lock(LOCK, &AcquireOptions::default().with_timeout(10))
                    .unwrap();
                tx.send(i).unwrap();
                thread::sleep(Duration::from_millis(20));
                lock.release().unwrap();
            }));
            // Stagger arrivals so the queue order is known.
            thread::sleep(Duration::from_millis(100));
        }

        held.release().unwrap();
        for worker in workers {
            worker.join().unwrap();
        }
        let order: Vec<i32> = rx.try_iter().collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_reentrant_acquire_needs_matching_releases() {
        let server = InMemoryLockServer::new();
        let session = server.connect();

        let mut outer = session.acquire_app_lock(LOCK, &AcquireOptions::default()).unwrap();
        let mut inner = session.acquire_app_lock(LOCK, &AcquireOptions::default()).unwrap();
        assert_eq!(inner.result(), AcquisitionResult::AcquiredImmediately);

        inner.dispose().unwrap();
        assert!(server.is_locked(LOCK));
        outer.dispose().unwrap();
        assert!(!server.is_locked(LOCK));
    }

    #[test]
    fn test_same_session_other_owner_reports_deadlock() {
        let server = InMemoryLockServer::new();
        let session = server.connect();
        let _held = session.acquire_app_lock(LOCK, &AcquireOptions::default()).unwrap();

        let transaction = session.begin_transaction().unwrap();
        let lock = transaction
            .acquire_app_lock(LOCK, &AcquireOptions::default().with_timeout(5).no_throw())
            .unwrap();
        assert_eq!(lock.result(), AcquisitionResult::FailedDueToDeadlock);
    }

    #[test]
    fn test_transaction_lock_released_by_commit() {
        let server = InMemoryLockServer::new();
        let session = server.connect();
        let transaction = session.begin_transaction().unwrap();

        let mut lock = transaction.acquire_app_lock(LOCK, &AcquireOptions::default()).unwrap();
        assert_eq!(lock.scope(), LockScope::Transaction);

        // Disposing the handle leaves the server-side lock to the transaction.
        lock.dispose().unwrap();
        assert!(server.is_locked(LOCK));

        transaction.commit();
        assert!(!server.is_locked(LOCK));
        assert!(!transaction.is_active());

        let after = transaction.acquire_app_lock(LOCK, &AcquireOptions::default());
        assert!(matches!(
            after,
            Err(AppLockError::AcquisitionFailed {
                source: Some(TransportError::NoActiveTransaction),
                ..
            })
        ));
    }

    #[test]
    fn test_dropped_transaction_rolls_back_its_locks() {
        let server = InMemoryLockServer::new();
        let session = server.connect();
        {
            let transaction = session.begin_transaction().unwrap();
            let _lock = transaction.acquire_app_lock(LOCK, &AcquireOptions::default()).unwrap();
            assert!(server.is_locked(LOCK));
        }
        assert!(!server.is_locked(LOCK));
    }

    #[test]
    fn test_closing_session_drops_its_locks() {
        let server = InMemoryLockServer::new();
        let session = server.connect();
        let mut lock = session.acquire_app_lock(LOCK, &AcquireOptions::default()).unwrap();

        session.close();
        assert!(!server.is_locked(LOCK));

        // The connection is gone, so the release round trip fails and says so.
        let err = lock.dispose().unwrap_err();
        assert!(matches!(
            err,
            AppLockError::ReleaseFailed {
                result: ReleaseResult::ParameterValidationOrOtherError,
                source: Some(TransportError::ConnectionClosed),
            }
        ));
        assert!(lock.is_disposed());
    }

    #[test]
    fn test_dropping_last_session_clone_drops_locks() {
        let server = InMemoryLockServer::new();
        {
            let session = server.connect();
            let reply = session.execute_acquire(LOCK, LockScope::Session, 1, None).unwrap();
            assert_eq!(reply.code, AcquisitionResult::AcquiredImmediately.code());
            assert_eq!(server.held_lock_count(), 1);
        }
        assert_eq!(server.held_lock_count(), 0);
    }

    #[test]
    fn test_release_of_unheld_lock_is_rejected_by_server() {
        let server = InMemoryLockServer::new();
        let session = server.connect();
        let code = session.execute_release(LOCK, LockScope::Session).unwrap();
        assert_eq!(code, ReleaseResult::ParameterValidationOrOtherError.code());
    }

    #[test]
    fn test_session_cannot_acquire_transaction_scope() {
        let server = InMemoryLockServer::new();
        let session = server.connect();
        let err = crate::orchestrator::acquire(&session, LOCK, LockScope::Transaction, &AcquireOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            AppLockError::AcquisitionFailed {
                result: AcquisitionResult::ValidationOrOtherError,
                ..
            }
        ));
    }

    #[test]
    fn test_command_timeout_surfaces_as_transport_error() {
        let server = InMemoryLockServer::new();
        let holder = server.connect();
        let _held = holder.acquire_app_lock(LOCK, &AcquireOptions::default()).unwrap();

        let session = server.connect();
        let options = AcquireOptions::default()
            .with_timeout(5)
            .with_command_timeout(Duration::from_millis(200));
        let err = session.acquire_app_lock(LOCK, &options).unwrap_err();
        assert!(matches!(
            err,
            AppLockError::AcquisitionFailed {
                source: Some(TransportError::CommandTimeout(_)),
                ..
            }
        ));

        let lock = session.acquire_app_lock(LOCK, &options.clone().no_throw()).unwrap();
        assert_eq!(lock.result(), AcquisitionResult::ValidationOrOtherError);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_waiter_acquires_after_release() {
        let server = InMemoryLockServer::new();
        let holder = server.connect();
        let mut held = holder
            .acquire_app_lock_async(LOCK, &AcquireOptions::default())
            .await
            .unwrap();

        let session = server.connect();
        let waiter = tokio::spawn(async move {
            let mut lock = session
                .acquire_app_lock_async(LOCK, &AcquireOptions::default().with_timeout(5))
                .await
                .unwrap();
            let outcome = (lock.result(), lock.acquisition_wait_time());
            lock.dispose_async().await.unwrap();
            outcome
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        held.release_async().await.unwrap();

        let (result, wait) = waiter.await.unwrap();
        assert_eq!(result, AcquisitionResult::AcquiredAfterWaiting);
        assert!(wait >= Duration::from_millis(250));
        assert!(!server.is_locked(LOCK));
    }

    #[tokio::test]
    async fn test_async_timeout() {
        let server = InMemoryLockServer::new();
        let holder = server.connect();
        let _held = holder.acquire_app_lock_async(LOCK, &AcquireOptions::default()).await.unwrap();

        let session = server.connect();
        let err = session
            .acquire_app_lock_async(LOCK, &AcquireOptions::default().with_timeout(1))
            .await
            .unwrap_err();
        assert_eq!(err.acquisition_result(), Some(AcquisitionResult::FailedDueToTimeout));
    }

    #[tokio::test]
    async fn test_cancellation_mid_wait_yields_cancelled_handle() {
        let server = InMemoryLockServer::new();
        let holder = server.connect();
        let _held = holder.acquire_app_lock_async(LOCK, &AcquireOptions::default()).await.unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let session = server.connect();
        let options = AcquireOptions::default()
            .with_timeout(10)
            .no_throw()
            .with_cancellation(token);
        let started = Instant::now();
        let mut lock = session.acquire_app_lock_async(LOCK, &options).await.unwrap();

        assert_eq!(lock.result(), AcquisitionResult::AcquisitionCancelled);
        assert!(!lock.is_acquired());
        assert!(started.elapsed() < Duration::from_secs(5));
        lock.dispose_async().await.unwrap();
        assert!(lock.is_disposed());
    }

    #[tokio::test]
    async fn test_abandoned_async_waiter_leaves_queue() {
        let server = InMemoryLockServer::new();
        let holder = server.connect();
        let mut held = holder.acquire_app_lock_async(LOCK, &AcquireOptions::default()).await.unwrap();

        let abandoned = server.connect();
        let attempt = tokio::time::timeout(
            Duration::from_millis(100),
            abandoned.acquire_app_lock_async(LOCK, &AcquireOptions::default().with_timeout(10)),
        )
        .await;
        assert!(attempt.is_err());

        held.release_async().await.unwrap();

        // The dropped waiter no longer stands first in line.
        let session = server.connect();
        let lock = session.acquire_app_lock_async(LOCK, &AcquireOptions::default()).await.unwrap();
        assert_eq!(lock.result(), AcquisitionResult::AcquiredImmediately);
    }

    #[test]
    fn test_session_closed_while_queued_is_not_granted() {
        let server = InMemoryLockServer::new();
        let holder = server.connect();
        let mut held = holder.acquire_app_lock(LOCK, &AcquireOptions::default()).unwrap();

        let waiter = server.connect();
        let closer = waiter.clone();
        let pending = thread::spawn(move || {
            let started = Instant::now();
            let outcome = waiter
                .acquire_app_lock(LOCK, &AcquireOptions::default().with_timeout(10))
                .map(|lock| lock.result());
            (outcome, started.elapsed())
        });

        thread::sleep(Duration::from_millis(200));
        closer.close();
        held.release().unwrap();

        let (outcome, elapsed) = pending.join().unwrap();
        assert!(matches!(
            outcome,
            Err(AppLockError::AcquisitionFailed {
                result: AcquisitionResult::ValidationOrOtherError,
                source: Some(TransportError::ConnectionClosed),
            })
        ));
        assert!(elapsed < Duration::from_secs(5));
        assert!(!server.is_locked(LOCK));
        assert_eq!(server.held_lock_count(), 0);
    }

    #[test]
    fn test_transaction_committed_while_queued_is_not_granted() {
        let server = InMemoryLockServer::new();
        let holder = server.connect();
        let mut held = holder.acquire_app_lock(LOCK, &AcquireOptions::default()).unwrap();

        let session = server.connect();
        let transaction = session.begin_transaction().unwrap();
        let pending = {
            let transaction = transaction.clone();
            thread::spawn(move || {
                transaction
                    .acquire_app_lock(LOCK, &AcquireOptions::default().with_timeout(10).no_throw())
                    .map(|lock| lock.result())
            })
        };

        thread::sleep(Duration::from_millis(200));
        transaction.commit();
        held.release().unwrap();

        // No-throw mode still reports the transport failure as -999.
        let result = pending.join().unwrap().unwrap();
        assert_eq!(result, AcquisitionResult::ValidationOrOtherError);
        assert!(!server.is_locked(LOCK));

        drop(transaction);
        assert_eq!(server.held_lock_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_waiter_of_closed_session_is_not_granted() {
        let server = InMemoryLockServer::new();
        let holder = server.connect();
        let mut held = holder.acquire_app_lock_async(LOCK, &AcquireOptions::default()).await.unwrap();

        let waiter = server.connect();
        let closer = waiter.clone();
        let pending = tokio::spawn(async move {
            waiter
                .acquire_app_lock_async(LOCK, &AcquireOptions::default().with_timeout(10))
                .await
                .map(|lock| lock.result())
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        closer.close();
        held.release_async().await.unwrap();

        let outcome = pending.await.unwrap();
        assert!(matches!(
            outcome,
            Err(AppLockError::AcquisitionFailed {
                source: Some(TransportError::ConnectionClosed),
                ..
            })
        ));
        assert!(!server.is_locked(LOCK));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_waiter_of_rolled_back_transaction_is_not_granted() {
        let server = InMemoryLockServer::new();
        let holder = server.connect();
        let _held = holder.acquire_app_lock_async(LOCK, &AcquireOptions::default()).await.unwrap();

        let session = server.connect();
        let transaction = session.begin_transaction().unwrap();
        let pending = {
            let transaction = transaction.clone();
            tokio::spawn(async move {
                transaction
                    .acquire_app_lock_async(LOCK, &AcquireOptions::default().with_timeout(10))
                    .await
                    .map(|lock| lock.result())
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        transaction.rollback();

        // The rollback wakes the waiter before the holder lets go.
        let outcome = pending.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            outcome,
            Err(AppLockError::AcquisitionFailed {
                source: Some(TransportError::NoActiveTransaction),
                ..
            })
        ));
        assert_eq!(server.held_lock_count(), 1);
    }
}
