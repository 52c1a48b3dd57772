use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use applock_core::infrastructure_sqlite::SqliteLockStore;
use applock_core::{AcquireOptions, AppLockExt};
use serde::Serialize;

use crate::report::{CliResponse, ForceReleaseReport, LockListReport, LockReport};

fn open_store(db: &Path) -> anyhow::Result<SqliteLockStore> {
    SqliteLockStore::open(db).with_context(|| format!("failed to open lock database at '{}'", db.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn hold(db: &Path, name: &str, timeout: i64, hold: u64, no_throw: bool) -> anyhow::Result<()> {
    let store = open_store(db)?;
    let session = store.connect().context("failed to open a lock session")?;

    let mut options = AcquireOptions::default().with_timeout(timeout);
    if no_throw {
        options = options.no_throw();
    }

    tracing::info!(lock_name = name, timeout, "⏳ Acquiring application lock");
    let mut lock = session
        .acquire_app_lock_async(name, &options)
        .await
        .with_context(|| format!("could not acquire lock '{}'", name))?;

    if !lock.is_acquired() {
        tracing::warn!(lock_name = name, result = %lock.result(), "Lock not acquired");
        lock.dispose_async().await?;
        return print_json(&CliResponse::err(
            LockReport::from_lock(&lock),
            format!("lock '{}' not acquired: {}", name, lock.result()),
        ));
    }

    tracing::info!(
        lock_name = name,
        result = %lock.result(),
        wait_ms = lock.acquisition_wait_time().as_millis() as u64,
        "🔒 Lock acquired, holding for {}s",
        hold
    );

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(hold)) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, releasing early");
        }
    }

    let released = lock.release_async().await;
    let disposed = lock.dispose_async().await;
    let report = LockReport::from_lock(&lock);

    match released.and(disposed) {
        Ok(()) => {
            tracing::info!(lock_name = name, held_ms = report.held_ms, "🔓 Lock released");
            print_json(&CliResponse::ok(report))
        }
        Err(err) => {
            tracing::error!(lock_name = name, error = %err, "Lock release failed");
            print_json(&CliResponse::err(report, err.to_string()))?;
            Err(err.into())
        }
    }
}

pub fn list(db: &Path) -> anyhow::Result<()> {
    let store = open_store(db)?;
    let locks = store.list_locks().context("failed to list locks")?;
    print_json(&CliResponse::ok(LockListReport {
        count: locks.len(),
        locks,
    }))
}

pub fn force_release(db: &Path, name: &str) -> anyhow::Result<()> {
    let store = open_store(db)?;
    let removed = store
        .force_release(name)
        .with_context(|| format!("failed to force-release lock '{}'", name))?;
    if !removed {
        tracing::warn!(lock_name = name, "No such lock");
    }
    print_json(&CliResponse::ok(ForceReleaseReport {
        name: name.to_string(),
        removed,
    }))
}
