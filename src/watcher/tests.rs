#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::config::Reconciler;
use async_trait::async_trait;
use std::os::unix::fs::symlink;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::tempdir;

struct CountingNotifier {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Notify for CountingNotifier {
    async fn notify(&self, _cancel: &CancellationToken) -> Result<(), crate::notifier::NotifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn write_follower(path: &Path, scrape_interval: &str) {
    std::fs::write(
        path,
        format!("follower:\n  scrape_interval: {scrape_interval}\n"),
    )
    .unwrap();
}

/// Lays out `dir` the way a Kubernetes `ConfigMap`/`Secret` projected
/// volume does: a versioned data directory, a `..data` symlink pointing at
/// it, and `file_name` itself symlinked through `..data`. `generation`
/// picks the versioned directory's name so repeated calls don't collide.
fn seed_projected_volume(dir: &Path, file_name: &str, generation: u32, scrape_interval: &str) {
    let data_dir = dir.join(format!("..data_{generation}"));
    std::fs::create_dir(&data_dir).unwrap();
    write_follower(&data_dir.join(file_name), scrape_interval);

    symlink(data_dir.file_name().unwrap(), dir.join("..data")).unwrap();
    symlink(format!("..data/{file_name}"), dir.join(file_name)).unwrap();
}

/// Simulates the kubelet's atomic update: write a new versioned directory,
/// then atomically rename a new `..data` symlink over the old one. The
/// watched file's own symlink (`config.yaml`) is never touched — only
/// `..data` is, which is exactly what a filename-only watch would miss.
fn atomic_data_swap(dir: &Path, file_name: &str, generation: u32, scrape_interval: &str) {
    let data_dir = dir.join(format!("..data_{generation}"));
    std::fs::create_dir(&data_dir).unwrap();
    write_follower(&data_dir.join(file_name), scrape_interval);

    let tmp_link = dir.join("..data_tmp");
    symlink(data_dir.file_name().unwrap(), &tmp_link).unwrap();
    std::fs::rename(&tmp_link, dir.join("..data")).unwrap();
}

#[tokio::test]
async fn reconciles_and_notifies_on_atomic_data_swap() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    let output_path = dir.path().join("effective.yaml");
    seed_projected_volume(dir.path(), "config.yaml", 0, "15s");

    let reconciler = Arc::new(Reconciler::new(&config_path, &output_path));
    let calls = Arc::new(AtomicUsize::new(0));
    let notifier: Arc<dyn Notify> = Arc::new(CountingNotifier {
        calls: Arc::clone(&calls),
    });

    let watcher = Watcher::new(dir.path(), "config.yaml", reconciler, notifier).unwrap();

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { watcher.run(run_cancel).await });

    // Give the backend thread time to install its OS-level subscription
    // before the swap happens.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    atomic_data_swap(dir.path(), "config.yaml", 1, "30s");

    // Poll for the effect rather than sleeping a fixed amount: watcher
    // backends vary in latency across platforms.
    let mut notified = false;
    for _ in 0..50 {
        if calls.load(Ordering::SeqCst) >= 1 {
            notified = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(notified, "expected notify to have been called after the ..data swap");

    let written = std::fs::read_to_string(&output_path).unwrap();
    assert!(written.contains("30s"));

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn repeated_identical_content_produces_no_further_pulses() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    let output_path = dir.path().join("effective.yaml");
    seed_projected_volume(dir.path(), "config.yaml", 0, "15s");

    let reconciler = Arc::new(Reconciler::new(&config_path, &output_path));
    let calls = Arc::new(AtomicUsize::new(0));
    let notifier: Arc<dyn Notify> = Arc::new(CountingNotifier {
        calls: Arc::clone(&calls),
    });

    let watcher = Watcher::new(dir.path(), "config.yaml", reconciler, notifier).unwrap();

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { watcher.run(run_cancel).await });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    // Two swaps that each carry byte-identical content: a new `..data`
    // generation is published both times, but the checksum gate should
    // suppress the second pulse.
    atomic_data_swap(dir.path(), "config.yaml", 1, "15s");
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    atomic_data_swap(dir.path(), "config.yaml", 2, "15s");
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn ignores_events_for_unrelated_files() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    let output_path = dir.path().join("effective.yaml");
    seed_projected_volume(dir.path(), "config.yaml", 0, "15s");

    let reconciler = Arc::new(Reconciler::new(&config_path, &output_path));
    let calls = Arc::new(AtomicUsize::new(0));
    let notifier: Arc<dyn Notify> = Arc::new(CountingNotifier {
        calls: Arc::clone(&calls),
    });

    let watcher = Watcher::new(dir.path(), "config.yaml", reconciler, notifier).unwrap();

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { watcher.run(run_cancel).await });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    std::fs::write(dir.path().join("unrelated.txt"), b"noise").unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
