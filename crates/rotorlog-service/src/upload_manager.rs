// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Owns the queue of uploadable bag segments and the bounded pool of upload workers.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    io,
    path::Path,
    sync::{Arc, Mutex},
};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    bag::BagMetadata,
    diagnostics::DiagnosticsHandle,
    uploader::{CompressionMode, Uploader},
};

/// Matches paths of previously recorded segments, relative to the destination directory.
static EXISTING_BAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/.+\.db3(\.gz|\.xz)?$").expect("pattern is valid"));

/// Priority queue over bag segments.
///
/// Segments from the current run take precedence over backlog, most recent first, so that
/// current mission data keeps flowing even while a backlog drains. Backlog uploads oldest
/// first.
#[derive(Debug, Default)]
struct BagQueue {
    heap: BinaryHeap<QueuedBag>,
}

impl BagQueue {
    fn push(&mut self, bag: BagMetadata) {
        self.heap.push(QueuedBag(bag));
    }

    fn pop(&mut self) -> Option<BagMetadata> {
        let bag = self.heap.pop()?.0;
        // Bound steady-state memory: a long backlog drain would otherwise pin the high-water
        // allocation for the rest of the run.
        if self.heap.len() < self.heap.capacity() / 3 {
            self.heap.shrink_to_fit();
        }
        Some(bag)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

/// Wrapper defining the upload order; the maximum element is uploaded next.
#[derive(Debug)]
struct QueuedBag(BagMetadata);

impl Ord for QueuedBag {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.is_new, other.0.is_new) {
            // Fresh segments: higher numbers first.
            (true, true) => self.0.number.cmp(&other.0.number),
            // Backlog: lower numbers first.
            (false, false) => other.0.number.cmp(&self.0.number),
            // Fresh segments beat backlog.
            (is_new, other_is_new) => is_new.cmp(&other_is_new),
        }
    }
}

impl PartialOrd for QueuedBag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedBag {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for QueuedBag {}

/// State shared by the manager handle and its workers; everything mutable sits behind one lock.
#[derive(Debug)]
struct State {
    queue: BagQueue,
    permits: Arc<Semaphore>,
    uploader: Arc<dyn Uploader>,
    max_upload_count: usize,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Cancels in-flight HTTP transfers. Deliberately not the per-run token: a configuration
    /// change must not abort uploads that are already running.
    shutdown: CancellationToken,
    diagnostics: DiagnosticsHandle,
}

/// Dispatches bag segments to a bounded pool of upload workers.
#[derive(Debug, Clone)]
pub struct UploadManager {
    inner: Arc<Inner>,
}

impl UploadManager {
    /// Creates a manager allowing up to `max_upload_count` concurrent uploads.
    pub fn new(
        uploader: Arc<dyn Uploader>,
        max_upload_count: usize,
        diagnostics: DiagnosticsHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: BagQueue::default(),
                    permits: Arc::new(Semaphore::new(max_upload_count)),
                    uploader,
                    max_upload_count,
                }),
                workers: Mutex::new(Vec::new()),
                shutdown,
                diagnostics,
            }),
        }
    }

    /// Scans `dir` recursively for segments left behind by previous runs and queues them as
    /// backlog. Returns the number of admitted segments.
    pub fn load_existing(&self, dir: &Path) -> usize {
        let mut state = self.inner.state.lock().expect("lock is not poisoned");
        let mut admitted = 0;
        for entry in walkdir::WalkDir::new(dir) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    tracing::error!(%error, "error while loading existing bags");
                    continue;
                }
            };
            let Ok(relative) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let relative = format!("/{}", relative.display());
            if !EXISTING_BAG_PATTERN.is_match(&relative) {
                continue;
            }
            if let Some(bag) = BagMetadata::from_path(entry.path(), 0, false) {
                state.queue.push(bag);
                admitted += 1;
            }
        }
        admitted
    }

    /// Replaces the concurrency bound and compression mode.
    ///
    /// The semaphore is swapped wholesale: workers that already hold a permit keep it (and
    /// release it to the discarded semaphore, which is harmless), while new acquisitions are
    /// gated by the new bound.
    pub fn set_config(&self, max_upload_count: usize, mode: CompressionMode) {
        let mut state = self.inner.state.lock().expect("lock is not poisoned");
        state.permits = Arc::new(Semaphore::new(max_upload_count));
        state.max_upload_count = max_upload_count;
        state.uploader = state.uploader.with_compression(mode);
    }

    /// Queues a freshly finalized segment and spawns one worker to service the queue.
    pub fn add_bag(&self, bag: BagMetadata, run_token: &CancellationToken) {
        {
            let mut state = self.inner.state.lock().expect("lock is not poisoned");
            state.queue.push(bag);
        }
        self.spawn_worker(run_token);
    }

    /// Spawns workers up to the concurrency bound; used at startup so a backlog drains in
    /// parallel.
    pub fn start_all_workers(&self, run_token: &CancellationToken) {
        let worker_count = {
            let state = self.inner.state.lock().expect("lock is not poisoned");
            state.max_upload_count
        };
        for _ in 0..worker_count {
            self.spawn_worker(run_token);
        }
    }

    /// Spawns a single worker unless the current run is already cancelled.
    pub fn spawn_worker(&self, run_token: &CancellationToken) {
        if run_token.is_cancelled() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { Inner::upload_next_bag(inner).await });
        let mut workers = self.inner.workers.lock().expect("lock is not poisoned");
        workers.retain(|worker| !worker.is_finished());
        workers.push(handle);
    }

    /// Blocks until every spawned worker has finished; used on shutdown.
    pub async fn wait(&self) {
        loop {
            let pending: Vec<_> = {
                let mut workers = self.inner.workers.lock().expect("lock is not poisoned");
                workers.drain(..).collect()
            };
            if pending.is_empty() {
                return;
            }
            for worker in pending {
                if let Err(error) = worker.await {
                    if error.is_panic() {
                        tracing::error!(%error, "upload worker panicked");
                    }
                }
            }
        }
    }

    /// Number of segments currently queued.
    pub fn queued(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("lock is not poisoned")
            .queue
            .len()
    }
}

impl Inner {
    /// Worker loop: on every pass, claim a permit without blocking, pop the next segment,
    /// upload it, and clean up on success. Exits as soon as the pool is saturated or the queue
    /// is empty; the permit is released at the end of every pass, including on panics.
    async fn upload_next_bag(inner: Arc<Inner>) {
        loop {
            let (bag, uploader, _permit) = {
                let mut state = inner.state.lock().expect("lock is not poisoned");
                let Ok(permit) = Arc::clone(&state.permits).try_acquire_owned() else {
                    return;
                };
                let Some(bag) = state.queue.pop() else {
                    return;
                };
                (bag, Arc::clone(&state.uploader), permit)
            };

            tracing::info!(path = %bag.path.display(), "bag is ready for upload");
            let result = tokio::select! {
                result = uploader.upload(&bag) => result,
                _ = inner.shutdown.cancelled() => Err(crate::uploader::UploadError::Cancelled),
            };
            match result {
                Ok(()) => {
                    tracing::info!(path = %bag.path.display(), "bag uploaded successfully");
                    inner.diagnostics.report_success("bag uploader", "ok");
                    remove_bag_files(&bag);
                }
                Err(error) if error.is_empty_bag() => {
                    tracing::info!(path = %bag.path.display(), "bag is empty, discarding it");
                    remove_bag_files(&bag);
                }
                Err(error) if error.is_cancelled() => {
                    tracing::debug!(path = %bag.path.display(), "upload cancelled by shutdown");
                    return;
                }
                Err(error) => {
                    tracing::error!(path = %bag.path.display(), %error, "failed to upload bag");
                    inner
                        .diagnostics
                        .report_error("bag uploader", format!("failing: {error}"));
                }
            }
        }
    }
}

/// Removes the uploaded segment along with its sidecars.
///
/// Sibling files sharing the segment's path prefix cover the sqlite `-wal`/`-shm` journals; the
/// writer's `metadata.yaml` and the per-run directory are removed once the last segment is
/// gone.
fn remove_bag_files(bag: &BagMetadata) {
    let Some(parent) = bag.path.parent() else {
        return;
    };
    let Some(file_name) = bag.path.file_name().and_then(|name| name.to_str()) else {
        return;
    };

    match std::fs::read_dir(parent) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if !name.starts_with(file_name) {
                    continue;
                }
                if let Err(error) = std::fs::remove_file(entry.path()) {
                    tracing::error!(path = %entry.path().display(), %error, "failed to remove file");
                }
            }
        }
        Err(error) => {
            tracing::error!(path = %bag.path.display(), %error, "failed to remove files");
            return;
        }
    }

    let metadata_file = parent.join("metadata.yaml");
    if let Err(error) = std::fs::remove_file(&metadata_file) {
        if error.kind() != io::ErrorKind::NotFound {
            tracing::error!(path = %metadata_file.display(), %error, "failed to remove file");
        }
    }
    if let Err(error) = std::fs::remove_dir(parent) {
        if !matches!(
            error.kind(),
            io::ErrorKind::DirectoryNotEmpty | io::ErrorKind::AlreadyExists
        ) {
            tracing::error!(path = %parent.display(), %error, "failed to remove directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::atomic::{AtomicUsize, Ordering as AtomicOrdering},
        time::Duration,
    };

    use async_trait::async_trait;
    use rand::{rngs::StdRng, Rng as _, SeedableRng as _};
    use rotorlog_test_utils::{wait_until, Result as TestResult};

    use super::*;
    use crate::uploader::UploadError;

    fn bag(number: u64, is_new: bool) -> BagMetadata {
        BagMetadata {
            path: PathBuf::from(format!("/tmp/uploads/run/bag_{number}.db3")),
            number,
            is_new,
        }
    }

    #[test]
    fn queue_orders_fresh_before_backlog() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut queue = BagQueue::default();
        for number in 0..100u64 {
            queue.push(bag(number, rng.gen_ratio(1, 3)));
        }

        let mut popped = Vec::new();
        while let Some(bag) = queue.pop() {
            popped.push(bag);
        }
        assert_eq!(popped.len(), 100);

        let backlog_start = popped
            .iter()
            .position(|bag| !bag.is_new)
            .expect("some bags are backlog");
        let (fresh, backlog) = popped.split_at(backlog_start);
        assert!(fresh.iter().all(|bag| bag.is_new));
        assert!(backlog.iter().all(|bag| !bag.is_new));
        assert!(fresh.windows(2).all(|pair| pair[0].number > pair[1].number));
        assert!(backlog
            .windows(2)
            .all(|pair| pair[0].number < pair[1].number));
    }

    #[test]
    fn queue_shrinks_after_draining() {
        let mut queue = BagQueue::default();
        for number in 0..1024u64 {
            queue.push(bag(number, false));
        }
        let initial_capacity = queue.heap.capacity();
        for _ in 0..1000 {
            queue.pop();
        }
        assert!(queue.heap.capacity() < initial_capacity);
    }

    /// Uploader that records the concurrency watermark and sleeps to keep workers busy.
    #[derive(Debug, Default)]
    struct InstrumentedUploader {
        running: AtomicUsize,
        peak: AtomicUsize,
        uploaded: Mutex<Vec<BagMetadata>>,
        fail_with_empty: bool,
    }

    #[async_trait]
    impl Uploader for Arc<InstrumentedUploader> {
        async fn upload(&self, bag: &BagMetadata) -> Result<(), UploadError> {
            let running = self.running.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.peak.fetch_max(running, AtomicOrdering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, AtomicOrdering::SeqCst);
            self.uploaded
                .lock()
                .expect("lock is not poisoned")
                .push(bag.clone());
            if self.fail_with_empty {
                Err(UploadError::EmptyBag)
            } else {
                Ok(())
            }
        }

        fn with_compression(&self, _mode: CompressionMode) -> Arc<dyn Uploader> {
            Arc::new(Arc::clone(self))
        }
    }

    fn manager_with(
        uploader: Arc<InstrumentedUploader>,
        max_upload_count: usize,
    ) -> UploadManager {
        UploadManager::new(
            Arc::new(uploader),
            max_upload_count,
            DiagnosticsHandle::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn concurrency_stays_within_the_configured_bound() {
        const WORKER_COUNT: usize = 5;
        const BAG_COUNT: u64 = 60;

        let uploader = Arc::new(InstrumentedUploader::default());
        let manager = manager_with(Arc::clone(&uploader), WORKER_COUNT);
        let run_token = CancellationToken::new();

        let mut rng = StdRng::seed_from_u64(42);
        for number in 0..BAG_COUNT {
            manager.add_bag(bag(number, rng.gen_ratio(1, 3)), &run_token);
        }
        let drained = wait_until(Duration::from_secs(10), || {
            let manager = manager.clone();
            async move { manager.queued() == 0 }
        })
        .await;
        assert!(drained, "queue should drain");
        manager.wait().await;

        assert!(uploader.peak.load(AtomicOrdering::SeqCst) <= WORKER_COUNT);
        assert_eq!(
            uploader.uploaded.lock().expect("lock is not poisoned").len(),
            BAG_COUNT as usize
        );
    }

    #[tokio::test]
    async fn zero_upload_count_disables_uploading() {
        let uploader = Arc::new(InstrumentedUploader::default());
        let manager = manager_with(Arc::clone(&uploader), 0);
        let run_token = CancellationToken::new();

        manager.add_bag(bag(0, true), &run_token);
        manager.start_all_workers(&run_token);
        manager.wait().await;

        assert!(uploader
            .uploaded
            .lock()
            .expect("lock is not poisoned")
            .is_empty());
        assert_eq!(manager.queued(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_token_stops_new_workers() {
        let uploader = Arc::new(InstrumentedUploader::default());
        let manager = manager_with(Arc::clone(&uploader), 2);
        let run_token = CancellationToken::new();
        run_token.cancel();

        manager.add_bag(bag(0, true), &run_token);
        manager.wait().await;
        assert_eq!(manager.queued(), 1);
    }

    #[tokio::test]
    async fn empty_bags_are_cleaned_up_like_successes() -> TestResult {
        let dir = tempfile::tempdir()?;
        let run_dir = dir.path().join("run");
        std::fs::create_dir(&run_dir)?;
        let path = run_dir.join("mission_0.db3");
        std::fs::write(&path, b"segment")?;
        std::fs::write(run_dir.join("mission_0.db3-wal"), b"wal")?;
        std::fs::write(run_dir.join("mission_0.db3-shm"), b"shm")?;
        std::fs::write(run_dir.join("metadata.yaml"), b"writer metadata")?;

        let uploader = Arc::new(InstrumentedUploader {
            fail_with_empty: true,
            ..InstrumentedUploader::default()
        });
        let manager = manager_with(uploader, 1);
        let run_token = CancellationToken::new();
        manager.add_bag(
            BagMetadata {
                path: path.clone(),
                number: 0,
                is_new: true,
            },
            &run_token,
        );
        manager.wait().await;

        assert!(!path.exists());
        assert!(!run_dir.exists(), "empty run directory is removed");
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_leaves_sibling_segments_in_place() -> TestResult {
        let dir = tempfile::tempdir()?;
        let run_dir = dir.path().join("run");
        std::fs::create_dir(&run_dir)?;
        let uploaded = run_dir.join("mission_0.db3");
        let remaining = run_dir.join("mission_1.db3");
        std::fs::write(&uploaded, b"segment zero")?;
        std::fs::write(&remaining, b"segment one")?;

        remove_bag_files(&BagMetadata {
            path: uploaded.clone(),
            number: 0,
            is_new: true,
        });

        assert!(!uploaded.exists());
        assert!(remaining.exists());
        assert!(run_dir.exists(), "non-empty run directory is kept");
        Ok(())
    }

    #[test]
    fn load_existing_admits_only_segments() -> TestResult {
        let dir = tempfile::tempdir()?;
        let run_dir = dir.path().join("2024-05-01T10:00:00.000000000Z");
        std::fs::create_dir(&run_dir)?;
        std::fs::write(run_dir.join("mission_0.db3"), b"zero")?;
        std::fs::write(run_dir.join("mission_1.db3"), b"one")?;
        std::fs::write(run_dir.join("mission_1.db3-wal"), b"wal")?;
        std::fs::write(run_dir.join("metadata.yaml"), b"writer metadata")?;
        std::fs::write(dir.path().join("notes.txt"), b"unrelated")?;

        let uploader = Arc::new(InstrumentedUploader::default());
        let manager = manager_with(uploader, 1);
        assert_eq!(manager.load_existing(dir.path()), 2);
        assert_eq!(manager.queued(), 2);
        Ok(())
    }
}
