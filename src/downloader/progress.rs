//! Aggregate download progress
//!
//! Workers update disjoint per-file counters plus one global byte counter.
//! Readers only ever load the global atomic, so a snapshot never sees a
//! partially summed total.

use crate::patchlist::PatchDescriptor;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Length of the speed sampling window
pub const SPEED_WINDOW: Duration = Duration::from_secs(1);

const STATE_QUEUED: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_DONE: u8 = 2;
const STATE_FAILED: u8 = 3;

struct FileProgress {
    file_name: String,
    size: u64,
    downloaded: AtomicU64,
    state: AtomicU8,
}

/// Thread-safe progress shared by every download worker
pub struct ProgressAggregator {
    files: Vec<FileProgress>,
    total_bytes: u64,
    downloaded: AtomicU64,
    completed: AtomicUsize,
    in_flight: AtomicUsize,
}

impl ProgressAggregator {
    pub fn new(patches: &[PatchDescriptor]) -> Self {
        let files = patches
            .iter()
            .map(|p| FileProgress {
                file_name: p.file_name.clone(),
                size: p.size_bytes,
                downloaded: AtomicU64::new(0),
                state: AtomicU8::new(STATE_QUEUED),
            })
            .collect();

        Self {
            files,
            total_bytes: patches.iter().map(|p| p.size_bytes).sum(),
            downloaded: AtomicU64::new(0),
            completed: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Mark a transfer as started
    pub fn begin(&self, index: usize) {
        self.files[index].state.store(STATE_ACTIVE, Ordering::Release);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Record bytes written to disk for one file
    pub fn add(&self, index: usize, bytes: u64) {
        self.files[index].downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.downloaded.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Mark an active transfer as finished
    pub fn complete(&self, index: usize) {
        if self.files[index].state.swap(STATE_DONE, Ordering::AcqRel) == STATE_ACTIVE {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    /// A file already on disk counts as fully downloaded without a transfer
    pub fn skip(&self, index: usize) {
        let file = &self.files[index];
        let already = file.downloaded.swap(file.size, Ordering::AcqRel);
        self.downloaded
            .fetch_add(file.size.saturating_sub(already), Ordering::AcqRel);
        file.state.store(STATE_DONE, Ordering::Release);
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn fail(&self, index: usize) {
        if self.files[index].state.swap(STATE_FAILED, Ordering::AcqRel) == STATE_ACTIVE {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let active_files = self
            .files
            .iter()
            .filter(|f| f.state.load(Ordering::Acquire) == STATE_ACTIVE)
            .map(|f| ActiveFile {
                file_name: f.file_name.clone(),
                downloaded: f.downloaded.load(Ordering::Relaxed),
                size: f.size,
            })
            .collect();

        ProgressSnapshot {
            total_bytes: self.total_bytes,
            downloaded_bytes: self.downloaded.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
            in_flight: self.in_flight.load(Ordering::Acquire),
            total_patches: self.files.len(),
            active_files,
        }
    }
}

/// Point-in-time view of the aggregate counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub completed: usize,
    pub in_flight: usize,
    pub total_patches: usize,
    pub active_files: Vec<ActiveFile>,
}

/// A file currently being transferred
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveFile {
    pub file_name: String,
    pub downloaded: u64,
    pub size: u64,
}

/// Download progress as reported to the consumer
#[derive(Debug, Clone, Serialize)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: f64,
    pub eta_secs: Option<u64>,
    pub completed: usize,
    pub in_flight: usize,
    pub total_patches: usize,
    pub active_files: Vec<ActiveFile>,
}

impl DownloadProgress {
    pub fn from_snapshot(snapshot: ProgressSnapshot, speed: f64) -> Self {
        let remaining = snapshot.total_bytes.saturating_sub(snapshot.downloaded_bytes);
        let eta_secs = if remaining == 0 {
            Some(0)
        } else if speed > 0.0 {
            Some((remaining as f64 / speed).ceil() as u64)
        } else {
            None
        };

        Self {
            downloaded_bytes: snapshot.downloaded_bytes,
            total_bytes: snapshot.total_bytes,
            speed_bytes_per_sec: speed,
            eta_secs,
            completed: snapshot.completed,
            in_flight: snapshot.in_flight,
            total_patches: snapshot.total_patches,
            active_files: snapshot.active_files,
        }
    }
}

/// Windowed throughput: bytes since the last sample over time since the last sample
#[derive(Debug)]
pub struct SpeedWindow {
    last_sample: Instant,
    last_bytes: u64,
    speed: f64,
}

impl SpeedWindow {
    pub fn new(now: Instant, bytes: u64) -> Self {
        Self {
            last_sample: now,
            last_bytes: bytes,
            speed: 0.0,
        }
    }

    /// Feed the current byte count; the speed only moves once a full window has passed
    pub fn update(&mut self, now: Instant, bytes: u64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_sample);
        if elapsed >= SPEED_WINDOW {
            let delta = bytes.saturating_sub(self.last_bytes);
            self.speed = delta as f64 / elapsed.as_secs_f64();
            self.last_sample = now;
            self.last_bytes = bytes;
        }
        self.speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Repository;
    use std::sync::Arc;

    fn patch(name: &str, size: u64) -> PatchDescriptor {
        PatchDescriptor::new(
            name,
            format!("http://example.com/game/{}", name),
            size,
            "2020.01.01.0000.0000",
            Repository::Game,
        )
    }

    #[test]
    fn test_counters() {
        let agg = ProgressAggregator::new(&[patch("a.patch", 100), patch("b.patch", 50)]);

        agg.begin(0);
        agg.add(0, 40);
        agg.skip(1);

        let snap = agg.snapshot();
        assert_eq!(snap.total_bytes, 150);
        assert_eq!(snap.downloaded_bytes, 90);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.in_flight, 1);
        assert_eq!(snap.active_files.len(), 1);
        assert_eq!(snap.active_files[0].file_name, "a.patch");

        agg.add(0, 60);
        agg.complete(0);
        let snap = agg.snapshot();
        assert_eq!(snap.downloaded_bytes, 150);
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.in_flight, 0);
    }

    #[test]
    fn test_concurrent_adds_sum_exactly() {
        let patches: Vec<_> = (0..4).map(|i| patch(&format!("{}.patch", i), 10_000)).collect();
        let agg = Arc::new(ProgressAggregator::new(&patches));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    agg.begin(i);
                    for _ in 0..10_000 {
                        agg.add(i, 1);
                    }
                    agg.complete(i);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = agg.snapshot();
        assert_eq!(snap.downloaded_bytes, 40_000);
        assert_eq!(snap.completed, 4);
        assert_eq!(snap.in_flight, 0);
    }

    #[test]
    fn test_speed_window() {
        let start = Instant::now();
        let mut window = SpeedWindow::new(start, 0);

        // Less than a window: no sample yet
        assert_eq!(window.update(start + Duration::from_millis(500), 1_000), 0.0);

        let speed = window.update(start + Duration::from_secs(2), 4_000);
        assert!((speed - 2_000.0).abs() < 1e-6);

        // Only the recent window counts, not the cumulative average
        let speed = window.update(start + Duration::from_secs(3), 4_500);
        assert!((speed - 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_eta() {
        let snap = ProgressSnapshot {
            total_bytes: 1_000,
            downloaded_bytes: 400,
            completed: 0,
            in_flight: 1,
            total_patches: 1,
            active_files: Vec::new(),
        };
        assert_eq!(DownloadProgress::from_snapshot(snap.clone(), 200.0).eta_secs, Some(3));
        assert_eq!(DownloadProgress::from_snapshot(snap, 0.0).eta_secs, None);
    }
}
