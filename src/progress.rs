//! Progress-callback trait for per-file batch events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the orchestrator walks the batch. The CLI forwards them to an
//! `indicatif` progress bar; a server could forward them to a log or a
//! WebSocket.
//!
//! # Example
//!
//! ```rust
//! use scan2table::{BatchProgressCallback, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl BatchProgressCallback for CountingCallback {
//!     fn on_file_complete(&self, index: usize, total: usize, name: &str, chars: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{}/{} {} ({} chars)", index + 1, total, name, chars);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the orchestrator as it processes each file.
///
/// Files are processed strictly in order, so calls never overlap within one
/// batch. The trait is still `Send + Sync` because a server may run several
/// batches at once against a shared callback. All methods default to no-ops.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once before the first file.
    fn on_batch_start(&self, total_files: usize) {
        let _ = total_files;
    }

    /// Called before a file is dispatched (`index` is 0-based).
    fn on_file_start(&self, index: usize, total_files: usize, name: &str) {
        let _ = (index, total_files, name);
    }

    /// Called once per rasterised PDF page, before it is processed.
    fn on_page_start(&self, file_index: usize, page_num: usize, total_pages: usize) {
        let _ = (file_index, page_num, total_pages);
    }

    /// Called when a file has been processed.
    ///
    /// * `chars`: character count the file contributed to the output
    fn on_file_complete(&self, index: usize, total_files: usize, name: &str, chars: usize) {
        let _ = (index, total_files, name, chars);
    }

    /// Called when a file fails. The batch stops right after this.
    fn on_file_error(&self, index: usize, total_files: usize, name: &str, error: &str) {
        let _ = (index, total_files, name, error);
    }

    /// Called once when every file succeeded.
    fn on_batch_complete(&self, total_files: usize, output_chars: usize) {
        let _ = (total_files, output_chars);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        pages: AtomicUsize,
    }

    impl BatchProgressCallback for TrackingCallback {
        fn on_file_start(&self, _index: usize, _total: usize, _name: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_start(&self, _file: usize, _page: usize, _total: usize) {
            self.pages.fetch_add(1, Ordering::SeqCst);
        }

        fn on_file_complete(&self, _index: usize, _total: usize, _name: &str, _chars: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_file_error(&self, _index: usize, _total: usize, _name: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_batch_start(2);
        cb.on_file_start(0, 2, "a.png");
        cb.on_page_start(0, 1, 3);
        cb.on_file_complete(0, 2, "a.png", 42);
        cb.on_file_error(1, 2, "b.png", "boom");
        cb.on_batch_complete(2, 42);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_file_start(0, 2, "a.png");
        tracker.on_file_complete(0, 2, "a.png", 10);
        tracker.on_file_start(1, 2, "b.pdf");
        tracker.on_page_start(1, 1, 2);
        tracker.on_page_start(1, 2, 2);
        tracker.on_file_error(1, 2, "b.pdf", "OCR failed");

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.pages.load(Ordering::SeqCst), 2);
    }
}
