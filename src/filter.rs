//! Filter fan-out: zero or more callables with the signature
//! `(buffer, frames, format)`, represented as an immutable snapshot taken
//! under the owning lock so additions/removals between callbacks are
//! atomic from the callback's perspective.

use std::sync::Arc;

use crate::format::AudioFormat;

/// A mix filter. Runs on the **mixer** format, except a per-channel filter,
/// which sees the post-conversion, pre-mix view.
pub type Filter = Arc<dyn Fn(&mut [i32], usize, AudioFormat) + Send + Sync>;

#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    pub fn new() -> Self {
        FilterChain {
            filters: Vec::new(),
        }
    }

    pub fn push(&mut self, filter: Filter) {
        self.filters.push(filter);
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// An immutable snapshot, safe to run without holding the owning lock.
    pub fn snapshot(&self) -> Vec<Filter> {
        self.filters.clone()
    }
}

/// Run a snapshot of filters in order over `buffer`.
pub fn run_filters(filters: &[Filter], buffer: &mut [i32], frames: usize, format: AudioFormat) {
    for filter in filters {
        filter(buffer, frames, format);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioFormat;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn snapshot_runs_independent_of_later_mutation() {
        let mut chain = FilterChain::new();
        let count = Arc::new(AtomicI32::new(0));
        let count2 = Arc::clone(&count);
        chain.push(Arc::new(move |_: &mut [i32], _: usize, _: AudioFormat| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        let snapshot = chain.snapshot();
        chain.clear();

        let mut buf = [0i32; 4];
        run_filters(&snapshot, &mut buf, 4, AudioFormat::mixer(44100, 1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
