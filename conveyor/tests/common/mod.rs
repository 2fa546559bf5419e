#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use conveyor::pipeline::ResultStream;
use conveyor::types::TaskResult;

/// Reads every result until the stream ends.
pub async fn collect_results<O>(results: ResultStream<O>) -> Vec<TaskResult<O>>
where
    O: Send + 'static,
{
    let mut results = results;
    let mut collected = Vec::new();
    while let Some(result) = results.next().await {
        collected.push(result);
    }
    collected
}

/// Tracks how many transforms run at the same time and the highest value observed.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn enter(&self) -> ProbeGuard {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        ProbeGuard {
            current: self.current.clone(),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct ProbeGuard {
    current: Arc<AtomicUsize>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}
