use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::Message;

/// A pre- or post-processing stage. Mutates the message in place.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &mut Message) -> Result<()>;

    fn name(&self) -> &str;
}

/// Adapts a synchronous closure into a [`MessageProcessor`].
pub struct FnProcessor<F> {
    name: String,
    func: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&mut Message) -> Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> MessageProcessor for FnProcessor<F>
where
    F: Fn(&mut Message) -> Result<()> + Send + Sync,
{
    async fn process(&self, message: &mut Message) -> Result<()> {
        (self.func)(message)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Counters for messages that went through `intercept`.
#[derive(Debug, Default)]
pub struct PipelineStats {
    intercepted: AtomicU64,
    processed: AtomicU64,
    ignored: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub intercepted: u64,
    pub processed: u64,
    pub ignored: u64,
    pub failed: u64,
}

impl PipelineStats {
    pub(crate) fn record_intercepted(&self) {
        self.intercepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            intercepted: self.intercepted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_processor_mutates_message() {
        let upper = FnProcessor::new("uppercase", |m: &mut Message| {
            m.content = m.content.to_uppercase();
            Ok(())
        });
        let mut msg = Message::new("user_123", "assistant", "hello");
        upper.process(&mut msg).await.unwrap();
        assert_eq!(msg.content, "HELLO");
        assert_eq!(upper.name(), "uppercase");
    }

    #[tokio::test]
    async fn fn_processor_propagates_errors() {
        let reject = FnProcessor::new("reject", |_m: &mut Message| Err(anyhow::anyhow!("blocked")));
        let mut msg = Message::new("user_123", "assistant", "hello");
        let err = reject.process(&mut msg).await.unwrap_err();
        assert_eq!(err.to_string(), "blocked");
    }

    #[test]
    fn stats_snapshot_reflects_counters() {
        let stats = PipelineStats::default();
        stats.record_intercepted();
        stats.record_intercepted();
        stats.record_processed();
        stats.record_ignored();
        assert_eq!(
            stats.snapshot(),
            PipelineStatsSnapshot {
                intercepted: 2,
                processed: 1,
                ignored: 1,
                failed: 0,
            }
        );
    }
}
