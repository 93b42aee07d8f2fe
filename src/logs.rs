//! Invocation-scoped log collection over a container's combined output.
//!
//! The runtime image appends a fixed sentinel line to each of stdout and
//! stderr when an activation finishes, so one invocation accounts for two
//! marker occurrences. A reservation taken before the invocation starts is
//! resolved with every line seen between the reservation and its second
//! marker; lines belonging to earlier invocations on a reused container never
//! leak into a later batch.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::action::LogLine;
use crate::runtime::LogTail;

/// Sentinel the runtime writes to each stream at the end of an activation.
pub const ACTIVATION_MARKER: &str = "XXX_THE_END_OF_A_WHISK_ACTIVATION_XXX";

/// Markers emitted per invocation (one per stream).
const MARKERS_PER_INVOCATION: u32 = 2;

struct Pending {
    remaining: u32,
    collected: Vec<LogLine>,
    tx: oneshot::Sender<Vec<LogLine>>,
}

/// Synchronous marker-window accounting. Lines accumulate in a window that
/// closes at every marker; each reservation absorbs windows until its marker
/// budget is spent, then resolves with the absorbed lines.
pub struct MarkerLedger {
    window: Vec<LogLine>,
    pending: VecDeque<Pending>,
    markers_seen: u64,
}

impl MarkerLedger {
    pub fn new() -> Self {
        Self {
            window: Vec::new(),
            pending: VecDeque::new(),
            markers_seen: 0,
        }
    }

    /// Reserve the log batch for the next invocation. Must be called before
    /// the invocation's first output can arrive.
    pub fn reserve(&mut self) -> oneshot::Receiver<Vec<LogLine>> {
        let (tx, rx) = oneshot::channel();
        self.pending.push_back(Pending {
            remaining: MARKERS_PER_INVOCATION,
            collected: Vec::new(),
            tx,
        });
        rx
    }

    pub fn observe(&mut self, line: LogLine) {
        if line.message.contains(ACTIVATION_MARKER) {
            self.markers_seen += 1;
            let window = std::mem::take(&mut self.window);
            if let Some(front) = self.pending.front_mut() {
                front.collected.extend(window);
                front.remaining -= 1;
                if front.remaining == 0 {
                    if let Some(done) = self.pending.pop_front() {
                        let _ = done.tx.send(done.collected);
                    }
                }
            }
            // With no reservation outstanding the window is discarded: the
            // lines belong to no tracked invocation.
        } else {
            self.window.push(line);
        }
    }

    /// Markers consumed so far; advances monotonically, never resets.
    pub fn markers_seen(&self) -> u64 {
        self.markers_seen
    }
}

impl Default for MarkerLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Async wrapper owning the tail-pump task for one container. Dropping the
/// collector detaches the subscription.
pub struct LogCollector {
    ledger: Arc<Mutex<MarkerLedger>>,
    task: JoinHandle<()>,
}

impl LogCollector {
    /// Attach to a container's line tail. The pump survives individual
    /// stream error events; those arrive as `LogStream::Error` lines and are
    /// recorded like any other output.
    pub fn attach(mut tail: LogTail) -> Self {
        let ledger = Arc::new(Mutex::new(MarkerLedger::new()));
        let pump = Arc::clone(&ledger);
        let task = tokio::spawn(async move {
            while let Some(line) = tail.lines.recv().await {
                if let Ok(mut ledger) = pump.lock() {
                    ledger.observe(line);
                }
            }
        });
        Self { ledger, task }
    }

    /// Reserve the batch for the next invocation.
    pub fn reserve(&self) -> oneshot::Receiver<Vec<LogLine>> {
        match self.ledger.lock() {
            Ok(mut ledger) => ledger.reserve(),
            Err(poisoned) => poisoned.into_inner().reserve(),
        }
    }

    /// Await a reserved batch, falling back to an empty batch if it does not
    /// resolve within the grace period (stream not attached yet, or the
    /// runtime never flushed its markers).
    pub async fn fetch(
        batch: oneshot::Receiver<Vec<LogLine>>,
        grace: Duration,
    ) -> Vec<LogLine> {
        match tokio::time::timeout(grace, batch).await {
            Ok(Ok(lines)) => lines,
            _ => Vec::new(),
        }
    }
}

impl Drop for LogCollector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::LogStream;
    use tokio::sync::mpsc;

    fn marker() -> LogLine {
        LogLine::stdout(ACTIVATION_MARKER)
    }

    #[test]
    fn batch_delivered_after_two_markers() {
        let mut ledger = MarkerLedger::new();
        let mut rx = ledger.reserve();

        ledger.observe(LogLine::stdout("hello"));
        ledger.observe(marker());
        assert!(rx.try_recv().is_err(), "one marker must not resolve a batch");

        ledger.observe(LogLine::stderr("world"));
        ledger.observe(marker());

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].message, "hello");
        assert_eq!(batch[1].message, "world");
        assert_eq!(ledger.markers_seen(), 2);
    }

    #[test]
    fn reused_container_batches_do_not_leak_across_invocations() {
        let mut ledger = MarkerLedger::new();

        // Invocation 1 on a fresh container.
        let mut first = ledger.reserve();
        ledger.observe(LogLine::stdout("first-a"));
        ledger.observe(marker());
        ledger.observe(LogLine::stdout("first-b"));
        ledger.observe(marker());

        // Invocation 2 back-to-back on the same container.
        let mut second = ledger.reserve();
        ledger.observe(LogLine::stdout("second-a"));
        ledger.observe(marker());
        ledger.observe(marker());

        let first = first.try_recv().unwrap();
        assert_eq!(
            first.iter().map(|l| l.message.as_str()).collect::<Vec<_>>(),
            vec!["first-a", "first-b"]
        );

        let second = second.try_recv().unwrap();
        assert_eq!(
            second.iter().map(|l| l.message.as_str()).collect::<Vec<_>>(),
            vec!["second-a"],
            "invocation 2 must exclude every line before invocation 1's final marker"
        );
        assert_eq!(ledger.markers_seen(), 4);
    }

    #[test]
    fn unreserved_output_is_discarded() {
        let mut ledger = MarkerLedger::new();
        ledger.observe(LogLine::stdout("startup noise"));
        ledger.observe(marker());
        ledger.observe(marker());

        let mut rx = ledger.reserve();
        ledger.observe(LogLine::stdout("wanted"));
        ledger.observe(marker());
        ledger.observe(marker());

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message, "wanted");
    }

    #[test]
    fn stream_errors_are_recorded_not_fatal() {
        let mut ledger = MarkerLedger::new();
        let mut rx = ledger.reserve();
        ledger.observe(LogLine::stdout("before"));
        ledger.observe(LogLine::error("read error: connection reset"));
        ledger.observe(marker());
        ledger.observe(marker());

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].stream, LogStream::Error);
    }

    #[tokio::test]
    async fn collector_resolves_reservation_from_the_tail() {
        let (tx, rx) = mpsc::unbounded_channel();
        let collector = LogCollector::attach(LogTail { lines: rx });

        let batch = collector.reserve();
        tx.send(LogLine::stdout("streamed")).unwrap();
        tx.send(marker()).unwrap();
        tx.send(marker()).unwrap();

        let lines = LogCollector::fetch(batch, Duration::from_secs(1)).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, "streamed");
    }

    #[tokio::test]
    async fn fetch_falls_back_to_empty_after_grace() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let collector = LogCollector::attach(LogTail { lines: rx });
        let batch = collector.reserve();
        let lines = LogCollector::fetch(batch, Duration::from_millis(20)).await;
        assert!(lines.is_empty());
    }
}
