/*!
 * Debounced assembly of fragmented objects.
 *
 * Fragments for one stream key are merged into a pending [`Node`] tree and
 * a single-shot timer is (re)armed for that key. When the timer fires it
 * posts a [`TimerFired`] to the owner's event loop, which hands it back to
 * [`Assembler::on_quiet_period_elapsed`] to take the finished tree.
 *
 * Re-arming aborts the previous timer task and bumps the record's
 * generation, so a late fire from a superseded timer is recognised and
 * dropped. Each record is finalized exactly once.
 */
use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use greennet_core::types::Value;

use crate::device::Result;
use crate::path_tree::Node;

/// Logical stream a fragment belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKey {
    /// Bulk snapshot, one tree keyed by device id
    Discovery,
    /// Telegram stream of one device
    Telegram(String),
    /// Live delta stream of one device
    Delta(String),
}

/// Posted when a stream's quiet period has elapsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    /// Stream whose timer fired
    pub key: StreamKey,
    /// Generation the timer was armed for
    pub generation: u64,
}

#[derive(Debug)]
struct PendingAssembly {
    tree: Node,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Default for PendingAssembly {
    fn default() -> Self {
        Self {
            tree: Node::object(),
            generation: 0,
            timer: None,
        }
    }
}

/// Pending assembly records with their timers
#[derive(Debug)]
pub struct Assembler {
    pending: HashMap<StreamKey, PendingAssembly>,
    next_generation: u64,
    fired: mpsc::UnboundedSender<TimerFired>,
}

impl Assembler {
    /// Create an assembler posting timer fires to `fired`
    pub fn new(fired: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            pending: HashMap::new(),
            next_generation: 0,
            fired,
        }
    }

    /// Merge one flattened leaf and re-arm the stream's timer
    pub fn on_fragment(&mut self, key: StreamKey, path: &str, raw: &str, quiet: Duration) -> Result<()> {
        let record = self.pending.entry(key.clone()).or_default();
        if let Err(e) = record.tree.set(path, Value::parse(raw)) {
            if record.timer.is_none() {
                self.pending.remove(&key);
            }
            return Err(e);
        }

        trace!(?key, path, raw, "Merged fragment");
        self.arm(key, quiet);
        Ok(())
    }

    /// Merge a whole subtree and re-arm the stream's timer
    pub fn merge_tree(&mut self, key: StreamKey, tree: Node, quiet: Duration) {
        self.pending.entry(key.clone()).or_default().tree.merge(tree);
        self.arm(key, quiet);
    }

    /// (Re)arm the timer of a pending stream. Any earlier timer for the same
    /// key is cancelled.
    pub fn arm(&mut self, key: StreamKey, quiet: Duration) {
        self.next_generation += 1;
        let generation = self.next_generation;

        let record = self.pending.entry(key.clone()).or_default();
        if let Some(previous) = record.timer.take() {
            previous.abort();
        }
        record.generation = generation;

        let fired = self.fired.clone();
        record.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            // The receiver is gone once the owner shut down
            let _ = fired.send(TimerFired { key, generation });
        }));
    }

    /// Take the finished tree for a fired timer.
    ///
    /// Returns `None` when the fire is stale: the stream was re-armed,
    /// already finalized or cancelled after this timer was armed.
    pub fn on_quiet_period_elapsed(&mut self, fired: TimerFired) -> Option<(StreamKey, Node)> {
        let current = self.pending.get(&fired.key)?.generation;
        if current != fired.generation {
            trace!(key = ?fired.key, "Ignoring superseded timer");
            return None;
        }

        self.pending
            .remove(&fired.key)
            .map(|record| (fired.key, record.tree))
    }

    /// Whether a stream has a pending record
    pub fn is_pending(&self, key: &StreamKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Tree accumulated so far for a stream
    pub fn peek(&self, key: &StreamKey) -> Option<&Node> {
        self.pending.get(key).map(|record| &record.tree)
    }

    /// Number of pending streams
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Cancel every timer and drop every pending record
    pub fn cancel_all(&mut self) {
        for (_, record) in self.pending.drain() {
            if let Some(timer) = record.timer {
                timer.abort();
            }
        }
    }
}

impl Drop for Assembler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::sleep;

    const QUIET: Duration = Duration::from_millis(50);

    fn assembler() -> (Assembler, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Assembler::new(tx), rx)
    }

    fn drain(assembler: &mut Assembler, rx: &mut mpsc::UnboundedReceiver<TimerFired>) -> Vec<(StreamKey, Node)> {
        let mut finished = Vec::new();
        while let Ok(fired) = rx.try_recv() {
            finished.extend(assembler.on_quiet_period_elapsed(fired));
        }
        finished
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_finalizes_once() {
        let (mut assembler, mut rx) = assembler();
        let key = StreamKey::Delta("0123ABCD".into());

        for level in 0..10 {
            assembler
                .on_fragment(key.clone(), "states/dimValue", &level.to_string(), QUIET)
                .unwrap();
            sleep(Duration::from_millis(20)).await;
        }
        assert!(drain(&mut assembler, &mut rx).is_empty());
        assert!(assembler.is_pending(&key));

        sleep(QUIET * 2).await;
        let finished = drain(&mut assembler, &mut rx);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].1.to_json(), json!({"states": {"dimValue": 9}}));
        assert!(!assembler.is_pending(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_are_independent() {
        let (mut assembler, mut rx) = assembler();
        let a = StreamKey::Telegram("a".into());
        let b = StreamKey::Telegram("b".into());

        assembler.on_fragment(a.clone(), "functions/0/key", "switch", QUIET).unwrap();
        sleep(Duration::from_millis(30)).await;
        assembler.on_fragment(b.clone(), "functions/0/key", "switch", QUIET).unwrap();
        sleep(Duration::from_millis(30)).await;

        let finished = drain(&mut assembler, &mut rx);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].0, a);
        assert!(assembler.is_pending(&b));
        assert_eq!(assembler.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fire_ignored() {
        let (mut assembler, _rx) = assembler();
        let key = StreamKey::Discovery;

        assembler.merge_tree(key.clone(), Node::from_json(&json!({"x": {"deviceId": "x"}})), QUIET);
        let stale = TimerFired {
            key: key.clone(),
            generation: 0,
        };
        assert!(assembler.on_quiet_period_elapsed(stale).is_none());
        assert!(assembler.peek(&key).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (mut assembler, mut rx) = assembler();
        assembler.on_fragment(StreamKey::Discovery, "x/deviceId", "x", QUIET).unwrap();
        assembler.on_fragment(StreamKey::Delta("x".into()), "states/switch", "on", QUIET).unwrap();

        assembler.cancel_all();
        sleep(QUIET * 2).await;

        assert!(assembler.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_path_leaves_no_record() {
        let (mut assembler, _rx) = assembler();
        let key = StreamKey::Delta("x".into());
        assert!(assembler.on_fragment(key.clone(), "//", "on", QUIET).is_err());
        assert!(!assembler.is_pending(&key));
    }
}
