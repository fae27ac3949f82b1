//! Per-destination message bundling.
//!
//! Small frames for the same destination (and the same flags) accumulate in a
//! pending list. A background drain task picks bundles up and hands them to
//! the transmit function: a bundle of one frame goes out as that frame, larger
//! bundles go out as one batch frame.
//!
//! Each destination has a single serialization buffer. When appending a frame
//! would overflow `max_bundle_size`, the producer serializes the pending list
//! into the buffer and starts a new list. If the buffer is still waiting for
//! the drain task, the producer waits for it to be freed instead. The drain
//! task always transmits the buffer before the pending list, so frames leave
//! in the order they were submitted, exactly once.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use gridwire_core::{Address, Providers, TaskProvider};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, trace};

use crate::order::MessageFlags;
use crate::wire::encode_batch;

/// Bundles are kept per destination and per flag set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleKey {
    /// Destination member, `None` for a broadcast.
    pub destination: Option<Address>,
    /// Flags every frame in the bundle shares.
    pub flags: MessageFlags,
}

/// Hands a serialized bundle to the group channel.
pub type TransmitFn = Rc<dyn Fn(&BundleKey, Vec<u8>)>;

struct Bundle {
    pending: Vec<Vec<u8>>,
    pending_bytes: usize,
    buffer: Option<Vec<Vec<u8>>>,
    buffer_freed: Rc<Notify>,
}

impl Bundle {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            pending_bytes: 0,
            buffer: None,
            buffer_freed: Rc::new(Notify::new()),
        }
    }

    fn take_pending(&mut self) -> Option<Vec<Vec<u8>>> {
        if self.pending.is_empty() {
            return None;
        }
        self.pending_bytes = 0;
        Some(serialize(std::mem::take(&mut self.pending)))
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.buffer.is_none()
    }
}

/// Turn a pending list into the messages that go on the wire.
fn serialize(frames: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    if frames.len() == 1 {
        return frames;
    }
    match encode_batch(&frames) {
        Ok(batch) => vec![batch],
        Err(err) => {
            error!(
                error = %err,
                frames = frames.len(),
                "cannot batch frames, sending them one by one"
            );
            frames
        }
    }
}

struct Shared {
    max_bundle_size: usize,
    bundles: RefCell<HashMap<BundleKey, Bundle>>,
    work_available: Notify,
    running: Cell<bool>,
    transmit: TransmitFn,
}

impl Shared {
    /// Append `frame` to its bundle.
    ///
    /// Hands the frame back, with the notify to wait on, when the bundle is
    /// full and its buffer is still in use. With `overfill` the frame is
    /// appended anyway.
    fn try_enqueue(
        &self,
        key: &BundleKey,
        frame: Vec<u8>,
        overfill: bool,
    ) -> Result<(), (Vec<u8>, Rc<Notify>)> {
        let mut bundles = self.bundles.borrow_mut();
        let bundle = bundles.entry(key.clone()).or_insert_with(Bundle::new);

        if !bundle.pending.is_empty() && bundle.pending_bytes + frame.len() > self.max_bundle_size {
            if bundle.buffer.is_none() {
                bundle.buffer = bundle.take_pending();
            } else if !overfill {
                return Err((frame, bundle.buffer_freed.clone()));
            }
        }
        bundle.pending_bytes += frame.len();
        bundle.pending.push(frame);
        Ok(())
    }

    /// Transmit everything currently bundled. Returns whether anything went out.
    fn flush(&self) -> bool {
        let keys: Vec<BundleKey> = self.bundles.borrow().keys().cloned().collect();
        let mut sent_any = false;
        for key in keys {
            let taken = {
                let mut bundles = self.bundles.borrow_mut();
                let Some(bundle) = bundles.get_mut(&key) else {
                    continue;
                };
                let buffered = bundle.buffer.take();
                let pending = bundle.take_pending();
                (buffered, pending, bundle.buffer_freed.clone())
            };
            let (buffered, pending, freed) = taken;

            // the buffer holds older frames than the pending list
            for message in buffered.into_iter().chain(pending).flatten() {
                trace!(
                    destination = ?key.destination,
                    bytes = message.len(),
                    "transmitting bundle"
                );
                (self.transmit)(&key, message);
                sent_any = true;
            }
            freed.notify_waiters();

            let mut bundles = self.bundles.borrow_mut();
            if bundles.get(&key).is_some_and(Bundle::is_idle) {
                bundles.remove(&key);
            }
        }
        sent_any
    }
}

/// Batches outbound frames per destination.
pub struct Bundler<P: Providers> {
    providers: P,
    shared: Rc<Shared>,
    drain: RefCell<Option<JoinHandle<()>>>,
}

impl<P: Providers> Bundler<P> {
    /// Create a bundler that hands bundles to `transmit`.
    pub fn new(providers: P, max_bundle_size: usize, transmit: TransmitFn) -> Self {
        Self {
            providers,
            shared: Rc::new(Shared {
                max_bundle_size,
                bundles: RefCell::new(HashMap::new()),
                work_available: Notify::new(),
                running: Cell::new(false),
                transmit,
            }),
            drain: RefCell::new(None),
        }
    }

    /// Spawn the drain task.
    pub fn start(&self) {
        if self.shared.running.replace(true) {
            return;
        }
        let shared = self.shared.clone();
        let handle = self.providers.task().spawn_task("bundler_drain", async move {
            while shared.running.get() {
                if !shared.flush() {
                    shared.work_available.notified().await;
                }
            }
        });
        *self.drain.borrow_mut() = Some(handle);
    }

    /// Flush what is left and stop the drain task.
    pub fn stop(&self) {
        self.shared.running.set(false);
        self.shared.flush();
        if let Some(handle) = self.drain.borrow_mut().take() {
            handle.abort();
        }
    }

    /// Queue `frame`, waiting while the destination's bundle is full and its
    /// buffer has not been transmitted yet.
    pub async fn send(&self, key: BundleKey, frame: Vec<u8>) {
        let mut frame = frame;
        loop {
            match self.shared.try_enqueue(&key, frame, false) {
                Ok(()) => break,
                Err((returned, freed)) => {
                    trace!(
                        destination = ?key.destination,
                        "bundle full, waiting for the drain task"
                    );
                    frame = returned;
                    freed.notified().await;
                }
            }
        }
        self.shared.work_available.notify_one();
    }

    /// Queue `frame` without ever waiting.
    ///
    /// For callers on a delivery path: a full bundle grows past its limit
    /// rather than blocking the caller.
    pub fn send_non_blocking(&self, key: BundleKey, frame: Vec<u8>) {
        if self.shared.try_enqueue(&key, frame, true).is_err() {
            // overfill never hands the frame back
            error!("bundler refused a non-blocking frame");
        }
        self.shared.work_available.notify_one();
    }

    /// Transmit everything bundled so far, on the caller's stack.
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Number of destinations with frames waiting.
    pub fn active_destinations(&self) -> usize {
        self.shared.bundles.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gridwire_core::{TokioProviders, UID};

    use super::*;
    use crate::request::RequestId;
    use crate::wire::{FrameKind, decode_batch, decode_frame, encode_frame};

    fn addr(n: u64) -> Address {
        Address::new(UID::new(0, n), format!("n{n}"))
    }

    fn key(n: u64) -> BundleKey {
        BundleKey {
            destination: Some(addr(n)),
            flags: MessageFlags::NO_TOTAL_ORDER,
        }
    }

    fn frame(id: RequestId) -> Vec<u8> {
        encode_frame(FrameKind::Request, id, &[7u8; 32]).expect("encode")
    }

    type Wire = Rc<RefCell<Vec<(BundleKey, Vec<u8>)>>>;

    fn recording_bundler(max: usize) -> (Bundler<TokioProviders>, Wire) {
        let wire: Wire = Rc::new(RefCell::new(Vec::new()));
        let log = wire.clone();
        let transmit: TransmitFn = Rc::new(move |key: &BundleKey, bytes: Vec<u8>| {
            log.borrow_mut().push((key.clone(), bytes));
        });
        (Bundler::new(TokioProviders::new(), max, transmit), wire)
    }

    /// Request ids in wire order, unpacking batches.
    fn ids_on_wire(wire: &Wire, dest: &BundleKey) -> Vec<RequestId> {
        let mut ids = Vec::new();
        for (key, bytes) in wire.borrow().iter().filter(|(k, _)| k == dest) {
            assert_eq!(key, dest);
            let outer = decode_frame(bytes).expect("frame");
            if outer.kind == FrameKind::Batch {
                let inner = decode_batch(&outer.payload).expect("batch");
                ids.extend(inner.iter().map(|f| f.request_id));
            } else {
                ids.push(outer.request_id);
            }
        }
        ids
    }

    #[tokio::test]
    async fn test_no_loss_no_duplication_no_reordering() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (bundler, wire) = recording_bundler(200);
                bundler.start();

                for id in 1..=100 {
                    bundler.send(key(1), frame(id)).await;
                    if id % 7 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                for id in 1..=10 {
                    bundler.send(key(2), frame(id)).await;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;

                assert_eq!(ids_on_wire(&wire, &key(1)), (1..=100).collect::<Vec<_>>());
                assert_eq!(ids_on_wire(&wire, &key(2)), (1..=10).collect::<Vec<_>>());
                assert_eq!(bundler.active_destinations(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_single_frame_bundle_is_sent_unwrapped() {
        let (bundler, wire) = recording_bundler(1024);
        bundler.send_non_blocking(key(1), frame(5));
        bundler.flush();

        let wire = wire.borrow();
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].1, frame(5));
    }

    #[tokio::test]
    async fn test_producer_waits_for_buffer() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (bundler, wire) = recording_bundler(100);
                let bundler = Rc::new(bundler);

                // two frames fill the bundle, the third moves them to the buffer
                for id in 1..=3 {
                    bundler.send(key(1), frame(id)).await;
                }
                for id in 4..=5 {
                    bundler.send_non_blocking(key(1), frame(id));
                }

                let producer = bundler.clone();
                let blocked = tokio::task::spawn_local(async move {
                    producer.send(key(1), frame(6)).await;
                });
                tokio::task::yield_now().await;
                assert!(!blocked.is_finished(), "buffer still in use");
                assert!(wire.borrow().is_empty());

                bundler.start();
                blocked.await.expect("producer");
                tokio::time::sleep(Duration::from_millis(10)).await;

                assert_eq!(ids_on_wire(&wire, &key(1)), (1..=6).collect::<Vec<_>>());
            })
            .await;
    }

    #[tokio::test]
    async fn test_stop_flushes_remaining_frames() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (bundler, wire) = recording_bundler(4096);
                bundler.start();
                bundler.send_non_blocking(key(1), frame(1));
                bundler.send_non_blocking(key(1), frame(2));
                bundler.stop();

                assert_eq!(ids_on_wire(&wire, &key(1)), vec![1, 2]);
            })
            .await;
    }
}
