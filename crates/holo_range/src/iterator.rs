//! Prefetching range iterator.
//!
//! The iterator holds at most two decoded chunks: the one being consumed and
//! one completed readahead. The first record taken from a chunk starts the
//! fetch for the chunk after it, so a whole chunk's worth of consumption hides
//! the next round trip. At most one fetch is ever outstanding.
//!
//! Fetch completions run on a runtime worker (not on the consumer's task).
//! Every transition of cursor and chunk state happens under the single
//! per-iterator lock in [`Shared`]; consumers suspend on a `Notify` that the
//! completion path and `cancel` signal after releasing that lock.
//!
//! Construction issues the first fetch immediately, before anything is
//! consumed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::stream::{self, Stream};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{RangeError, Result};
use crate::fetch::{wait_parts, CancelHandle, FetchOutcome, RangeTransaction, ScanRequest};
use crate::metrics::ScanMetrics;
use crate::mode::StreamingMode;
use crate::selector::{continuation_selectors, printable, KeySelector};
use crate::wire::{DecodedChunk, KeyValue};

/// Immutable parameters of one iterator.
pub(crate) struct ScanParams {
    pub(crate) txn: Arc<dyn RangeTransaction>,
    pub(crate) row_limit: usize,
    pub(crate) target_bytes: usize,
    pub(crate) mode: StreamingMode,
    pub(crate) snapshot: bool,
    pub(crate) reverse: bool,
    pub(crate) metrics: Option<Arc<ScanMetrics>>,
}

impl ScanParams {
    fn rows_limited(&self) -> bool {
        self.row_limit != 0
    }
}

/// Position of the scan between fetches.
#[derive(Clone, Debug)]
struct Cursor {
    begin: KeySelector,
    end: KeySelector,
    rows_remaining: usize,
    iteration: u32,
}

struct ActiveChunk {
    chunk: DecodedChunk,
    index: usize,
}

impl ActiveChunk {
    fn new(chunk: DecodedChunk) -> Self {
        Self { chunk, index: 0 }
    }

    fn has_remaining(&self) -> bool {
        self.index < self.chunk.len()
    }

    /// Takes the next record and whether it was the chunk's first.
    fn take_next(&mut self) -> Option<(KeyValue, bool)> {
        let record = self.chunk.record(self.index)?;
        let first_touch = self.index == 0;
        self.index += 1;
        Some((record, first_touch))
    }
}

enum ScanState {
    /// Nothing fetched yet.
    Empty,
    HasCurrent {
        current: ActiveChunk,
        readahead: Option<DecodedChunk>,
    },
    Exhausted,
    Cancelled,
}

struct InFlight {
    handle: CancelHandle,
    iteration: u32,
}

struct IterState {
    state: ScanState,
    cursor: Cursor,
    inflight: Option<InFlight>,
    /// A fetch came back empty; nothing will ever follow.
    end_of_range: bool,
    /// Fetch failure waiting to be reported to the consumer.
    failure: Option<RangeError>,
    last_key: Option<Vec<u8>>,
}

/// Outcome of one look at the state under the lock.
enum Step<T> {
    Ready(Result<T>),
    Wait,
}

pub(crate) struct Shared {
    params: ScanParams,
    /// Runtime that drives fetch completions; `None` when none was available.
    executor: Option<Handle>,
    inner: Mutex<IterState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, IterState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chunk_is_last(&self, chunk: &DecodedChunk, cursor: &Cursor) -> bool {
        !chunk.has_more() || (self.params.rows_limited() && cursor.rows_remaining == 0)
    }

    fn range_finished(&self, st: &IterState) -> bool {
        if st.end_of_range {
            return true;
        }
        match &st.state {
            ScanState::HasCurrent { current, .. } => self.chunk_is_last(&current.chunk, &st.cursor),
            ScanState::Empty => false,
            ScanState::Exhausted | ScanState::Cancelled => true,
        }
    }

    /// Issues the next fetch unless the scan is already known to be complete.
    fn start_next_fetch(self: &Arc<Self>, st: &mut IterState) -> Result<()> {
        if st.inflight.is_some() {
            return Err(RangeError::invalid_state(
                "reentrant range fetch while another is outstanding",
            ));
        }
        if matches!(st.state, ScanState::Cancelled) || self.range_finished(st) {
            return Ok(());
        }
        let Some(executor) = &self.executor else {
            return Err(RangeError::invalid_state(
                "range iterator has no Tokio runtime to drive its fetches",
            ));
        };

        st.cursor.iteration += 1;
        let iteration = st.cursor.iteration;
        let request = ScanRequest {
            begin: st.cursor.begin.clone(),
            end: st.cursor.end.clone(),
            row_limit: if self.params.rows_limited() {
                st.cursor.rows_remaining
            } else {
                0
            },
            target_bytes: self.params.target_bytes,
            mode: self.params.mode,
            iteration,
            snapshot: self.params.snapshot,
            reverse: self.params.reverse,
        };
        debug!(
            iteration,
            begin = ?request.begin,
            end = ?request.end,
            row_limit = request.row_limit,
            mode = %request.mode,
            reverse = request.reverse,
            "issuing range fetch"
        );

        let (future, handle) = self.params.txn.get_range(request).into_parts();
        if let Some(metrics) = &self.params.metrics {
            metrics.record_fetch_issued();
        }
        st.inflight = Some(InFlight {
            handle: handle.clone(),
            iteration,
        });

        let shared = Arc::clone(self);
        executor.spawn(async move {
            let outcome = wait_parts(future, &handle).await;
            shared.complete_fetch(iteration, outcome);
        });
        Ok(())
    }

    /// Applies a finished fetch. Runs once per fetch, on a runtime worker.
    fn complete_fetch(&self, iteration: u32, outcome: Result<FetchOutcome>) {
        {
            let mut st = self.lock();
            match &st.inflight {
                Some(inflight) if inflight.iteration == iteration => {}
                // Cancelled or superseded; dropping `outcome` releases its buffer.
                _ => return,
            }
            st.inflight = None;
            let metrics = self.params.metrics.as_deref();

            match outcome {
                Err(err) => {
                    warn!(iteration, error = %err, "range fetch failed");
                    if let Some(metrics) = metrics {
                        metrics.record_fetch_failed();
                    }
                    st.failure = Some(err);
                }
                Ok(FetchOutcome::Exhausted) => {
                    debug!(iteration, "range fetch returned no rows");
                    if let Some(metrics) = metrics {
                        metrics.record_fetch_completed();
                    }
                    st.end_of_range = true;
                }
                Ok(FetchOutcome::Chunk(chunk)) => {
                    if let Some(metrics) = metrics {
                        metrics.record_fetch_completed();
                        metrics.record_chunk(chunk.len(), chunk.byte_len());
                    }
                    self.install_chunk(&mut st, iteration, chunk);
                }
            }
        }
        self.notify.notify_waiters();
    }

    fn install_chunk(&self, st: &mut IterState, iteration: u32, chunk: DecodedChunk) {
        st.cursor.rows_remaining = st.cursor.rows_remaining.saturating_sub(chunk.len());
        if let Some(last_key) = chunk.last_key() {
            let (begin, end) = continuation_selectors(
                &st.cursor.begin,
                &st.cursor.end,
                last_key,
                self.params.reverse,
            );
            st.cursor.begin = begin;
            st.cursor.end = end;
            debug!(
                iteration,
                rows = chunk.len(),
                more = chunk.has_more(),
                last_key = %printable(last_key),
                "range fetch completed"
            );
        }

        match &mut st.state {
            ScanState::Empty => {
                st.state = ScanState::HasCurrent {
                    current: ActiveChunk::new(chunk),
                    readahead: None,
                };
            }
            ScanState::HasCurrent { current, readahead } => {
                if current.has_remaining() {
                    *readahead = Some(chunk);
                } else {
                    *current = ActiveChunk::new(chunk);
                    *readahead = None;
                }
            }
            ScanState::Exhausted | ScanState::Cancelled => {}
        }
    }

    /// Decides whether a record can be taken now.
    fn poll_has_next(&self, st: &mut IterState) -> Step<bool> {
        match &mut st.state {
            ScanState::Cancelled => return Step::Ready(Err(RangeError::Cancelled)),
            ScanState::Exhausted => return Step::Ready(Ok(false)),
            ScanState::HasCurrent { current, readahead } => {
                if current.has_remaining() {
                    return Step::Ready(Ok(true));
                }
                if let Some(next) = readahead.take() {
                    *current = ActiveChunk::new(next);
                    return Step::Ready(Ok(true));
                }
            }
            ScanState::Empty => {}
        }

        // Current chunk (if any) is drained and nothing is queued behind it.
        if let Some(err) = st.failure.take() {
            st.state = ScanState::Exhausted;
            return Step::Ready(Err(err));
        }
        if self.range_finished(st) {
            st.state = ScanState::Exhausted;
            return Step::Ready(Ok(false));
        }
        if st.inflight.is_none() {
            return Step::Ready(Err(RangeError::invalid_state(
                "range iterator is waiting without an outstanding fetch",
            )));
        }
        Step::Wait
    }

    fn poll_next(self: &Arc<Self>, st: &mut IterState) -> Step<Option<KeyValue>> {
        match self.poll_has_next(st) {
            Step::Ready(Ok(true)) => {}
            Step::Ready(Ok(false)) => return Step::Ready(Ok(None)),
            Step::Ready(Err(err)) => return Step::Ready(Err(err)),
            Step::Wait => return Step::Wait,
        }

        let taken = match &mut st.state {
            ScanState::HasCurrent { current, readahead } => {
                let taken = current.take_next();
                if !current.has_remaining() {
                    if let Some(next) = readahead.take() {
                        *current = ActiveChunk::new(next);
                    }
                }
                taken
            }
            _ => None,
        };
        let Some((record, first_touch)) = taken else {
            return Step::Ready(Err(RangeError::invalid_state(
                "range chunk reported a record it does not hold",
            )));
        };

        st.last_key = Some(record.key.clone());
        if first_touch {
            if let Err(err) = self.start_next_fetch(st) {
                return Step::Ready(Err(err));
            }
        }
        if let Some(metrics) = &self.params.metrics {
            metrics.record_row_yielded();
        }
        Step::Ready(Ok(Some(record)))
    }

    /// Waits until `poll` produces an answer, re-checking after every wakeup.
    async fn wait_for<T, F>(self: &Arc<Self>, mut poll: F) -> Result<T>
    where
        F: FnMut(&Arc<Self>, &mut IterState) -> Step<T>,
    {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a completion between the check
            // and the await is not lost.
            notified.as_mut().enable();
            let step = {
                let mut st = self.lock();
                poll(self, &mut *st)
            };
            if let Step::Ready(result) = step {
                return result;
            }
            notified.await;
        }
    }

    fn cancel(&self) {
        let inflight = {
            let mut st = self.lock();
            if matches!(st.state, ScanState::Cancelled) {
                return;
            }
            st.state = ScanState::Cancelled;
            st.failure = None;
            st.inflight.take()
        };
        if let Some(inflight) = inflight {
            debug!(iteration = inflight.iteration, "cancelling in-flight range fetch");
            inflight.handle.cancel();
            if let Some(metrics) = &self.params.metrics {
                metrics.record_fetch_cancelled();
            }
        }
        self.notify.notify_waiters();
    }
}

/// Non-suspending readiness of a [`RangeIterator`].
#[derive(Debug)]
pub enum Readiness {
    /// A record can be taken without waiting.
    Ready,
    /// The range is fully consumed.
    Exhausted,
    /// The answer depends on the outstanding fetch.
    Pending(FetchWait),
}

/// Suspension handle tied to the iterator's outstanding fetch.
pub struct FetchWait {
    shared: Arc<Shared>,
}

impl FetchWait {
    /// Resolves to whether a record is available once the fetch settles.
    pub async fn wait(self) -> Result<bool> {
        self.shared
            .wait_for(|shared, st| shared.poll_has_next(st))
            .await
    }
}

impl std::fmt::Debug for FetchWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchWait").finish_non_exhaustive()
    }
}

/// Cancels an iterator from outside the task consuming it.
#[derive(Clone)]
pub struct IteratorCancelHandle {
    shared: Arc<Shared>,
}

impl IteratorCancelHandle {
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

/// Forward-only, non-restartable sequence of records in a range.
///
/// Dropping the iterator cancels any fetch it still has in flight.
pub struct RangeIterator {
    shared: Arc<Shared>,
}

impl RangeIterator {
    /// Creates the iterator and issues its first fetch on `executor`.
    ///
    /// Without an executor the iterator starts out failed: the first read
    /// reports `InvalidState`.
    pub(crate) fn start(
        params: ScanParams,
        begin: KeySelector,
        end: KeySelector,
        executor: Option<Handle>,
    ) -> Self {
        let cursor = Cursor {
            begin,
            end,
            rows_remaining: params.row_limit,
            iteration: 0,
        };
        let shared = Arc::new(Shared {
            params,
            executor,
            inner: Mutex::new(IterState {
                state: ScanState::Empty,
                cursor,
                inflight: None,
                end_of_range: false,
                failure: None,
                last_key: None,
            }),
            notify: Notify::new(),
        });
        {
            let mut st = shared.lock();
            if let Err(err) = shared.start_next_fetch(&mut st) {
                st.failure = Some(err);
            }
        }
        Self { shared }
    }

    /// Returns the next record, waiting on the outstanding fetch if needed.
    ///
    /// `Ok(None)` means the range is exhausted.
    pub async fn next(&mut self) -> Result<Option<KeyValue>> {
        self.shared
            .wait_for(|shared, st| shared.poll_next(st))
            .await
    }

    /// Whether another record exists, waiting if that is not yet known.
    pub async fn has_next(&self) -> Result<bool> {
        self.shared
            .wait_for(|shared, st| shared.poll_has_next(st))
            .await
    }

    /// Reports readiness without suspending.
    pub fn peek_ready(&self) -> Result<Readiness> {
        let step = {
            let mut st = self.shared.lock();
            self.shared.poll_has_next(&mut *st)
        };
        match step {
            Step::Ready(Ok(true)) => Ok(Readiness::Ready),
            Step::Ready(Ok(false)) => Ok(Readiness::Exhausted),
            Step::Ready(Err(err)) => Err(err),
            Step::Wait => Ok(Readiness::Pending(FetchWait {
                shared: Arc::clone(&self.shared),
            })),
        }
    }

    /// Stages a clear of the most recently returned key in the owning
    /// transaction. The clear is durable only if that transaction commits.
    pub fn remove_last(&self) -> Result<()> {
        let key = {
            let st = self.shared.lock();
            if matches!(st.state, ScanState::Cancelled) {
                return Err(RangeError::Cancelled);
            }
            st.last_key
                .clone()
                .ok_or_else(|| RangeError::invalid_state("no value has been fetched from the range"))?
        };
        self.shared.params.txn.clear(&key);
        Ok(())
    }

    /// Stops the iterator. Idempotent; later reads fail with `Cancelled`.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn cancel_handle(&self) -> IteratorCancelHandle {
        IteratorCancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of fetches issued so far.
    pub fn fetches_issued(&self) -> u32 {
        self.shared.lock().cursor.iteration
    }

    /// Drains the remaining records in order.
    pub async fn collect(mut self) -> Result<Vec<KeyValue>> {
        let mut out = Vec::new();
        while let Some(record) = self.next().await? {
            out.push(record);
        }
        Ok(out)
    }

    /// Adapts the iterator into a `Stream` that ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<KeyValue>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut iter = state?;
            match iter.next().await {
                Ok(Some(record)) => Some((Ok(record), Some(iter))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Wraps the iterator for consumption from a thread outside the runtime.
    ///
    /// Fails with `InvalidState` unless fetches run on a multi-thread
    /// runtime: `Handle::block_on` does not drive spawned tasks on a
    /// current-thread runtime, so the first wait would never finish.
    pub fn into_blocking(self) -> Result<BlockingRangeIterator> {
        let runtime = match &self.shared.executor {
            Some(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => handle.clone(),
            Some(_) => {
                return Err(RangeError::invalid_state(
                    "blocking range iteration requires a multi-thread Tokio runtime",
                ))
            }
            None => {
                return Err(RangeError::invalid_state(
                    "range iterator has no Tokio runtime to drive its fetches",
                ))
            }
        };
        Ok(BlockingRangeIterator {
            inner: self,
            runtime,
            done: false,
        })
    }
}

impl Drop for RangeIterator {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

impl std::fmt::Debug for RangeIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeIterator")
            .field("reverse", &self.shared.params.reverse)
            .field("row_limit", &self.shared.params.row_limit)
            .field("mode", &self.shared.params.mode)
            .finish_non_exhaustive()
    }
}

/// Blocking adapter over [`RangeIterator`].
///
/// Each `next` parks the calling thread until the record is available. Must
/// not be driven from inside an async task, and is only built over a
/// multi-thread runtime (see [`RangeIterator::into_blocking`]).
pub struct BlockingRangeIterator {
    inner: RangeIterator,
    runtime: Handle,
    done: bool,
}

impl BlockingRangeIterator {
    pub fn remove_last(&self) -> Result<()> {
        self.inner.remove_last()
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl Iterator for BlockingRangeIterator {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.runtime.block_on(self.inner.next()) {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
