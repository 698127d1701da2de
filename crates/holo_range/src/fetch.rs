//! One chunk fetch: request parameters, the pending reply, and its cancel
//! control.
//!
//! The transport seam is [`RangeTransaction`]: it turns a [`ScanRequest`] into
//! a [`PendingChunk`] and stages key clears. Everything else about the
//! transaction (read versions, conflict ranges, commit) stays behind it.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{RangeError, Result};
use crate::mode::StreamingMode;
use crate::pool::PooledBuffer;
use crate::selector::KeySelector;
use crate::wire::{read_summary, DecodedChunk};

/// Parameters of a single scan call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRequest {
    pub begin: KeySelector,
    pub end: KeySelector,
    /// Maximum rows for this call; 0 means unlimited.
    pub row_limit: usize,
    /// Byte budget hint for this call; 0 lets the store decide.
    pub target_bytes: usize,
    pub mode: StreamingMode,
    /// 1-based fetch counter within one iterator.
    pub iteration: u32,
    pub snapshot: bool,
    pub reverse: bool,
}

/// The transaction a range query reads through.
///
/// Implementations must be cheap to call from the fetch completion path and
/// must not block: `get_range` only starts the RPC.
pub trait RangeTransaction: Send + Sync + 'static {
    fn get_range(&self, request: ScanRequest) -> PendingChunk;

    /// Stages removal of `key`. Durable only once the transaction commits.
    fn clear(&self, key: &[u8]);
}

impl<T: RangeTransaction + ?Sized> RangeTransaction for Arc<T> {
    fn get_range(&self, request: ScanRequest) -> PendingChunk {
        (**self).get_range(request)
    }

    fn clear(&self, key: &[u8]) {
        (**self).clear(key)
    }
}

/// Decoded result of a completed fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    Chunk(DecodedChunk),
    /// The store returned no rows, so there is no key to continue from.
    Exhausted,
}

impl FetchOutcome {
    /// Decodes a raw reply. The buffer is released on every path that does
    /// not hand it to a chunk.
    pub fn decode(buffer: PooledBuffer) -> Result<Self> {
        let summary = read_summary(buffer.as_slice())?;
        if summary.key_count == 0 {
            return Ok(FetchOutcome::Exhausted);
        }
        DecodedChunk::decode(buffer).map(FetchOutcome::Chunk)
    }
}

type CancelHook = Box<dyn FnOnce() + Send + 'static>;

enum HandleState {
    Pending(Option<CancelHook>),
    Completed,
    Cancelled,
}

struct CancelInner {
    state: Mutex<HandleState>,
    token: CancellationToken,
}

/// Cancel control shared between a pending fetch and its owner.
///
/// The transport's hook runs at most once; cancelling twice, or after the
/// fetch completed, does nothing.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl CancelHandle {
    fn new(hook: Option<CancelHook>) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                state: Mutex::new(HandleState::Pending(hook)),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Returns true if this call cancelled a still-pending fetch.
    pub fn cancel(&self) -> bool {
        let hook = {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *state, HandleState::Cancelled) {
                HandleState::Pending(hook) => hook,
                other => {
                    *state = other;
                    return false;
                }
            }
        };
        self.inner.token.cancel();
        if let Some(hook) = hook {
            hook();
        }
        true
    }

    /// Marks the fetch complete; returns false if it was already cancelled.
    pub(crate) fn complete(&self) -> bool {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *state {
            HandleState::Pending(_) => {
                *state = HandleState::Completed;
                true
            }
            HandleState::Completed => true,
            HandleState::Cancelled => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Reply of an in-flight scan call.
pub struct PendingChunk {
    future: BoxFuture<'static, anyhow::Result<PooledBuffer>>,
    hook: Option<CancelHook>,
}

impl PendingChunk {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<PooledBuffer>> + Send + 'static,
    {
        Self {
            future: future.boxed(),
            hook: None,
        }
    }

    /// A reply that is already available.
    pub fn ready(result: anyhow::Result<PooledBuffer>) -> Self {
        Self::new(futures_util::future::ready(result))
    }

    /// Registers the transport's cancellation callback.
    pub fn on_cancel<H>(mut self, hook: H) -> Self
    where
        H: FnOnce() + Send + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Splits into the reply future and its cancel control.
    pub(crate) fn into_parts(self) -> (BoxFuture<'static, anyhow::Result<PooledBuffer>>, CancelHandle) {
        (self.future, CancelHandle::new(self.hook))
    }

    /// Waits for the reply and decodes it, without any iterator around it.
    pub async fn wait(self) -> Result<FetchOutcome> {
        let (future, handle) = self.into_parts();
        wait_parts(future, &handle).await
    }
}

impl fmt::Debug for PendingChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingChunk")
            .field("has_cancel_hook", &self.hook.is_some())
            .finish()
    }
}

/// Awaits `future` unless `handle` is cancelled first, then decodes.
pub(crate) async fn wait_parts(
    future: BoxFuture<'static, anyhow::Result<PooledBuffer>>,
    handle: &CancelHandle,
) -> Result<FetchOutcome> {
    let token = handle.token();
    let buffer = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(RangeError::Cancelled),
        res = future => res.map_err(RangeError::Transport)?,
    };
    if !handle.complete() {
        return Err(RangeError::Cancelled);
    }
    FetchOutcome::decode(buffer)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::pool::BufferPool;
    use crate::wire::ChunkWriter;

    fn counting_hook(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_runs_hook_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pending = PendingChunk::new(futures_util::future::pending()).on_cancel(counting_hook(&calls));
        let (_future, handle) = pending.into_parts();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_after_completion_is_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pending = PendingChunk::ready(Ok(PooledBuffer::standalone(Vec::new())))
            .on_cancel(counting_hook(&calls));
        let (_future, handle) = pending.into_parts();
        assert!(handle.complete());
        assert!(!handle.cancel());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_parts_resolve_to_cancelled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pending = PendingChunk::new(futures_util::future::pending()).on_cancel(counting_hook(&calls));
        let (future, handle) = pending.into_parts();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { wait_parts(future, &handle).await })
        };
        assert!(handle.cancel());
        let outcome = waiter.await.expect("join");
        assert!(matches!(outcome, Err(RangeError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_reply_resolves_to_exhausted() {
        let pool = BufferPool::default();
        let buffer = ChunkWriter::new(&pool, 8).finish(true);
        let outcome = PendingChunk::ready(Ok(buffer)).wait().await.expect("wait");
        assert!(matches!(outcome, FetchOutcome::Exhausted));
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn transport_error_is_wrapped() {
        let err = PendingChunk::ready(Err(anyhow::anyhow!("connection reset")))
            .wait()
            .await
            .expect_err("transport failure");
        assert!(matches!(err, RangeError::Transport(_)));
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn chunk_reply_decodes() {
        let pool = BufferPool::default();
        let mut writer = ChunkWriter::new(&pool, 32);
        writer.push(b"k", b"v");
        let outcome = PendingChunk::ready(Ok(writer.finish(false)))
            .wait()
            .await
            .expect("wait");
        match outcome {
            FetchOutcome::Chunk(chunk) => {
                assert_eq!(chunk.len(), 1);
                assert!(!chunk.has_more());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
