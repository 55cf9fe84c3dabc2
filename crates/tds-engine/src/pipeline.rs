//! Result pipeline.
//!
//! A response is a flat token stream. The driver turns it into a queue of
//! [`Item`]s: segments, per-result errors and the Done-family boundaries
//! between results. Consumers see it as two nested streams:
//!
//! - [`QueryResults`] yields one [`QueryResult`] per result;
//! - each [`QueryResult`] yields the [`Segment`]s of that result.
//!
//! At most one `QueryResult` is active at a time. The slot is claimed with a
//! compare-and-swap on the result id, so only the claimant emits the new
//! result. Demand is bridged back to the driver as credits: a consumer that
//! finds the queue empty requests one, and the driver reads from the socket
//! only while credit is outstanding.
//!
//! Dropping a `QueryResult` detaches it; the rest of that result is skipped
//! and later results still arrive. Dropping `QueryResults` cancels the
//! request: the driver sends an attention signal and discards the remainder.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures_core::Stream;
use parking_lot::Mutex;
use tds_protocol::{ColMetaData, Done, ReturnValue, RowData};
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// One row: undecoded column values and the metadata describing them.
///
/// Values are the raw bytes of each column; `None` is SQL NULL. Decoding
/// them into typed values is left to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<ColMetaData>,
    values: Vec<Option<Bytes>>,
}

impl Row {
    pub(crate) fn new(columns: Arc<ColMetaData>, row: RowData) -> Self {
        Self {
            columns,
            values: row.values,
        }
    }

    /// Column metadata of the result set.
    #[must_use]
    pub fn columns(&self) -> &Arc<ColMetaData> {
        &self.columns
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value at `index`. `Some(None)` is SQL NULL.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Option<&Bytes>> {
        self.values.get(index).map(Option::as_ref)
    }

    /// Raw value of the column called `name`.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<Option<&Bytes>> {
        let index = self
            .columns
            .columns
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name))?;
        self.get(index)
    }

    /// All raw values in column order.
    #[must_use]
    pub fn values(&self) -> &[Option<Bytes>] {
        &self.values
    }

    /// Take the raw values.
    #[must_use]
    pub fn into_values(self) -> Vec<Option<Bytes>> {
        self.values
    }
}

/// A piece of one result.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Segment {
    /// A data row.
    Row(Row),
    /// Rows affected by the statement.
    UpdateCount(u64),
    /// Output parameters of a procedure call.
    OutParams(Vec<ReturnValue>),
    /// Return status of a procedure call.
    ReturnStatus(i32),
}

impl Segment {
    /// The row, if this is a row segment.
    #[must_use]
    pub fn as_row(&self) -> Option<&Row> {
        match self {
            Self::Row(row) => Some(row),
            _ => None,
        }
    }

    /// The update count, if this is an update count segment.
    #[must_use]
    pub fn update_count(&self) -> Option<u64> {
        match self {
            Self::UpdateCount(count) => Some(*count),
            _ => None,
        }
    }
}

/// Entry in a pipeline's queue.
#[derive(Debug)]
pub(crate) enum Item {
    Segment(Segment),
    /// Non-fatal server error; aborts the result it belongs to.
    Error(Error),
    /// Done-family boundary.
    End { more: bool },
}

/// Builds segments from result tokens.
///
/// Output parameters arrive as separate RETURNVALUE tokens and are held
/// until the Done-family token that closes the statement.
#[derive(Debug, Default)]
pub(crate) struct SegmentBuilder {
    out_params: Vec<ReturnValue>,
}

impl SegmentBuilder {
    pub(crate) fn return_value(&mut self, value: ReturnValue) {
        self.out_params.push(value);
    }

    /// Items produced by a Done-family token: buffered output parameters or
    /// else the row count, then the boundary.
    pub(crate) fn done(&mut self, done: &Done) -> Vec<Item> {
        let mut items = Vec::with_capacity(2);
        if !self.out_params.is_empty() {
            let params = std::mem::take(&mut self.out_params);
            items.push(Item::Segment(Segment::OutParams(params)));
        } else if let Some(count) = done.count() {
            items.push(Item::Segment(Segment::UpdateCount(count)));
        }
        items.push(Item::End {
            more: done.has_more(),
        });
        items
    }
}

#[derive(Debug, Default)]
struct PipelineState {
    items: VecDeque<Item>,
    /// Skip items up to the next boundary: the current result was detached
    /// or aborted by an error.
    discarding: bool,
    /// The final boundary was consumed.
    complete: bool,
    /// The driver will push nothing more.
    finished: bool,
    /// The outer stream was dropped.
    cancelled: bool,
    failure: Option<Error>,
    inner_failed: bool,
    outer_failed: bool,
    emitted: usize,
    outer_waker: Option<Waker>,
    inner_waker: Option<Waker>,
}

impl PipelineState {
    fn take_wakers(&mut self) -> [Option<Waker>; 2] {
        [self.outer_waker.take(), self.inner_waker.take()]
    }
}

fn wake_all(wakers: [Option<Waker>; 2]) {
    for waker in wakers.into_iter().flatten() {
        waker.wake();
    }
}

/// State shared by the driver and the consumer streams of one request.
#[derive(Debug)]
pub(crate) struct PipelineShared {
    state: Mutex<PipelineState>,
    /// Id of the active result, 0 when none.
    active: AtomicU64,
    next_result: AtomicU64,
    credits: AtomicU64,
    wake: Arc<Notify>,
}

impl PipelineShared {
    /// A pipeline whose demand wakes the driver through `wake`.
    pub(crate) fn new(wake: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PipelineState::default()),
            active: AtomicU64::new(0),
            next_result: AtomicU64::new(1),
            credits: AtomicU64::new(0),
            wake,
        })
    }

    /// Raise outstanding demand to at least `n` items.
    fn request(&self, n: u64) {
        if self.credits.fetch_max(n, Ordering::AcqRel) == 0 {
            self.wake.notify_one();
        }
    }

    /// Whether a consumer is waiting for data.
    pub(crate) fn has_demand(&self) -> bool {
        self.credits.load(Ordering::Acquire) > 0
    }

    pub(crate) fn push(&self, item: Item) {
        let wakers = {
            let mut state = self.state.lock();
            if state.cancelled || state.finished {
                return;
            }
            state.items.push_back(item);
            state.take_wakers()
        };
        let _ = self
            .credits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        wake_all(wakers);
    }

    /// The response is over; nothing more will be pushed.
    pub(crate) fn finish(&self) {
        let wakers = {
            let mut state = self.state.lock();
            state.finished = true;
            state.take_wakers()
        };
        wake_all(wakers);
    }

    /// End the pipeline with `error`. Items already queued stay deliverable.
    pub(crate) fn fail(&self, error: Error) {
        let wakers = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.failure = Some(error);
            state.finished = true;
            state.take_wakers()
        };
        wake_all(wakers);
    }

    /// Whether the consumer dropped the outer stream.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Whether the consumer is done with this request: every result was
    /// consumed, or the outer stream was dropped.
    pub(crate) fn is_settled(&self) -> bool {
        let state = self.state.lock();
        state.cancelled || state.complete || (state.finished && state.items.is_empty())
    }

    /// Release the active slot held by `id`, returning the outer waker.
    fn release(&self, state: &mut PipelineState, id: u64) -> Option<Waker> {
        let _ = self
            .active
            .compare_exchange(id, 0, Ordering::AcqRel, Ordering::Acquire);
        state.outer_waker.take()
    }
}

/// Stream of the results of one request.
///
/// Each item is a [`QueryResult`], or the error that ended the request.
/// The previous `QueryResult` must be consumed or dropped before the next
/// one is produced.
#[derive(Debug)]
#[must_use = "dropping the results cancels the request"]
pub struct QueryResults {
    shared: Arc<PipelineShared>,
}

impl QueryResults {
    pub(crate) fn new(shared: Arc<PipelineShared>) -> Self {
        Self { shared }
    }
}

impl Stream for QueryResults {
    type Item = Result<QueryResult>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        loop {
            if state.complete {
                return Poll::Ready(None);
            }
            if shared.active.load(Ordering::Acquire) != 0 {
                // Demand belongs to the active result until it is released.
                state.outer_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }

            if state.discarding {
                match state.items.pop_front() {
                    Some(Item::End { more }) => {
                        state.discarding = false;
                        state.complete = !more;
                    }
                    Some(_) => {}
                    None if state.finished => state.discarding = false,
                    None => {
                        state.outer_waker = Some(cx.waker().clone());
                        drop(state);
                        shared.request(1);
                        return Poll::Pending;
                    }
                }
                continue;
            }

            let boundary = state.items.front().map(|item| match item {
                Item::End { more } => Some(*more),
                _ => None,
            });
            match boundary {
                // An empty intermediate result is not surfaced.
                Some(Some(true)) => {
                    state.items.pop_front();
                }
                Some(Some(false)) if state.emitted > 0 => {
                    state.items.pop_front();
                    state.complete = true;
                }
                Some(_) => {
                    let id = shared.next_result.fetch_add(1, Ordering::Relaxed);
                    if shared
                        .active
                        .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        state.outer_waker = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                    state.emitted += 1;
                    tracing::trace!(result = state.emitted, "result started");
                    return Poll::Ready(Some(Ok(QueryResult {
                        shared: Arc::clone(shared),
                        id,
                        done: false,
                    })));
                }
                None => {
                    if let Some(error) = &state.failure {
                        if state.outer_failed {
                            return Poll::Ready(None);
                        }
                        let error = error.clone();
                        state.outer_failed = true;
                        return Poll::Ready(Some(Err(error)));
                    }
                    if state.finished {
                        state.complete = true;
                        return Poll::Ready(None);
                    }
                    state.outer_waker = Some(cx.waker().clone());
                    drop(state);
                    shared.request(1);
                    return Poll::Pending;
                }
            }
        }
    }
}

impl Drop for QueryResults {
    fn drop(&mut self) {
        let wakers = {
            let mut state = self.shared.state.lock();
            if state.complete || state.cancelled {
                return;
            }
            state.cancelled = true;
            state.items.clear();
            state.take_wakers()
        };
        tracing::debug!("results dropped before completion; cancelling request");
        wake_all(wakers);
        self.shared.wake.notify_one();
    }
}

/// The segments of one result.
#[derive(Debug)]
pub struct QueryResult {
    shared: Arc<PipelineShared>,
    id: u64,
    done: bool,
}

impl Stream for QueryResult {
    type Item = Result<Segment>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        let shared = Arc::clone(&this.shared);
        let mut state = shared.state.lock();
        if state.cancelled {
            this.done = true;
            return Poll::Ready(None);
        }

        let (output, outer) = match state.items.pop_front() {
            Some(Item::Segment(segment)) => return Poll::Ready(Some(Ok(segment))),
            Some(Item::Error(error)) => {
                state.discarding = true;
                (Some(Err(error)), shared.release(&mut state, this.id))
            }
            Some(Item::End { more }) => {
                state.complete = !more;
                (None, shared.release(&mut state, this.id))
            }
            None => {
                if let Some(error) = &state.failure {
                    let error = (!state.inner_failed).then(|| error.clone());
                    state.inner_failed = true;
                    (error.map(Err), shared.release(&mut state, this.id))
                } else if state.finished {
                    (None, shared.release(&mut state, this.id))
                } else {
                    state.inner_waker = Some(cx.waker().clone());
                    drop(state);
                    shared.request(1);
                    return Poll::Pending;
                }
            }
        };

        drop(state);
        this.done = true;
        if let Some(waker) = outer {
            waker.wake();
        }
        Poll::Ready(output)
    }
}

impl Drop for QueryResult {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let outer = {
            let mut state = self.shared.state.lock();
            if !state.cancelled {
                state.discarding = true;
            }
            self.shared.release(&mut state, self.id)
        };
        if let Some(waker) = outer {
            waker.wake();
        }
    }
}
