//! FIFO channels between logical threads.
//!
//! Values are delivered in send order. A send hands its value straight to the
//! oldest blocked receiver; otherwise it is buffered. Unbounded channels never
//! block the sender, bounded ones block while full. Blocked receivers and
//! blocked senders are each served first-come first-served.

use crate::cancel::CancelScope;
use crate::codec::{Payload, decode};
use crate::errors::{TrySendError, WorkflowError};
use crate::future::Selectable;
use crate::runtime::lock;
use crate::WorkflowContext;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

struct Waiter {
    ticket: u64,
    waker: Waker,
}

struct ChannelState<T> {
    buffer: VecDeque<T>,
    capacity: Option<usize>,
    closed: bool,
    next_ticket: u64,
    receivers: VecDeque<Waiter>,
    handoffs: BTreeMap<u64, T>,
    senders: VecDeque<Waiter>,
    watchers: Vec<Waker>,
}

impl<T> ChannelState<T> {
    fn has_space(&self) -> bool {
        self.capacity.is_none_or(|c| self.buffer.len() < c)
    }

    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Hand `value` to the oldest blocked receiver or buffer it; gives it back when full.
    fn deliver(&mut self, value: T, wakers: &mut Vec<Waker>) -> Result<(), T> {
        if let Some(r) = self.receivers.pop_front() {
            self.handoffs.insert(r.ticket, value);
            wakers.push(r.waker);
            return Ok(());
        }
        if self.has_space() {
            self.buffer.push_back(value);
            wakers.append(&mut self.watchers);
            return Ok(());
        }
        Err(value)
    }

    fn take(&mut self, wakers: &mut Vec<Waker>) -> Option<T> {
        let value = self.buffer.pop_front()?;
        if let Some(s) = self.senders.front() {
            wakers.push(s.waker.clone());
        }
        Some(value)
    }

    /// Return a value claimed by a receiver that went away before reading it.
    fn requeue_front(&mut self, value: T, wakers: &mut Vec<Waker>) {
        if let Some(r) = self.receivers.pop_front() {
            self.handoffs.insert(r.ticket, value);
            wakers.push(r.waker);
        } else {
            self.buffer.push_front(value);
            wakers.append(&mut self.watchers);
        }
    }

    fn update_waiter(queue: &mut VecDeque<Waiter>, ticket: u64, waker: &Waker) {
        if let Some(w) = queue.iter_mut().find(|w| w.ticket == ticket)
            && !w.waker.will_wake(waker)
        {
            w.waker = waker.clone();
        }
    }

    fn remove_waiter(queue: &mut VecDeque<Waiter>, ticket: u64) -> bool {
        let was_front = queue.front().is_some_and(|w| w.ticket == ticket);
        queue.retain(|w| w.ticket != ticket);
        was_front
    }
}

/// Typed FIFO queue shared by the logical threads of one instance.
pub struct Channel<T> {
    state: Arc<Mutex<ChannelState<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Channel")
            .field("buffered", &state.buffer.len())
            .field("capacity", &state.capacity)
            .field("closed", &state.closed)
            .field("blocked_receivers", &state.receivers.len())
            .field("blocked_senders", &state.senders.len())
            .finish()
    }
}

impl<T> Channel<T> {
    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState {
                buffer: VecDeque::new(),
                capacity,
                closed: false,
                next_ticket: 0,
                receivers: VecDeque::new(),
                handoffs: BTreeMap::new(),
                senders: VecDeque::new(),
                watchers: Vec::new(),
            })),
        }
    }

    pub(crate) fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// A capacity of zero is raised to one.
    pub(crate) fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    /// Send, waiting for space on a full bounded channel.
    ///
    /// Fails with `Generic` on a closed channel and with `Canceled` when `ctx`
    /// is cancelled while waiting.
    pub fn send<'a>(&'a self, ctx: &'a WorkflowContext, value: T) -> SendFuture<'a, T> {
        SendFuture {
            channel: self,
            scope: ctx.scope(),
            value: Some(value),
            ticket: None,
        }
    }

    /// Send without waiting.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut wakers = Vec::new();
        let result = {
            let mut state = lock(&self.state);
            if state.closed {
                Err(TrySendError::Closed(value))
            } else if !state.senders.is_empty() {
                Err(TrySendError::Full(value))
            } else {
                state.deliver(value, &mut wakers).map_err(TrySendError::Full)
            }
        };
        for w in wakers {
            w.wake();
        }
        result
    }

    /// Receive the next value.
    ///
    /// Resolves to `Ok(None)` once the channel is closed and drained, and to
    /// `Err(Canceled)` when `ctx` is cancelled first.
    pub fn receive<'a>(&'a self, ctx: &'a WorkflowContext) -> ReceiveFuture<'a, T> {
        ReceiveFuture {
            channel: self,
            scope: ctx.scope(),
            ticket: None,
        }
    }

    /// Take a buffered value if there is one.
    pub fn try_receive(&self) -> Option<T> {
        let mut wakers = Vec::new();
        let value = lock(&self.state).take(&mut wakers);
        for w in wakers {
            w.wake();
        }
        value
    }

    /// Close the channel. Buffered values stay receivable; blocked senders fail.
    pub fn close(&self) {
        let wakers = {
            let mut state = lock(&self.state);
            state.closed = true;
            let mut wakers: Vec<Waker> = state.receivers.drain(..).map(|w| w.waker).collect();
            wakers.extend(state.senders.iter().map(|w| w.waker.clone()));
            wakers.append(&mut state.watchers);
            wakers
        };
        for w in wakers {
            w.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        lock(&self.state).buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).buffer.is_empty()
    }
}

impl Channel<Payload> {
    /// Receive and decode the next payload, as used for signal channels.
    pub async fn receive_as<T: DeserializeOwned>(&self, ctx: &WorkflowContext) -> Result<Option<T>, WorkflowError> {
        match self.receive(ctx).await? {
            Some(payload) => Ok(Some(decode(ctx.data_converter().as_ref(), &payload)?)),
            None => Ok(None),
        }
    }
}

impl<T: Send> Selectable for Channel<T> {
    fn is_ready(&self) -> bool {
        let state = lock(&self.state);
        !state.buffer.is_empty() || state.closed
    }

    fn register_waker(&self, waker: &Waker) {
        let mut state = lock(&self.state);
        if !state.watchers.iter().any(|w| w.will_wake(waker)) {
            state.watchers.push(waker.clone());
        }
    }
}

/// Returned by [`Channel::receive`].
pub struct ReceiveFuture<'a, T> {
    channel: &'a Channel<T>,
    scope: &'a CancelScope,
    ticket: Option<u64>,
}

impl<T> Future for ReceiveFuture<'_, T> {
    type Output = Result<Option<T>, WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut wakers = Vec::new();
        let outcome = {
            let mut state = lock(&this.channel.state);
            match this.ticket {
                Some(ticket) => {
                    if let Some(v) = state.handoffs.remove(&ticket) {
                        this.ticket = None;
                        Some(Ok(Some(v)))
                    } else if state.closed {
                        ChannelState::<T>::remove_waiter(&mut state.receivers, ticket);
                        this.ticket = None;
                        Some(Ok(None))
                    } else if this.scope.is_cancelled() {
                        ChannelState::<T>::remove_waiter(&mut state.receivers, ticket);
                        this.ticket = None;
                        Some(Err(WorkflowError::canceled()))
                    } else {
                        ChannelState::<T>::update_waiter(&mut state.receivers, ticket, cx.waker());
                        None
                    }
                }
                None => {
                    if let Some(v) = state.take(&mut wakers) {
                        Some(Ok(Some(v)))
                    } else if state.closed {
                        Some(Ok(None))
                    } else if this.scope.is_cancelled() {
                        Some(Err(WorkflowError::canceled()))
                    } else {
                        let ticket = state.issue_ticket();
                        state.receivers.push_back(Waiter {
                            ticket,
                            waker: cx.waker().clone(),
                        });
                        this.ticket = Some(ticket);
                        None
                    }
                }
            }
        };
        for w in wakers {
            w.wake();
        }
        match outcome {
            Some(out) => Poll::Ready(out),
            None => {
                this.scope.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for ReceiveFuture<'_, T> {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        let mut wakers = Vec::new();
        {
            let mut state = lock(&self.channel.state);
            ChannelState::<T>::remove_waiter(&mut state.receivers, ticket);
            if let Some(v) = state.handoffs.remove(&ticket) {
                state.requeue_front(v, &mut wakers);
            }
        }
        for w in wakers {
            w.wake();
        }
    }
}

/// Returned by [`Channel::send`].
pub struct SendFuture<'a, T> {
    channel: &'a Channel<T>,
    scope: &'a CancelScope,
    value: Option<T>,
    ticket: Option<u64>,
}

// The pending value is moved out by value and never pinned.
impl<T> Unpin for SendFuture<'_, T> {}

impl<T> Future for SendFuture<'_, T> {
    type Output = Result<(), WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut wakers = Vec::new();
        let outcome = {
            let mut state = lock(&this.channel.state);
            let my_turn = match this.ticket {
                None => state.senders.is_empty(),
                Some(t) => state.senders.front().is_some_and(|w| w.ticket == t),
            };
            let attempt = if state.closed {
                if let Some(t) = this.ticket.take() {
                    ChannelState::<T>::remove_waiter(&mut state.senders, t);
                }
                Some(Err(WorkflowError::generic("send on closed channel")))
            } else if my_turn && let Some(value) = this.value.take() {
                match state.deliver(value, &mut wakers) {
                    Ok(()) => {
                        if let Some(t) = this.ticket.take() {
                            ChannelState::<T>::remove_waiter(&mut state.senders, t);
                        }
                        if state.has_space()
                            && let Some(next) = state.senders.front()
                        {
                            wakers.push(next.waker.clone());
                        }
                        Some(Ok(()))
                    }
                    Err(value) => {
                        this.value = Some(value);
                        None
                    }
                }
            } else {
                None
            };
            if attempt.is_none() {
                if this.scope.is_cancelled() {
                    if let Some(t) = this.ticket.take() {
                        let was_front = ChannelState::<T>::remove_waiter(&mut state.senders, t);
                        if was_front
                            && state.has_space()
                            && let Some(next) = state.senders.front()
                        {
                            wakers.push(next.waker.clone());
                        }
                    }
                    Some(Err(WorkflowError::canceled()))
                } else {
                    match this.ticket {
                        Some(t) => ChannelState::<T>::update_waiter(&mut state.senders, t, cx.waker()),
                        None => {
                            let t = state.issue_ticket();
                            state.senders.push_back(Waiter {
                                ticket: t,
                                waker: cx.waker().clone(),
                            });
                            this.ticket = Some(t);
                        }
                    }
                    None
                }
            } else {
                attempt
            }
        };
        for w in wakers {
            w.wake();
        }
        match outcome {
            Some(out) => Poll::Ready(out),
            None => {
                this.scope.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for SendFuture<'_, T> {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        let waker = {
            let mut state = lock(&self.channel.state);
            let was_front = ChannelState::<T>::remove_waiter(&mut state.senders, ticket);
            if was_front && state.has_space() {
                state.senders.front().map(|w| w.waker.clone())
            } else {
                None
            }
        };
        if let Some(w) = waker {
            w.wake();
        }
    }
}
