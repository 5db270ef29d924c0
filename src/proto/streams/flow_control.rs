use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

use crate::frame::DEFAULT_INITIAL_WINDOW_SIZE;
use crate::proto::{WindowSize, MAX_WINDOW_SIZE};

/// Flow-control bookkeeping failures; call sites map these onto stream
/// or connection errors depending on which controller tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    /// The window sank below its permitted lower bound.
    WindowUnderflow,
    /// The window would exceed 2^31 - 1.
    WindowOverflow,
    /// More bytes returned than were ever consumed.
    ReturnedTooMany,
}

/// The receive-side controller: tracks how much the peer may still send,
/// how much of what arrived has been handed to the application, and when
/// to grant credit back with a WINDOW_UPDATE.
///
/// Not synchronized itself; owners wrap it in a mutex.
#[derive(Debug)]
pub struct RecvFlow {
    /// Credit currently extended to the peer. May sink below zero, but
    /// never below `lower_bound`.
    window: i64,

    /// Temporary negative bound tolerating frames already in flight
    /// after an INITIAL_WINDOW_SIZE shrink.
    lower_bound: i64,

    /// The initial window: the ceiling `window` is replenished towards.
    upper_bound: i64,

    /// `window` plus bytes consumed but not yet returned by the
    /// application.
    processed: i64,
}

impl RecvFlow {
    pub fn new(initial: WindowSize) -> RecvFlow {
        RecvFlow {
            window: initial as i64,
            lower_bound: 0,
            upper_bound: initial as i64,
            processed: initial as i64,
        }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    pub fn initial_window(&self) -> WindowSize {
        self.upper_bound as WindowSize
    }

    /// Bytes consumed by deliveries but not yet returned.
    pub fn consumed(&self) -> i64 {
        self.processed - self.window
    }

    /// Charges a received flow-controlled frame against the window.
    pub fn consume(&mut self, n: WindowSize) -> Result<(), FlowError> {
        if n == 0 {
            return Ok(());
        }

        self.window -= n as i64;
        if self.window < self.lower_bound {
            return Err(FlowError::WindowUnderflow);
        }
        Ok(())
    }

    /// Records `n` payload bytes handed to the application. When the
    /// accumulated returns pass half the initial window, the window is
    /// replenished and the increment to put in a WINDOW_UPDATE is
    /// returned.
    pub fn return_bytes(&mut self, n: WindowSize) -> Result<Option<WindowSize>, FlowError> {
        if self.processed - (n as i64) < self.window {
            return Err(FlowError::ReturnedTooMany);
        }
        self.processed -= n as i64;
        self.window_update()
    }

    fn window_update(&mut self) -> Result<Option<WindowSize>, FlowError> {
        if self.upper_bound <= 0 {
            return Ok(None);
        }

        // Grant once half the initial window has been returned; the
        // trade between update frequency and frame overhead.
        let threshold = self.upper_bound / 2;
        if self.processed > threshold {
            return Ok(None);
        }

        let delta = self.upper_bound - self.processed;
        self.update_window(delta)
            .map_err(|_| FlowError::ReturnedTooMany)?;

        tracing::trace!(
            "recv window replenished; delta={}; window={}",
            delta,
            self.window
        );

        Ok(Some(delta as WindowSize))
    }

    /// Applies an INITIAL_WINDOW_SIZE change of `delta` to this stream.
    /// The connection-level controller is exempt; callers skip it.
    pub fn increment_initial_window(&mut self, delta: i64) -> Result<(), FlowError> {
        self.update_window(delta)?;
        self.update_initial_window(delta);
        Ok(())
    }

    fn update_window(&mut self, delta: i64) -> Result<(), FlowError> {
        if delta > 0 && (MAX_WINDOW_SIZE as i64) - delta < self.window {
            return Err(FlowError::WindowOverflow);
        }
        self.window += delta;
        self.processed += delta;
        self.lower_bound = if delta < 0 { delta } else { 0 };
        Ok(())
    }

    fn update_initial_window(&mut self, delta: i64) {
        let mut n = self.upper_bound + delta;
        if n < DEFAULT_INITIAL_WINDOW_SIZE as i64 {
            n = DEFAULT_INITIAL_WINDOW_SIZE as i64;
        }
        if n > MAX_WINDOW_SIZE as i64 {
            n = MAX_WINDOW_SIZE as i64;
        }
        self.upper_bound = n;
    }
}

/// The send-side controller: remote-granted credit and the producer's
/// rendezvous point.
///
/// Credit accumulates in `window` until it turns positive, at which
/// point the whole amount is deposited into a single slot. A producer
/// awaiting credit takes the entire slot; abandoning the wait leaves
/// the deposit in place, and `cancel` reclaims it into the window.
#[derive(Debug)]
pub struct SendFlow {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    window: i64,
    slot: Option<WindowSize>,
    wakers: Vec<Waker>,
}

impl SendFlow {
    pub fn new(initial: WindowSize) -> SendFlow {
        SendFlow {
            inner: Mutex::new(Inner {
                window: initial as i64,
                slot: None,
                wakers: Vec::new(),
            }),
        }
    }

    /// The undeposited portion of the window.
    pub fn window(&self) -> i64 {
        self.inner.lock().unwrap().window
    }

    /// Adds `delta` credit. `reset` first reclaims any undelivered
    /// deposit, which is how INITIAL_WINDOW_SIZE changes retroactively
    /// adjust credit a producer has not yet claimed.
    pub fn increment_window(&self, delta: i64, reset: bool) -> Result<(), FlowError> {
        let mut inner = self.inner.lock().unwrap();

        if delta > 0 && (MAX_WINDOW_SIZE as i64) - delta < inner.window {
            return Err(FlowError::WindowOverflow);
        }

        if reset {
            if let Some(n) = inner.slot.take() {
                inner.window += n as i64;
            }
        }

        inner.window += delta;

        if inner.window <= 0 {
            return Ok(());
        }

        if inner.slot.is_none() {
            inner.slot = Some(inner.window as WindowSize);
            inner.window = 0;
            for waker in inner.wakers.drain(..) {
                waker.wake();
            }
        }

        Ok(())
    }

    /// Returns undelivered credit to the window after an abandoned
    /// await.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(n) = inner.slot.take() {
            inner.window += n as i64;
        }
    }

    pub fn poll_credit(&self, cx: &mut Context<'_>) -> Poll<WindowSize> {
        let mut inner = self.inner.lock().unwrap();

        if inner.slot.is_none() && inner.window > 0 {
            inner.slot = Some(inner.window as WindowSize);
            inner.window = 0;
        }

        if let Some(n) = inner.slot.take() {
            return Poll::Ready(n);
        }

        inner.wakers.push(cx.waker().clone());
        Poll::Pending
    }

    /// Awaits the next credit delivery, yielding the entire available
    /// amount.
    pub fn credit(&self) -> Credit<'_> {
        Credit { flow: self }
    }
}

pub struct Credit<'a> {
    flow: &'a SendFlow,
}

impl Future for Credit<'_> {
    type Output = WindowSize;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WindowSize> {
        self.flow.poll_credit(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    fn poll_credit(flow: &SendFlow) -> Poll<WindowSize> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        flow.poll_credit(&mut cx)
    }

    #[test]
    fn recv_consume_within_window() {
        let mut flow = RecvFlow::new(100);
        assert!(flow.consume(60).is_ok());
        assert_eq!(flow.window(), 40);
        assert!(flow.consume(40).is_ok());
        assert_eq!(flow.window(), 0);
        assert_eq!(flow.consume(1), Err(FlowError::WindowUnderflow));
    }

    #[test]
    fn recv_window_update_at_half() {
        let mut flow = RecvFlow::new(100);
        flow.consume(60).unwrap();

        // 40 of 60 returned: processed = 60, above the 50 threshold.
        assert_eq!(flow.return_bytes(40).unwrap(), None);

        // 20 more: processed = 40, at or below threshold, grant the
        // difference back up to the initial window.
        let update = flow.return_bytes(20).unwrap();
        assert_eq!(update, Some(60));
        assert_eq!(flow.window(), 100);
        assert_eq!(flow.consumed(), 0);
    }

    #[test]
    fn recv_return_more_than_consumed_fails() {
        let mut flow = RecvFlow::new(100);
        flow.consume(10).unwrap();
        assert_eq!(flow.return_bytes(11), Err(FlowError::ReturnedTooMany));
    }

    #[test]
    fn recv_initial_window_shrink_sets_lower_bound() {
        let mut flow = RecvFlow::new(65_535);
        flow.increment_initial_window(1_024 - 65_535).unwrap();
        assert_eq!(flow.window(), 1_024);
        assert_eq!(flow.lower_bound, -64_511);

        // In-flight frames may legally push the window negative down to
        // the lower bound.
        assert!(flow.consume(20_000).is_ok());
        assert_eq!(flow.window(), 1_024 - 20_000);
    }

    #[test]
    fn send_credit_is_delivered_whole() {
        let flow = SendFlow::new(100);
        assert_eq!(poll_credit(&flow), Poll::Ready(100));
        assert!(poll_credit(&flow).is_pending());

        flow.increment_window(30, false).unwrap();
        flow.increment_window(20, false).unwrap();
        assert_eq!(poll_credit(&flow), Poll::Ready(30));
        assert_eq!(poll_credit(&flow), Poll::Ready(20));
    }

    #[test]
    fn send_cancel_preserves_credit() {
        let flow = SendFlow::new(50);
        // Deposit happens on increment, before anyone waits.
        flow.increment_window(0, false).unwrap();
        flow.cancel();
        assert_eq!(flow.window(), 50);
        assert_eq!(poll_credit(&flow), Poll::Ready(50));
    }

    #[test]
    fn send_negative_window_blocks_delivery() {
        let flow = SendFlow::new(10);
        flow.increment_window(-30, true).unwrap();
        assert_eq!(flow.window(), -20);
        assert!(poll_credit(&flow).is_pending());

        flow.increment_window(25, false).unwrap();
        assert_eq!(poll_credit(&flow), Poll::Ready(5));
    }

    #[test]
    fn send_overflow_is_an_error() {
        let flow = SendFlow::new(MAX_WINDOW_SIZE);
        assert_eq!(
            flow.increment_window(1, false),
            Err(FlowError::WindowOverflow)
        );
    }

    #[test]
    fn send_reset_reclaims_the_deposit() {
        let flow = SendFlow::new(100);
        flow.increment_window(0, false).unwrap();
        // Slot holds 100; shrink by 40 must see all of it.
        flow.increment_window(-40, true).unwrap();
        assert_eq!(poll_credit(&flow), Poll::Ready(60));
    }
}
