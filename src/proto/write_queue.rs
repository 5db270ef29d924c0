use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

use crate::frame::Frame;

/// The outbound frame FIFO shared by the reader task (control frames),
/// producer tasks (DATA and HEADERS) and the writer task.
///
/// Control frames jump to the head and are never subject to the bound:
/// the reader must not suspend while emitting WINDOW_UPDATE, RST_STREAM
/// or a SETTINGS ACK. Producer frames are tail-enqueued and blocked on
/// capacity for back-pressure. Among themselves, both classes keep FIFO
/// order.
#[derive(Debug)]
pub struct WriteQueue {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    ctrl: VecDeque<Frame>,
    data: VecDeque<Frame>,
    capacity: usize,
    /// No further input is accepted; the writer drains what is queued
    /// and then observes the end.
    finished: bool,
    consumer: Option<Waker>,
    producers: Vec<Waker>,
}

/// The queue refused the frame because the connection is shutting down.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueClosed;

impl WriteQueue {
    pub fn new(capacity: usize) -> WriteQueue {
        WriteQueue {
            inner: Mutex::new(Inner {
                ctrl: VecDeque::new(),
                data: VecDeque::new(),
                capacity,
                finished: false,
                consumer: None,
                producers: Vec::new(),
            }),
        }
    }

    /// Enqueues a control frame at the head of the queue. Never blocks.
    /// Frames offered after shutdown are dropped.
    pub fn push_ctrl(&self, frame: Frame) {
        let mut inner = self.inner.lock().unwrap();
        if inner.finished {
            tracing::trace!("dropping control frame after shutdown; frame={:?}", frame);
            return;
        }
        inner.ctrl.push_back(frame);
        if let Some(waker) = inner.consumer.take() {
            waker.wake();
        }
    }

    pub fn poll_push(&self, cx: &mut Context<'_>, frame: &mut Option<Frame>) -> Poll<Result<(), QueueClosed>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.finished {
            return Poll::Ready(Err(QueueClosed));
        }
        if inner.data.len() >= inner.capacity {
            inner.producers.push(cx.waker().clone());
            return Poll::Pending;
        }
        let frame = frame.take().expect("polled after completion");
        inner.data.push_back(frame);
        if let Some(waker) = inner.consumer.take() {
            waker.wake();
        }
        Poll::Ready(Ok(()))
    }

    /// Tail-enqueues a producer frame, waiting for capacity.
    pub fn push(&self, frame: Frame) -> Push<'_> {
        Push {
            queue: self,
            frame: Some(frame),
        }
    }

    pub fn poll_next(&self, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(frame) = inner.ctrl.pop_front() {
            return Poll::Ready(Some(frame));
        }
        if let Some(frame) = inner.data.pop_front() {
            for waker in inner.producers.drain(..) {
                waker.wake();
            }
            return Poll::Ready(Some(frame));
        }
        if inner.finished {
            return Poll::Ready(None);
        }

        inner.consumer = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Stops accepting input. Already-queued frames still drain.
    pub fn finish(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.finished = true;
        if let Some(waker) = inner.consumer.take() {
            waker.wake();
        }
        for waker in inner.producers.drain(..) {
            waker.wake();
        }
    }

}

pub struct Push<'a> {
    queue: &'a WriteQueue,
    frame: Option<Frame>,
}

impl Future for Push<'_> {
    type Output = Result<(), QueueClosed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.get_mut();
        me.queue.poll_push(cx, &mut me.frame)
    }
}
