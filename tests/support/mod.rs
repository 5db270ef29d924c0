//! An in-memory stand-in for the frame codec: tests feed decoded
//! frames in and collect what the engine writes out, driving the
//! reader and writer futures by hand so every step is deterministic.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::task::noop_waker;
use weft::frame::Frame;
use weft::{Connection, Error, FrameWrite, RecvError};

#[derive(Default)]
struct PipeInner {
    inbound: VecDeque<Result<Frame, RecvError>>,
    eof: bool,
    sent: Vec<Frame>,
}

/// Both halves of the codec seam, sharing one buffer set.
#[derive(Clone, Default)]
pub struct Pipe {
    inner: Arc<Mutex<PipeInner>>,
}

impl Pipe {
    pub fn new() -> Pipe {
        Pipe::default()
    }

    pub fn feed(&self, frame: impl Into<Frame>) {
        self.inner.lock().unwrap().inbound.push_back(Ok(frame.into()));
    }

    pub fn feed_err(&self, err: RecvError) {
        self.inner.lock().unwrap().inbound.push_back(Err(err));
    }

    pub fn eof(&self) {
        self.inner.lock().unwrap().eof = true;
    }

    pub fn reader(&self) -> Reader {
        Reader {
            inner: self.inner.clone(),
        }
    }

    pub fn writer(&self) -> Writer {
        Writer {
            inner: self.inner.clone(),
        }
    }

    /// Everything written since the last call.
    pub fn take_sent(&self) -> Vec<Frame> {
        std::mem::take(&mut self.inner.lock().unwrap().sent)
    }
}

pub struct Reader {
    inner: Arc<Mutex<PipeInner>>,
}

impl futures_core::Stream for Reader {
    type Item = Result<Frame, RecvError>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.inbound.pop_front() {
            return Poll::Ready(Some(item));
        }
        if inner.eof {
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

pub struct Writer {
    inner: Arc<Mutex<PipeInner>>,
}

impl FrameWrite for Writer {
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn buffer(&mut self, frame: Frame) -> io::Result<()> {
        self.inner.lock().unwrap().sent.push(frame);
        Ok(())
    }

    fn poll_flush(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = Result<(), Error>>>>;

/// A connection wired to a [`Pipe`], with its reader and writer tasks
/// held as futures the test advances explicitly.
pub struct Harness {
    pub conn: Connection,
    pub pipe: Pipe,
    run: Option<TaskFuture>,
    flush: Option<TaskFuture>,
    /// Set once the reader task finishes.
    pub run_result: Option<Result<(), Error>>,
    /// Set once the writer task finishes.
    pub flush_result: Option<Result<(), Error>>,
}

impl Harness {
    pub fn new(conn: Connection) -> Harness {
        let pipe = Pipe::new();

        let run: TaskFuture = {
            let conn = conn.clone();
            let reader = pipe.reader();
            Box::pin(async move { conn.run(reader).await })
        };
        let flush: TaskFuture = {
            let conn = conn.clone();
            let writer = pipe.writer();
            Box::pin(async move { conn.flush(writer).await })
        };

        let mut harness = Harness {
            conn,
            pipe,
            run: Some(run),
            flush: Some(flush),
            run_result: None,
            flush_result: None,
        };
        // Flush the opening SETTINGS so tests start from a quiet wire.
        harness.turn();
        harness.pipe.take_sent();
        harness
    }

    /// Polls the reader until it runs out of input, then the writer.
    pub fn turn(&mut self) {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        if let Some(fut) = self.run.as_mut() {
            if let Poll::Ready(res) = fut.as_mut().poll(&mut cx) {
                self.run_result = Some(res);
                self.run = None;
            }
        }
        if let Some(fut) = self.flush.as_mut() {
            if let Poll::Ready(res) = fut.as_mut().poll(&mut cx) {
                self.flush_result = Some(res);
                self.flush = None;
            }
        }
    }

    pub fn feed(&mut self, frame: impl Into<Frame>) {
        self.pipe.feed(frame);
        self.turn();
    }

    /// The reason the reader task died with, if it has.
    pub fn run_error_reason(&self) -> Option<weft::Reason> {
        match self.run_result {
            Some(Err(ref err)) => err.reason(),
            _ => None,
        }
    }

    /// Frames the engine emitted since the last look.
    pub fn sent(&mut self) -> Vec<Frame> {
        self.turn();
        self.pipe.take_sent()
    }
}

/// Polls a future once with a no-op waker.
pub fn poll_once<F, T>(fut: &mut Pin<Box<F>>) -> Poll<T>
where
    F: Future<Output = T> + ?Sized,
{
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    fut.as_mut().poll(&mut cx)
}

/// Sum of DATA payload lengths in `frames`.
pub fn data_bytes(frames: &[Frame]) -> usize {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Data(data) => Some(data.payload().len()),
            _ => None,
        })
        .sum()
}

pub fn data_frames(frames: &[Frame]) -> Vec<&weft::frame::Data> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Data(data) => Some(data),
            _ => None,
        })
        .collect()
}
