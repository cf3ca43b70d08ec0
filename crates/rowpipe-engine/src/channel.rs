//! Bounded row channels between transform instances.
//!
//! Every consuming instance owns one bounded `mpsc` queue. Each upstream
//! instance holds a sender to it, so fan-in is many producers on one queue
//! and end of input is reached once every producer has sent
//! [`Frame::EndStream`] (or dropped its sender).
//!
//! Instances run on blocking threads. Pull and push try the queue first
//! and only suspend when it is empty or full; while suspended they race the
//! pipeline [`CancellationToken`], so a stop request releases a blocked
//! instance immediately.

use std::sync::Arc;

use rowpipe_types::schema::RowSchema;
use rowpipe_types::value::Row;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_util::sync::CancellationToken;

/// Message carried on a row channel.
#[derive(Debug)]
pub enum Frame {
    /// A row together with the layout it conforms to.
    Row(Arc<RowSchema>, Row),
    /// One producer has no more rows.
    EndStream,
}

/// Result of [`RowReceiver::pull`].
#[derive(Debug)]
pub enum Pulled {
    Row(Arc<RowSchema>, Row),
    /// Every producer finished.
    End,
    Cancelled,
}

/// Result of a push to downstream steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Sent,
    Cancelled,
    /// The consumer is gone; it only drops its receiver after stopping.
    Closed,
}

/// Create a bounded channel with room for `capacity` rows.
#[must_use]
pub fn row_channel(capacity: usize, producers: usize) -> (mpsc::Sender<Frame>, RowReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, RowReceiver::new(rx, producers))
}

/// Consuming end of a row channel.
#[derive(Debug)]
pub struct RowReceiver {
    rx: mpsc::Receiver<Frame>,
    producers: usize,
    finished: usize,
}

impl RowReceiver {
    #[must_use]
    pub fn new(rx: mpsc::Receiver<Frame>, producers: usize) -> Self {
        Self {
            rx,
            producers,
            finished: 0,
        }
    }

    /// Take the next row, suspending while the queue is empty.
    ///
    /// Must be called from a blocking thread inside the runtime.
    pub fn pull(&mut self, cancel: &CancellationToken) -> Pulled {
        loop {
            if cancel.is_cancelled() {
                return Pulled::Cancelled;
            }
            if self.finished >= self.producers {
                return Pulled::End;
            }
            let frame = match self.rx.try_recv() {
                Ok(frame) => Some(frame),
                Err(TryRecvError::Disconnected) => None,
                Err(TryRecvError::Empty) => {
                    let rx = &mut self.rx;
                    let waited = Handle::current().block_on(async {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => Err(()),
                            frame = rx.recv() => Ok(frame),
                        }
                    });
                    match waited {
                        Ok(frame) => frame,
                        Err(()) => return Pulled::Cancelled,
                    }
                }
            };
            match frame {
                Some(Frame::Row(schema, row)) => return Pulled::Row(schema, row),
                Some(Frame::EndStream) => self.finished += 1,
                None => return Pulled::End,
            }
        }
    }
}

/// All copies of one downstream step, fed round-robin.
#[derive(Debug)]
pub struct Downstream {
    step: String,
    copies: Vec<mpsc::Sender<Frame>>,
    next: usize,
}

impl Downstream {
    #[must_use]
    pub fn new(step: impl Into<String>, copies: Vec<mpsc::Sender<Frame>>) -> Self {
        Self {
            step: step.into(),
            copies,
            next: 0,
        }
    }

    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }

    fn send_row(&mut self, frame: Frame, cancel: &CancellationToken) -> Pushed {
        if self.copies.is_empty() {
            return Pushed::Closed;
        }
        let idx = self.next % self.copies.len();
        self.next = self.next.wrapping_add(1);
        send(&self.copies[idx], frame, cancel)
    }

    fn send_end(&self, cancel: &CancellationToken) -> Pushed {
        for tx in &self.copies {
            let pushed = send(tx, Frame::EndStream, cancel);
            if pushed == Pushed::Cancelled {
                return pushed;
            }
        }
        Pushed::Sent
    }
}

fn send(tx: &mpsc::Sender<Frame>, frame: Frame, cancel: &CancellationToken) -> Pushed {
    if cancel.is_cancelled() {
        return Pushed::Cancelled;
    }
    match tx.try_send(frame) {
        Ok(()) => Pushed::Sent,
        Err(TrySendError::Closed(_)) => Pushed::Closed,
        Err(TrySendError::Full(frame)) => Handle::current().block_on(async {
            tokio::select! {
                biased;
                () = cancel.cancelled() => Pushed::Cancelled,
                sent = tx.send(frame) => match sent {
                    Ok(()) => Pushed::Sent,
                    Err(_) => Pushed::Closed,
                },
            }
        }),
    }
}

/// Producing side of an instance: every downstream step it feeds.
///
/// Each row goes to every downstream step (copied for all but the last)
/// and to one copy of each step.
#[derive(Debug, Default)]
pub struct RowOutput {
    downstreams: Vec<Downstream>,
}

impl RowOutput {
    #[must_use]
    pub fn new(downstreams: Vec<Downstream>) -> Self {
        Self { downstreams }
    }

    /// Output with no consumers; rows pushed to it are discarded.
    #[must_use]
    pub fn terminal() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.downstreams.is_empty()
    }

    pub fn steps(&self) -> impl Iterator<Item = &str> {
        self.downstreams.iter().map(Downstream::step)
    }

    /// Push one row, suspending while a downstream queue is full.
    pub fn push(&mut self, schema: &Arc<RowSchema>, row: Row, cancel: &CancellationToken) -> Pushed {
        if cancel.is_cancelled() {
            return Pushed::Cancelled;
        }
        let Some((last, rest)) = self.downstreams.split_last_mut() else {
            return Pushed::Sent;
        };
        for downstream in rest {
            let pushed = downstream.send_row(Frame::Row(Arc::clone(schema), row.clone()), cancel);
            if pushed != Pushed::Sent {
                return pushed;
            }
        }
        last.send_row(Frame::Row(Arc::clone(schema), row), cancel)
    }

    /// Tell every downstream copy that this producer is done.
    pub fn end(&mut self, cancel: &CancellationToken) -> Pushed {
        for downstream in &self.downstreams {
            if downstream.send_end(cancel) == Pushed::Cancelled {
                return Pushed::Cancelled;
            }
        }
        Pushed::Sent
    }

    /// Drop every sender.
    pub fn close(&mut self) {
        self.downstreams.clear();
    }
}
