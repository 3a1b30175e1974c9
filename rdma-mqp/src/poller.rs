//! Completion demultiplexer for a CQ shared by many QPs.
//!
//! Every work request is posted with `wr_id` set to its QP's index, so a
//! completion names its origin without a CQ per QP. [`Completions`] is a lazy
//! sequence over the shared CQ: each item is one attributed completion, and
//! the sequence ends after the requested count, on the first failed status,
//! or when the deadline passes.

use std::time::{Duration, Instant};

use crate::cq::CompletionQueue;
use crate::wc::WorkCompletion;
use crate::{Error, Result};

/// Default bound on how long a poll may spin.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Polls a shared CQ for a fixed number of completions.
#[derive(Debug, Clone, Copy)]
pub struct CompletionPoller<'a> {
    cq: &'a CompletionQueue,
    timeout: Duration,
    num_tags: Option<usize>,
}

impl<'a> CompletionPoller<'a> {
    pub fn new(cq: &'a CompletionQueue) -> Self {
        Self {
            cq,
            timeout: DEFAULT_POLL_TIMEOUT,
            num_tags: None,
        }
    }

    /// Give up after `timeout` of wall-clock time.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reject completions whose tag is not a QP index below `n`.
    pub fn tags(mut self, n: usize) -> Self {
        self.num_tags = Some(n);
        self
    }

    /// A lazy sequence of exactly `expected` completions.
    pub fn completions(&self, expected: usize) -> Completions<'a> {
        Completions {
            cq: self.cq,
            timeout: self.timeout,
            num_tags: self.num_tags,
            expected,
            received: 0,
            start: Instant::now(),
            done: expected == 0,
        }
    }

    /// Wait for `expected` completions and return all of them in dequeue order.
    pub fn poll(&self, expected: usize) -> Result<Vec<WorkCompletion>> {
        self.completions(expected).collect()
    }
}

/// Iterator returned by [`CompletionPoller::completions`].
///
/// Yields `Ok` for each successful completion and at most one `Err`, after
/// which it is exhausted.
#[derive(Debug)]
pub struct Completions<'a> {
    cq: &'a CompletionQueue,
    timeout: Duration,
    num_tags: Option<usize>,
    expected: usize,
    received: usize,
    start: Instant,
    done: bool,
}

impl Completions<'_> {
    /// Completions consumed so far.
    pub fn received(&self) -> usize {
        self.received
    }

    fn fail(&mut self, err: Error) -> Option<Result<WorkCompletion>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for Completions<'_> {
    type Item = Result<WorkCompletion>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut wc = [WorkCompletion::default(); 1];
        loop {
            let n = match self.cq.poll(&mut wc) {
                Ok(n) => n,
                Err(e) => return self.fail(e),
            };
            if n > 0 {
                let wc = wc[0];
                self.received += 1;
                if !wc.is_success() {
                    tracing::error!("completion failed: {wc:?}");
                    return self.fail(Error::WorkCompletion {
                        tag: wc.wr_id(),
                        status: wc.status(),
                        vendor_err: wc.vendor_err(),
                    });
                }
                if let Some(num_tags) = self.num_tags
                    && wc.tag() >= num_tags
                {
                    return self.fail(Error::UnknownTag {
                        tag: wc.wr_id(),
                        num_tags,
                    });
                }
                if self.received == self.expected {
                    self.done = true;
                }
                return Some(Ok(wc));
            }

            let elapsed = self.start.elapsed();
            if elapsed > self.timeout {
                return self.fail(Error::PollTimeout {
                    expected: self.expected,
                    received: self.received,
                    elapsed,
                });
            }
            std::hint::spin_loop();
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            (0, Some(0))
        } else {
            (0, Some(self.expected - self.received + 1))
        }
    }
}
