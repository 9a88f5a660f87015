//! Readiness gate and replay buffer.
//!
//! Sending is gated on the server assigning an identity. Receiving is never
//! gated, but handlers are usually registered a little after the socket
//! opens, so envelopes that arrive early are buffered and replayed to push
//! handlers registered later. Buffering stops one replay window after the
//! most recent ready-to-receive registration.
//!
//! Ready-to-send callbacks always pass through one FIFO queue. Whoever finds
//! the identity assigned and nobody else draining becomes the drainer and
//! runs callbacks one at a time until the queue is empty; later arrivals
//! join the queue behind the ones already waiting.

use std::collections::VecDeque;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::envelope::Envelope;
use crate::identity::ClientId;

pub(crate) type SendCallback = Box<dyn FnOnce(&ClientId) + Send + 'static>;

/// A received envelope kept for replay.
pub(crate) struct Buffered {
    pub envelope: Envelope,
    /// Registration that has already seen this envelope, if any.
    pub seen_by: Option<u64>,
}

pub(crate) struct Readiness {
    client_id: Option<ClientId>,
    send_queue: VecDeque<SendCallback>,
    draining: bool,
    buffering: bool,
    buffer: VecDeque<Buffered>,
    capacity: usize,
    stop_generation: u64,
    stop_timer: Option<JoinHandle<()>>,
}

impl Readiness {
    pub fn new(capacity: usize) -> Self {
        Self {
            client_id: None,
            send_queue: VecDeque::new(),
            draining: false,
            buffering: true,
            buffer: VecDeque::new(),
            capacity,
            stop_generation: 0,
            stop_timer: None,
        }
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        self.client_id.as_ref()
    }

    pub fn is_ready_to_send(&self) -> bool {
        self.client_id.is_some()
    }

    pub fn enqueue(&mut self, callback: SendCallback) {
        self.send_queue.push_back(callback);
    }

    /// Record the identity. Returns true if the caller must now drain the
    /// callbacks queued before it.
    pub fn assign(&mut self, id: ClientId) -> bool {
        self.client_id = Some(id);
        self.begin_drain()
    }

    /// Claim the queue for draining. False if there is nothing to run yet,
    /// or another caller is already draining.
    pub fn begin_drain(&mut self) -> bool {
        if self.client_id.is_none() || self.draining || self.send_queue.is_empty() {
            return false;
        }
        self.draining = true;
        true
    }

    /// Next callback for the drainer, oldest first. Returns `None` and
    /// releases the queue once it is empty.
    pub fn next_callback(&mut self) -> Option<(SendCallback, ClientId)> {
        let next = self
            .client_id
            .clone()
            .and_then(|id| self.send_queue.pop_front().map(|callback| (callback, id)));
        if next.is_none() {
            self.draining = false;
        }
        next
    }

    #[cfg(test)]
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    pub fn record(&mut self, envelope: Envelope, seen_by: Option<u64>) {
        if !self.buffering || self.capacity == 0 {
            return;
        }
        while self.buffer.len() >= self.capacity {
            if let Some(dropped) = self.buffer.pop_front() {
                debug!(command = %dropped.envelope.command, "replay buffer full, dropping oldest");
            }
        }
        self.buffer.push_back(Buffered { envelope, seen_by });
    }

    pub fn buffered_mut(&mut self) -> impl Iterator<Item = &mut Buffered> {
        self.buffer.iter_mut()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Start a new stop-buffering window, cancelling the previous one.
    /// Returns the generation the new timer must present to `stop`.
    pub fn rearm(&mut self) -> u64 {
        if let Some(timer) = self.stop_timer.take() {
            timer.abort();
        }
        self.stop_generation += 1;
        self.stop_generation
    }

    pub fn set_stop_timer(&mut self, timer: JoinHandle<()>) {
        self.stop_timer = Some(timer);
    }

    /// Stop buffering if no newer window has been armed since `generation`.
    pub fn stop(&mut self, generation: u64) -> bool {
        if generation != self.stop_generation || !self.buffering {
            return false;
        }
        self.buffering = false;
        self.buffer.clear();
        self.stop_timer = None;
        true
    }

    /// Tear down on channel close. Queued callbacks are dropped unrun.
    pub fn shutdown(&mut self) {
        self.send_queue.clear();
        self.draining = false;
        self.buffering = false;
        self.buffer.clear();
        if let Some(timer) = self.stop_timer.take() {
            timer.abort();
        }
    }
}
