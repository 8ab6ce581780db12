//! # Bus Port
//!
//! All axes share one bus, but each axis controller waits for replies addressed to itself. The
//! port owns the bus and sorts every received frame into a bounded per-node inbox, so a frame
//! read while waiting on one axis is still there when another axis looks for it.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::eqpt::bus::{BusCommand, BusFrame, BusMessage, NodeId};
use log::{debug, trace};
use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use super::{send_with_backoff, BackoffPolicy, BusError, MotorBus, SendOutcome};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct BusPort<B: MotorBus> {
    bus: B,

    backoff: BackoffPolicy,

    /// Decoded messages from each known node which nobody has consumed yet
    inboxes: HashMap<NodeId, VecDeque<BusMessage>>,

    /// Maximum length of a single inbox, the oldest message is dropped beyond it
    capacity: usize,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<B: MotorBus> BusPort<B> {
    /// Create a port carrying traffic for the given nodes. Frames from any other node are
    /// discarded.
    pub fn new(bus: B, nodes: &[NodeId], backoff: BackoffPolicy, capacity: usize) -> Self {
        Self {
            bus,
            backoff,
            inboxes: nodes.iter().map(|n| (*n, VecDeque::new())).collect(),
            capacity: capacity.max(1),
        }
    }

    /// Encode and send a command to a node.
    pub fn send(&mut self, node: NodeId, cmd: BusCommand) -> Result<SendOutcome, BusError> {
        trace!("Node {} <- {:?}", node, cmd);
        send_with_backoff(&mut self.bus, &cmd.to_frame(node), &self.backoff)
    }

    /// Wait until `deadline` for a message from `node` accepted by `pred`.
    ///
    /// Messages already buffered are checked first, oldest first. Anything received which does
    /// not match is buffered for later.
    pub fn recv_matching<F>(
        &mut self,
        node: NodeId,
        deadline: Instant,
        mut pred: F,
    ) -> Result<Option<BusMessage>, BusError>
    where
        F: FnMut(&BusMessage) -> bool,
    {
        if let Some(inbox) = self.inboxes.get_mut(&node) {
            if let Some(idx) = inbox.iter().position(|m| pred(m)) {
                return Ok(inbox.remove(idx));
            }
        }

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let frame = match self.bus.recv(deadline - now)? {
                Some(f) => f,
                None => continue,
            };

            let msg = match BusMessage::decode(&frame) {
                Ok(m) => m,
                Err(e) => {
                    debug!("Discarding malformed frame from node {}: {}", frame.node, e);
                    continue;
                }
            };

            if frame.node == node && pred(&msg) {
                return Ok(Some(msg));
            }

            self.buffer(frame.node, msg);
        }
    }

    /// Drop every message from `node` received so far, including frames still waiting on the
    /// bus. Frames from other nodes are read into their inboxes and kept.
    pub fn discard(&mut self, node: NodeId) -> Result<(), BusError> {
        while let Some(frame) = self.bus.recv(Duration::from_secs(0))? {
            if frame.node == node {
                continue;
            }

            match BusMessage::decode(&frame) {
                Ok(m) => self.buffer(frame.node, m),
                Err(e) => debug!("Discarding malformed frame from node {}: {}", frame.node, e),
            }
        }

        if let Some(inbox) = self.inboxes.get_mut(&node) {
            inbox.clear();
        }

        Ok(())
    }

    /// Read and throw away everything currently waiting on the bus, and empty every inbox.
    pub fn flush(&mut self) -> Result<(), BusError> {
        while self.bus.recv(Duration::from_secs(0))?.is_some() {}

        for inbox in self.inboxes.values_mut() {
            inbox.clear();
        }

        Ok(())
    }

    /// Number of messages buffered for `node`.
    pub fn buffered(&self, node: NodeId) -> usize {
        self.inboxes.get(&node).map(|i| i.len()).unwrap_or(0)
    }

    fn buffer(&mut self, node: NodeId, msg: BusMessage) {
        let inbox = match self.inboxes.get_mut(&node) {
            Some(i) => i,
            None => return,
        };

        // Nothing ever waits for these
        if let BusMessage::Other(_) = msg {
            return;
        }

        if inbox.len() >= self.capacity {
            inbox.pop_front();
        }
        inbox.push_back(msg);
    }
}
