//! # Simulated Motor Bus
//!
//! Answers the handful of requests the rig makes the way a healthy axis would: closed loop
//! requests are confirmed by a heartbeat, encoder polls return the last commanded position and
//! position commands complete immediately. It does not model motor dynamics.
//!
//! All state lives behind a [`SimHandle`], which tests keep after handing the bus itself to the
//! code under test, to inspect the sent frames or inject faults.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::eqpt::bus::{
    AxisState, BusCommand, BusFrame, CommandCode, EncoderEstimate, Heartbeat, NodeId,
};
use log::trace;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use super::{BusError, MotorBus};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Longest time `recv` sleeps when nothing is queued.
const IDLE_POLL: Duration = Duration::from_millis(1);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct SimBus {
    shared: Arc<Mutex<SimState>>,
}

/// Handle to the state of a [`SimBus`].
#[derive(Clone)]
pub struct SimHandle {
    shared: Arc<Mutex<SimState>>,
}

#[derive(Default)]
struct SimState {
    nodes: HashMap<NodeId, SimNode>,

    /// Frames waiting to be received
    rx_queue: VecDeque<BusFrame>,

    /// Every frame accepted by `send`
    history: Vec<BusFrame>,

    /// Number of upcoming sends rejected as busy
    busy_sends: u32,

    /// The next receive fails with an I/O error
    fail_next_recv: bool,

    closed: bool,

    /// Nodes never answer
    silent: bool,

    /// Position commands never report completion
    hold_trajectories: bool,
}

#[derive(Debug, Clone, Copy)]
struct SimNode {
    state: AxisState,
    pos_turns: f32,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SimBus {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(SimState::default())),
        }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MotorBus for SimBus {
    fn send(&mut self, frame: &BusFrame) -> Result<(), BusError> {
        let mut state = lock(&self.shared);

        if state.closed {
            return Err(BusError::Closed);
        }

        if state.busy_sends > 0 {
            state.busy_sends -= 1;
            return Err(BusError::Busy);
        }

        state.history.push(*frame);
        state.respond(frame);

        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<BusFrame>, BusError> {
        {
            let mut state = lock(&self.shared);

            if state.closed {
                return Err(BusError::Closed);
            }

            if state.fail_next_recv {
                state.fail_next_recv = false;
                return Err(BusError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected receive failure",
                )));
            }

            if let Some(f) = state.rx_queue.pop_front() {
                return Ok(Some(f));
            }
        }

        thread::sleep(timeout.min(IDLE_POLL));

        Ok(None)
    }
}

impl SimHandle {
    /// All frames sent so far, in order.
    pub fn sent(&self) -> Vec<BusFrame> {
        lock(&self.shared).history.clone()
    }

    /// Commands sent to `node` so far, in order.
    pub fn commands_for(&self, node: NodeId) -> Vec<BusCommand> {
        lock(&self.shared)
            .history
            .iter()
            .filter(|f| f.node == node)
            .filter_map(|f| BusCommand::decode(f).ok().flatten())
            .collect()
    }

    pub fn clear_history(&self) {
        lock(&self.shared).history.clear();
    }

    /// Reject the next `count` sends as busy.
    pub fn inject_busy(&self, count: u32) {
        lock(&self.shared).busy_sends = count;
    }

    /// Number of injected busy rejections not yet consumed.
    pub fn pending_busy(&self) -> u32 {
        lock(&self.shared).busy_sends
    }

    /// Make the next receive fail with an I/O error.
    pub fn inject_recv_failure(&self) {
        lock(&self.shared).fail_next_recv = true;
    }

    /// Close the bus: every following operation fails.
    pub fn close(&self) {
        lock(&self.shared).closed = true;
    }

    /// Stop every node from answering.
    pub fn set_silent(&self, silent: bool) {
        lock(&self.shared).silent = silent;
    }

    /// Keep position commands from ever reporting completion.
    pub fn set_hold_trajectories(&self, hold: bool) {
        lock(&self.shared).hold_trajectories = hold;
    }

    /// Place an arbitrary frame in the receive queue.
    pub fn push_rx(&self, frame: BusFrame) {
        lock(&self.shared).rx_queue.push_back(frame);
    }

    /// Set the position of a node, as if it had been moved by hand.
    pub fn set_position(&self, node: NodeId, pos_turns: f32) {
        lock(&self.shared).node(node).pos_turns = pos_turns;
    }

    /// Last known state of a node.
    pub fn axis_state(&self, node: NodeId) -> Option<AxisState> {
        lock(&self.shared).nodes.get(&node).map(|n| n.state)
    }
}

impl SimState {
    fn node(&mut self, id: NodeId) -> &mut SimNode {
        self.nodes.entry(id).or_insert(SimNode {
            state: AxisState::Idle,
            pos_turns: 0.0,
        })
    }

    fn respond(&mut self, frame: &BusFrame) {
        let cmd = match BusCommand::decode(frame) {
            Ok(Some(c)) => c,
            _ => return,
        };

        trace!("SimBus: node {} <- {:?}", frame.node, cmd);

        let silent = self.silent;
        let hold = self.hold_trajectories;
        let node_id = frame.node;
        let node = self.node(node_id);

        let reply = match cmd {
            BusCommand::SetAxisState(s) => {
                node.state = s;
                heartbeat_frame(node_id, s, true)
            }
            BusCommand::SetInputPos { pos_turns, .. } => {
                node.pos_turns = pos_turns;
                if hold {
                    None
                } else {
                    heartbeat_frame(node_id, node.state, true)
                }
            }
            BusCommand::RequestEncoderEstimate => {
                let est = EncoderEstimate {
                    pos_turns: node.pos_turns,
                    vel_turns_s: 0.0,
                };
                BusFrame::new(node_id, CommandCode::GET_ENCODER_ESTIMATES, &est.encode()).ok()
            }
            _ => None,
        };

        if let (Some(r), false) = (reply, silent) {
            self.rx_queue.push_back(r);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn lock(shared: &Arc<Mutex<SimState>>) -> MutexGuard<'_, SimState> {
    match shared.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn heartbeat_frame(node: NodeId, state: AxisState, trajectory_done: bool) -> Option<BusFrame> {
    let hb = Heartbeat {
        axis_error: 0,
        axis_state: state,
        procedure_result: 0,
        trajectory_done,
    };

    BusFrame::new(node, CommandCode::HEARTBEAT, &hb.encode()).ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::eqpt::bus::BusMessage;

    #[test]
    fn test_sim_responses() {
        let mut bus = SimBus::new();
        let handle = bus.handle();
        let n = NodeId::new(2).unwrap();

        bus.send(&BusCommand::SetAxisState(AxisState::ClosedLoop).to_frame(n))
            .unwrap();
        let f = bus.recv(Duration::from_millis(1)).unwrap().unwrap();
        match BusMessage::decode(&f).unwrap() {
            BusMessage::Heartbeat(hb) => assert_eq!(hb.axis_state, AxisState::ClosedLoop),
            m => panic!("Expected heartbeat, got {:?}", m),
        }

        bus.send(
            &BusCommand::SetInputPos {
                pos_turns: 1.25,
                vel_ff: 0,
                torque_ff: 0,
            }
            .to_frame(n),
        )
        .unwrap();
        bus.recv(Duration::from_millis(1)).unwrap().unwrap();

        bus.send(&BusCommand::RequestEncoderEstimate.to_frame(n))
            .unwrap();
        let f = bus.recv(Duration::from_millis(1)).unwrap().unwrap();
        match BusMessage::decode(&f).unwrap() {
            BusMessage::EncoderEstimate(e) => assert_eq!(e.pos_turns, 1.25),
            m => panic!("Expected encoder estimate, got {:?}", m),
        }

        assert_eq!(bus.recv(Duration::from_millis(1)).unwrap(), None);
        assert_eq!(handle.sent().len(), 3);
        assert_eq!(handle.axis_state(n), Some(AxisState::ClosedLoop));
    }

    #[test]
    fn test_sim_faults() {
        let mut bus = SimBus::new();
        let handle = bus.handle();
        let n = NodeId::new(1).unwrap();

        handle.set_silent(true);
        bus.send(&BusCommand::RequestEncoderEstimate.to_frame(n))
            .unwrap();
        assert_eq!(bus.recv(Duration::from_millis(1)).unwrap(), None);

        handle.inject_recv_failure();
        assert!(matches!(
            bus.recv(Duration::from_millis(1)),
            Err(BusError::Io(_))
        ));
        assert_eq!(bus.recv(Duration::from_millis(1)).unwrap(), None);
    }
}
