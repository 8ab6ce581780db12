//! # Axis Controller
//!
//! Drives a single rotary axis through bring-up, trajectory moves and idling. Every blocking
//! operation is bounded by a timeout, and a timeout is never an error: the rig carries on with
//! what it knows.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod phase;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::eqpt::bus::{
    AxisState, BusCommand, BusMessage, NodeId, CONTROL_MODE_POSITION, INPUT_MODE_TRAP_TRAJ,
};
use log::{trace, warn};
use std::time::{Duration, Instant};
use util::maths::{nearest_turns, DEG_PER_TURN};

use crate::bus::{port::BusPort, BusError, MotorBus, SendOutcome};
pub use phase::{transition, AxisEvent, AxisPhase};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Trajectory limits of an axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajLimits {
    /// Units: turns/second
    pub vel_turns_s: f64,

    /// Units: turns/second^2
    pub accel_turns_s2: f64,
}

/// A move of one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionCommand {
    pub axis: NodeId,

    /// Units: degrees
    pub target_deg: f64,

    /// Units: degrees/second
    pub velocity_deg_s: f64,
}

pub struct AxisCtrl {
    node: NodeId,

    phase: AxisPhase,

    /// Last position reported by the encoder.
    ///
    /// Units: turns
    last_turns: Option<f64>,

    /// Limits last sent to the axis
    last_limits: Option<TrajLimits>,

    /// Limits closer than this to `last_limits` are not resent
    limit_eps: TrajLimits,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl TrajLimits {
    /// True if any limit differs from `other` by more than the matching tolerance in `eps`.
    pub fn differs_from(&self, other: &TrajLimits, eps: &TrajLimits) -> bool {
        (self.vel_turns_s - other.vel_turns_s).abs() > eps.vel_turns_s
            || (self.accel_turns_s2 - other.accel_turns_s2).abs() > eps.accel_turns_s2
    }
}

impl MotionCommand {
    /// Units: turns/second
    pub fn velocity_turns_s(&self) -> f64 {
        self.velocity_deg_s / DEG_PER_TURN
    }

    /// Trajectory limits for this move, acceleration being a fixed multiple of velocity.
    pub fn limits(&self, accel_factor: f64) -> TrajLimits {
        let vel = self.velocity_turns_s();
        TrajLimits {
            vel_turns_s: vel,
            accel_turns_s2: vel * accel_factor,
        }
    }
}

impl AxisCtrl {
    pub fn new(node: NodeId, limit_eps: TrajLimits) -> Self {
        Self {
            node,
            phase: AxisPhase::Idle,
            last_turns: None,
            last_limits: None,
            limit_eps,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn phase(&self) -> AxisPhase {
        self.phase
    }

    /// Last known position, if the encoder has ever answered.
    pub fn cached_turns(&self) -> Option<f64> {
        self.last_turns
    }

    /// Clear errors, select position control with trapezoidal trajectories and request closed
    /// loop control. Does not wait for confirmation.
    pub fn initialize<B: MotorBus>(&mut self, port: &mut BusPort<B>) -> Result<(), BusError> {
        port.send(self.node, BusCommand::ClearErrors)?;
        port.send(
            self.node,
            BusCommand::SetControllerMode {
                control_mode: CONTROL_MODE_POSITION,
                input_mode: INPUT_MODE_TRAP_TRAJ,
            },
        )?;
        port.send(
            self.node,
            BusCommand::SetAxisState(AxisState::ClosedLoop),
        )?;

        self.apply(AxisEvent::InitSent);

        Ok(())
    }

    /// Wait for a heartbeat confirming closed loop control.
    ///
    /// Returns `false` on timeout, leaving the axis pending. Warning about it is up to the caller.
    pub fn await_closed_loop<B: MotorBus>(
        &mut self,
        port: &mut BusPort<B>,
        timeout: Duration,
    ) -> Result<bool, BusError> {
        self.await_phase(port, timeout, |p| p == AxisPhase::ClosedLoop)
    }

    /// Poll the encoder for the current position.
    ///
    /// On timeout the last known position is returned, or `0.0` if the encoder has never
    /// answered.
    ///
    /// Units: turns
    pub fn read_position<B: MotorBus>(
        &mut self,
        port: &mut BusPort<B>,
        timeout: Duration,
    ) -> Result<f64, BusError> {
        // Late replies to earlier polls are older than the one requested below
        while let Some(m) = port.recv_matching(self.node, Instant::now(), is_encoder)? {
            self.cache_encoder(&m);
        }

        port.send(self.node, BusCommand::RequestEncoderEstimate)?;

        match port.recv_matching(self.node, Instant::now() + timeout, is_encoder)? {
            Some(m) => self.cache_encoder(&m),
            None => warn!(
                "No encoder estimate from node {} within {:?}, using {:?}",
                self.node, timeout, self.last_turns
            ),
        }

        Ok(self.last_turns.unwrap_or(0.0))
    }

    /// Command a move to `cmd.target_deg`, taking the shortest way round from the last known
    /// position.
    ///
    /// Trajectory limits are sent first, and only when they changed. Returns the absolute target
    /// in turns.
    pub fn move_to<B: MotorBus>(
        &mut self,
        port: &mut BusPort<B>,
        cmd: &MotionCommand,
        accel_factor: f64,
    ) -> Result<f64, BusError> {
        let current = self.last_turns.unwrap_or(0.0);
        let target_turns = nearest_turns(current, cmd.target_deg);

        let limits = cmd.limits(accel_factor);
        let resend = match self.last_limits {
            Some(last) => limits.differs_from(&last, &self.limit_eps),
            None => true,
        };

        if resend {
            let vel = port.send(
                self.node,
                BusCommand::SetTrajVelLimit {
                    vel_turns_s: limits.vel_turns_s as f32,
                },
            )?;
            let accel = port.send(
                self.node,
                BusCommand::SetTrajAccelLimits {
                    accel_turns_s2: limits.accel_turns_s2 as f32,
                    decel_turns_s2: limits.accel_turns_s2 as f32,
                },
            )?;

            // A dropped limit is resent with the next move
            self.last_limits = match (vel, accel) {
                (SendOutcome::Sent, SendOutcome::Sent) => Some(limits),
                _ => None,
            };
        }

        // Heartbeats from before this move would report the previous trajectory as done
        port.discard(self.node)?;

        port.send(
            self.node,
            BusCommand::SetInputPos {
                pos_turns: target_turns as f32,
                vel_ff: 0,
                torque_ff: 0,
            },
        )?;

        trace!(
            "Node {} moving {:.3} -> {:.3} turns",
            self.node,
            current,
            target_turns
        );

        self.apply(AxisEvent::MoveSent);

        Ok(target_turns)
    }

    /// Wait for a heartbeat reporting the trajectory done.
    ///
    /// Returns `false` on timeout, or if the axis is not settled (faulted, idle) once the wait
    /// is over.
    pub fn await_move_done<B: MotorBus>(
        &mut self,
        port: &mut BusPort<B>,
        timeout: Duration,
    ) -> Result<bool, BusError> {
        // Nothing in flight
        if self.phase != AxisPhase::Moving {
            return Ok(self.phase == AxisPhase::Settled);
        }

        self.await_phase(port, timeout, |p| p != AxisPhase::Moving)
            .map(|_| self.phase == AxisPhase::Settled)
    }

    /// Request the idle state.
    pub fn idle<B: MotorBus>(&mut self, port: &mut BusPort<B>) -> Result<SendOutcome, BusError> {
        let outcome = port.send(self.node, BusCommand::SetAxisState(AxisState::Idle))?;

        if outcome == SendOutcome::Dropped {
            warn!("Idle request for node {} was dropped", self.node);
        }

        self.apply(AxisEvent::IdleSent);

        Ok(outcome)
    }

    /// Feed heartbeats to the phase machine until `done` accepts the phase or the timeout
    /// elapses.
    fn await_phase<B, F>(
        &mut self,
        port: &mut BusPort<B>,
        timeout: Duration,
        done: F,
    ) -> Result<bool, BusError>
    where
        B: MotorBus,
        F: Fn(AxisPhase) -> bool,
    {
        let deadline = Instant::now() + timeout;

        while !done(self.phase) {
            match port.recv_matching(self.node, deadline, is_heartbeat)? {
                Some(BusMessage::Heartbeat(hb)) => self.apply(AxisEvent::Heartbeat(hb)),
                _ => return Ok(false),
            }
        }

        Ok(true)
    }

    fn apply(&mut self, event: AxisEvent) {
        let next = transition(self.phase, event);

        if next != self.phase {
            trace!("Node {}: {:?} -> {:?}", self.node, self.phase, next);

            if next == AxisPhase::Fault {
                warn!("Node {} reported a fault", self.node);
            }
        }

        self.phase = next;
    }

    fn cache_encoder(&mut self, msg: &BusMessage) {
        if let BusMessage::EncoderEstimate(e) = msg {
            self.last_turns = Some(e.pos_turns as f64);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn is_heartbeat(m: &BusMessage) -> bool {
    matches!(m, BusMessage::Heartbeat(_))
}

fn is_encoder(m: &BusMessage) -> bool {
    matches!(m, BusMessage::EncoderEstimate(_))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::{
        sim::{SimBus, SimHandle},
        BackoffPolicy,
    };
    use comms_if::eqpt::bus::{BusFrame, CommandCode, Heartbeat};

    const EPS: TrajLimits = TrajLimits {
        vel_turns_s: 1e-3,
        accel_turns_s2: 1e-3,
    };

    fn setup() -> (BusPort<SimBus>, SimHandle, AxisCtrl) {
        let n = NodeId::new(1).unwrap();
        let bus = SimBus::new();
        let handle = bus.handle();
        let port = BusPort::new(bus, &[n], BackoffPolicy::default(), 16);

        (port, handle, AxisCtrl::new(n, EPS))
    }

    fn heartbeat(node: NodeId, axis_error: u32, trajectory_done: bool) -> BusFrame {
        let hb = Heartbeat {
            axis_error,
            axis_state: AxisState::ClosedLoop,
            procedure_result: 0,
            trajectory_done,
        };
        BusFrame::new(node, CommandCode::HEARTBEAT, &hb.encode()).unwrap()
    }

    fn cmd(target_deg: f64) -> MotionCommand {
        MotionCommand {
            axis: NodeId::new(1).unwrap(),
            target_deg,
            velocity_deg_s: 36.0,
        }
    }

    #[test]
    fn test_initialize_sequence() {
        let (mut port, handle, mut axis) = setup();

        axis.initialize(&mut port).unwrap();
        assert_eq!(axis.phase(), AxisPhase::Arming);

        assert_eq!(
            handle.commands_for(axis.node()),
            vec![
                BusCommand::ClearErrors,
                BusCommand::SetControllerMode {
                    control_mode: 3,
                    input_mode: 5
                },
                BusCommand::SetAxisState(AxisState::ClosedLoop),
            ]
        );

        assert!(axis
            .await_closed_loop(&mut port, Duration::from_millis(50))
            .unwrap());
        assert_eq!(axis.phase(), AxisPhase::ClosedLoop);
    }

    #[test]
    fn test_closed_loop_timeout() {
        let (mut port, handle, mut axis) = setup();
        handle.set_silent(true);

        axis.initialize(&mut port).unwrap();
        assert!(!axis
            .await_closed_loop(&mut port, Duration::from_millis(10))
            .unwrap());
        assert_eq!(axis.phase(), AxisPhase::Arming);
    }

    #[test]
    fn test_read_position_falls_back_to_cache() {
        let (mut port, handle, mut axis) = setup();
        let timeout = Duration::from_millis(10);

        // Never answered
        handle.set_silent(true);
        assert_eq!(axis.read_position(&mut port, timeout).unwrap(), 0.0);

        handle.set_silent(false);
        handle.set_position(axis.node(), 1.5);
        assert_eq!(axis.read_position(&mut port, timeout).unwrap(), 1.5);

        handle.set_silent(true);
        handle.set_position(axis.node(), 2.0);
        assert_eq!(axis.read_position(&mut port, timeout).unwrap(), 1.5);
        assert_eq!(axis.cached_turns(), Some(1.5));
    }

    #[test]
    fn test_move_takes_short_path() {
        let (mut port, handle, mut axis) = setup();
        let timeout = Duration::from_millis(10);

        // 10 degrees
        handle.set_position(axis.node(), (10.0 / 360.0) as f32);
        axis.read_position(&mut port, timeout).unwrap();

        let target = axis.move_to(&mut port, &cmd(350.0), 2.0).unwrap();
        let delta_deg = (target - 10.0 / 360.0) * 360.0;

        assert!((delta_deg + 20.0).abs() < 1e-4, "delta was {}", delta_deg);
    }

    #[test]
    fn test_limits_sent_before_position_and_only_on_change() {
        let (mut port, handle, mut axis) = setup();

        axis.initialize(&mut port).unwrap();
        handle.clear_history();

        axis.move_to(&mut port, &cmd(90.0), 2.0).unwrap();
        axis.move_to(&mut port, &cmd(180.0), 2.0).unwrap();

        let cmds = handle.commands_for(axis.node());
        assert_eq!(cmds.len(), 4);
        assert_eq!(
            cmds[0],
            BusCommand::SetTrajVelLimit { vel_turns_s: 0.1 }
        );
        assert_eq!(
            cmds[1],
            BusCommand::SetTrajAccelLimits {
                accel_turns_s2: 0.2,
                decel_turns_s2: 0.2
            }
        );
        assert!(matches!(cmds[2], BusCommand::SetInputPos { .. }));
        assert!(matches!(cmds[3], BusCommand::SetInputPos { .. }));

        // A new speed resends the limits, still ahead of the position
        let mut faster = cmd(0.0);
        faster.velocity_deg_s = 72.0;
        axis.move_to(&mut port, &faster, 2.0).unwrap();

        let cmds = handle.commands_for(axis.node());
        assert_eq!(cmds.len(), 7);
        assert!(matches!(cmds[4], BusCommand::SetTrajVelLimit { .. }));
        assert!(matches!(cmds[5], BusCommand::SetTrajAccelLimits { .. }));
        assert!(matches!(cmds[6], BusCommand::SetInputPos { .. }));
    }

    #[test]
    fn test_move_done_and_idle() {
        let (mut port, handle, mut axis) = setup();
        let timeout = Duration::from_millis(20);

        axis.initialize(&mut port).unwrap();
        axis.await_closed_loop(&mut port, timeout).unwrap();

        axis.move_to(&mut port, &cmd(45.0), 2.0).unwrap();
        assert_eq!(axis.phase(), AxisPhase::Moving);
        assert!(axis.await_move_done(&mut port, timeout).unwrap());
        assert_eq!(axis.phase(), AxisPhase::Settled);

        handle.set_hold_trajectories(true);
        axis.move_to(&mut port, &cmd(90.0), 2.0).unwrap();
        assert!(!axis.await_move_done(&mut port, timeout).unwrap());
        assert_eq!(axis.phase(), AxisPhase::Moving);

        assert_eq!(axis.idle(&mut port).unwrap(), SendOutcome::Sent);
        assert_eq!(axis.phase(), AxisPhase::Idle);
        assert_eq!(handle.axis_state(axis.node()), Some(AxisState::Idle));
    }

    #[test]
    fn test_dropped_limits_resent_on_next_move() {
        let n = NodeId::new(1).unwrap();
        let bus = SimBus::new();
        let handle = bus.handle();
        let policy = BackoffPolicy {
            initial_s: 0.0001,
            cap_s: 0.001,
            retries: 3,
        };
        let mut port = BusPort::new(bus, &[n], policy, 16);
        let mut axis = AxisCtrl::new(n, EPS);

        // The velocity limit uses up every retry
        handle.inject_busy(3);
        axis.move_to(&mut port, &cmd(90.0), 2.0).unwrap();
        assert_eq!(handle.pending_busy(), 0);

        let cmds = handle.commands_for(n);
        assert_eq!(cmds.len(), 2);
        assert!(matches!(cmds[0], BusCommand::SetTrajAccelLimits { .. }));
        assert!(matches!(cmds[1], BusCommand::SetInputPos { .. }));

        // Same speed, but both limits go out again
        handle.clear_history();
        axis.move_to(&mut port, &cmd(180.0), 2.0).unwrap();

        let cmds = handle.commands_for(n);
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0], BusCommand::SetTrajVelLimit { vel_turns_s: 0.1 });
        assert_eq!(
            cmds[1],
            BusCommand::SetTrajAccelLimits {
                accel_turns_s2: 0.2,
                decel_turns_s2: 0.2
            }
        );
        assert!(matches!(cmds[2], BusCommand::SetInputPos { .. }));

        // Delivered this time, so the third move sends the position only
        handle.clear_history();
        axis.move_to(&mut port, &cmd(270.0), 2.0).unwrap();
        assert_eq!(handle.commands_for(n).len(), 1);
    }

    #[test]
    fn test_faulted_axis_is_not_settled() {
        let (mut port, handle, mut axis) = setup();
        let timeout = Duration::from_millis(20);

        axis.initialize(&mut port).unwrap();
        axis.await_closed_loop(&mut port, timeout).unwrap();

        handle.set_hold_trajectories(true);
        axis.move_to(&mut port, &cmd(45.0), 2.0).unwrap();
        handle.push_rx(heartbeat(axis.node(), 0x40, false));

        assert!(!axis.await_move_done(&mut port, timeout).unwrap());
        assert_eq!(axis.phase(), AxisPhase::Fault);

        // Still faulted on the next move, which must not count as settled either
        axis.move_to(&mut port, &cmd(90.0), 2.0).unwrap();
        assert_eq!(axis.phase(), AxisPhase::Fault);
        assert!(!axis.await_move_done(&mut port, timeout).unwrap());
    }

    #[test]
    fn test_heartbeat_before_move_is_ignored() {
        let (mut port, handle, mut axis) = setup();
        let timeout = Duration::from_millis(20);

        axis.initialize(&mut port).unwrap();
        axis.await_closed_loop(&mut port, timeout).unwrap();

        // Reports the previous trajectory done, but arrives before the move is sent
        handle.set_hold_trajectories(true);
        handle.push_rx(heartbeat(axis.node(), 0, true));

        axis.move_to(&mut port, &cmd(45.0), 2.0).unwrap();
        assert!(!axis.await_move_done(&mut port, timeout).unwrap());
        assert_eq!(axis.phase(), AxisPhase::Moving);

        // A heartbeat sent after the move still settles it
        handle.push_rx(heartbeat(axis.node(), 0, true));
        assert!(axis.await_move_done(&mut port, timeout).unwrap());
        assert_eq!(axis.phase(), AxisPhase::Settled);
    }
}
