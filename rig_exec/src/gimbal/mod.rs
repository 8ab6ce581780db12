//! # Gimbal Orchestrator
//!
//! Owns the three axis controllers and the bus they share, and runs motion cycles back to back
//! until stopped:
//!
//! 1. Get the next goal from the motion source
//! 2. Derive a common speed and acceleration
//! 3. Read the current position of every axis
//! 4. Command each axis further than the position tolerance from its goal
//! 5. Wait for every move to finish, up to the settle ceiling
//! 6. Read the positions again and publish goal, measured and error angles
//!
//! Whatever ends the run, every axis is commanded idle exactly once before the orchestrator
//! returns.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod motion_source;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::eqpt::bus::{FrameError, NodeId};
use log::{debug, error, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use util::{
    maths::{clamp, shortest_signed_difference, wrap_deg, DEG_PER_TURN},
    time::seconds_to_std,
};

use crate::{
    axis_ctrl::{AxisCtrl, MotionCommand, TrajLimits},
    blackboard::Blackboard,
    bus::{port::BusPort, BusError, MotorBus},
    params::{BusParams, GimbalParams},
};
pub use motion_source::{MotionSource, MotionTarget, RandomSource, ReplayError, ReplaySource};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Number of gimbal axes.
pub const NUM_AXES: usize = 3;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct Gimbal<B: MotorBus> {
    port: BusPort<B>,

    /// X, Y and Z axes, in that order
    axes: Vec<AxisCtrl>,

    params: GimbalParams,

    closed_loop_timeout: Duration,
    encoder_timeout: Duration,
    settle_timeout: Duration,

    blackboard: Arc<Blackboard>,

    /// Set once every axis has been commanded idle
    shut_down: bool,
}

/// Summary of a completed cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    /// Number of axes which were commanded to move
    pub moved: usize,

    /// True if every moved axis reported its trajectory done before the settle ceiling
    pub settled: bool,

    /// Units: degrees
    pub error_deg: [f64; NUM_AXES],
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GimbalError {
    #[error("Invalid axis node id: {0}")]
    InvalidNodeId(FrameError),

    #[error("Node id {0} is used by more than one axis")]
    DuplicateNodeId(NodeId),

    #[error("Motor bus failure: {0}")]
    Bus(#[from] BusError),
}

/// Why a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    Stopped,
    SourceExhausted,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<B: MotorBus> Gimbal<B> {
    pub fn new(
        bus: B,
        bus_params: &BusParams,
        params: &GimbalParams,
        blackboard: Arc<Blackboard>,
    ) -> Result<Self, GimbalError> {
        let mut nodes = Vec::with_capacity(NUM_AXES);
        for raw in bus_params.node_ids.iter() {
            let id = NodeId::new(*raw).map_err(GimbalError::InvalidNodeId)?;
            if nodes.contains(&id) {
                return Err(GimbalError::DuplicateNodeId(id));
            }
            nodes.push(id);
        }

        let limit_eps = TrajLimits {
            vel_turns_s: params.vel_limit_eps,
            accel_turns_s2: params.accel_limit_eps,
        };

        Ok(Self {
            port: BusPort::new(bus, &nodes, bus_params.backoff, bus_params.inbox_capacity),
            axes: nodes.iter().map(|n| AxisCtrl::new(*n, limit_eps)).collect(),
            params: params.clone(),
            closed_loop_timeout: seconds_to_std(bus_params.closed_loop_timeout_s),
            encoder_timeout: seconds_to_std(bus_params.encoder_timeout_s),
            settle_timeout: seconds_to_std(bus_params.settle_timeout_s),
            blackboard,
            shut_down: false,
        })
    }

    /// Bring every axis into closed loop control.
    ///
    /// Axes which do not confirm within the closed loop timeout are reported and the rig carries
    /// on regardless.
    pub fn bring_up(&mut self) -> Result<(), GimbalError> {
        self.port.flush()?;

        for axis in self.axes.iter_mut() {
            axis.initialize(&mut self.port)?;
        }

        let deadline = Instant::now() + self.closed_loop_timeout;
        let mut pending = Vec::new();

        for axis in self.axes.iter_mut() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !axis.await_closed_loop(&mut self.port, remaining)? {
                pending.push(axis.node());
            }
        }

        if pending.is_empty() {
            info!("All axes in closed loop control");
        } else {
            warn!(
                "Closed loop not confirmed for nodes {:?}, continuing",
                pending.iter().map(|n| n.get()).collect::<Vec<_>>()
            );
        }

        Ok(())
    }

    /// Run a single motion cycle towards `target`.
    pub fn run_cycle(&mut self, target: &MotionTarget) -> Result<CycleReport, GimbalError> {
        let speed_deg_s = clamp(
            target.speed_deg_s.unwrap_or(self.params.speed_min_deg_s),
            self.params.speed_min_deg_s,
            self.params.speed_max_deg_s,
        );

        // Current positions
        let mut current_turns = [0.0; NUM_AXES];
        for (i, axis) in self.axes.iter_mut().enumerate() {
            current_turns[i] = axis.read_position(&mut self.port, self.encoder_timeout)?;
        }

        // Command the axes which are off target
        let mut moved = Vec::with_capacity(NUM_AXES);
        for (i, axis) in self.axes.iter_mut().enumerate() {
            let current_deg = wrap_deg(current_turns[i] * DEG_PER_TURN);
            let goal_deg = target.goal_deg[i];

            if shortest_signed_difference(goal_deg, current_deg).abs() > self.params.pos_eps_deg {
                let cmd = MotionCommand {
                    axis: axis.node(),
                    target_deg: goal_deg,
                    velocity_deg_s: speed_deg_s,
                };
                axis.move_to(&mut self.port, &cmd, self.params.accel_factor)?;
                moved.push(i);
            }
        }

        // Settle, the deadline is a ceiling rather than a requirement
        let deadline = Instant::now() + self.settle_timeout;
        let mut settled = true;
        for &i in moved.iter() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.axes[i].await_move_done(&mut self.port, remaining)? {
                settled = false;
            }
        }

        if !settled {
            debug!("Not every axis settled within {:?}", self.settle_timeout);
        }

        // Publish
        let mut encoder_deg = [0.0; NUM_AXES];
        for (i, axis) in self.axes.iter_mut().enumerate() {
            let turns = axis.read_position(&mut self.port, self.encoder_timeout)?;
            encoder_deg[i] = wrap_deg(turns * DEG_PER_TURN);
        }

        self.blackboard.publish_gimbal(target.goal_deg, encoder_deg);

        Ok(CycleReport {
            moved: moved.len(),
            settled,
            error_deg: self.blackboard.gimbal().error_deg,
        })
    }

    /// Bring the gimbal up and run cycles until `stop` is raised, the source runs out or an
    /// error occurs. Every axis is idled before returning, in all three cases.
    pub fn run(
        &mut self,
        source: &mut dyn MotionSource,
        stop: &AtomicBool,
    ) -> Result<RunEnd, GimbalError> {
        let result = self.run_inner(source, stop);

        if let Err(ref e) = result {
            error!("Gimbal stopped on error: {}", e);
        }

        self.shutdown();

        result
    }

    fn run_inner(
        &mut self,
        source: &mut dyn MotionSource,
        stop: &AtomicBool,
    ) -> Result<RunEnd, GimbalError> {
        self.bring_up()?;

        let cycle_period = seconds_to_std(self.params.cycle_period_s);
        let mut tick: u64 = 0;

        info!("Beginning gimbal cycles");

        loop {
            if stop.load(Ordering::SeqCst) {
                info!("Stop requested after {} cycles", tick);
                return Ok(RunEnd::Stopped);
            }

            let cycle_start = Instant::now();

            let target = match source.next_target(tick) {
                Some(t) => t,
                None => {
                    info!("Motion source exhausted after {} cycles", tick);
                    return Ok(RunEnd::SourceExhausted);
                }
            };

            let report = self.run_cycle(&target)?;

            debug!(
                "Cycle {}: goal {:?}, moved {}, error {:?}",
                tick, target.goal_deg, report.moved, report.error_deg
            );

            tick += 1;

            let elapsed = cycle_start.elapsed();
            if elapsed < cycle_period {
                thread::sleep(cycle_period - elapsed);
            }
        }
    }

    /// Command every axis idle. Only the first call has any effect.
    ///
    /// Every axis is attempted even if an earlier one fails.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        for axis in self.axes.iter_mut() {
            if let Err(e) = axis.idle(&mut self.port) {
                error!("Could not idle node {}: {}", axis.node(), e);
            }
        }

        info!("Gimbal axes idled");
    }

    pub fn axes(&self) -> &[AxisCtrl] {
        &self.axes
    }
}

impl<B: MotorBus> Drop for Gimbal<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        axis_ctrl::AxisPhase,
        bus::sim::{SimBus, SimHandle},
    };
    use comms_if::eqpt::bus::{AxisState, BusCommand};

    fn fast_bus_params() -> BusParams {
        BusParams {
            closed_loop_timeout_s: 0.05,
            encoder_timeout_s: 0.01,
            settle_timeout_s: 0.02,
            ..Default::default()
        }
    }

    fn fast_gimbal_params() -> GimbalParams {
        GimbalParams {
            cycle_period_s: 0.0,
            ..Default::default()
        }
    }

    fn gimbal() -> (Gimbal<SimBus>, SimHandle, Arc<Blackboard>) {
        let bus = SimBus::new();
        let handle = bus.handle();
        let bb = Arc::new(Blackboard::new());
        let g = Gimbal::new(bus, &fast_bus_params(), &fast_gimbal_params(), bb.clone()).unwrap();

        (g, handle, bb)
    }

    fn nodes() -> Vec<NodeId> {
        (1..=3).map(|n| NodeId::new(n).unwrap()).collect()
    }

    fn idle_count(handle: &SimHandle, node: NodeId) -> usize {
        handle
            .commands_for(node)
            .iter()
            .filter(|c| **c == BusCommand::SetAxisState(AxisState::Idle))
            .count()
    }

    /// Fixed targets, raising `stop` while the given cycle is running.
    struct Scripted {
        targets: Vec<[f64; 3]>,
        stop_at: Option<(u64, Arc<AtomicBool>)>,
    }

    impl MotionSource for Scripted {
        fn next_target(&mut self, tick: u64) -> Option<MotionTarget> {
            if let Some((at, ref flag)) = self.stop_at {
                if tick == at {
                    flag.store(true, Ordering::SeqCst);
                }
            }

            self.targets.get(tick as usize).map(|g| MotionTarget {
                goal_deg: *g,
                speed_deg_s: None,
            })
        }
    }

    #[test]
    fn test_invalid_node_ids() {
        let bb = Arc::new(Blackboard::new());

        let dup = BusParams {
            node_ids: [1, 2, 1],
            ..Default::default()
        };
        assert!(matches!(
            Gimbal::new(SimBus::new(), &dup, &GimbalParams::default(), bb.clone()),
            Err(GimbalError::DuplicateNodeId(_))
        ));

        let big = BusParams {
            node_ids: [1, 2, 200],
            ..Default::default()
        };
        assert!(matches!(
            Gimbal::new(SimBus::new(), &big, &GimbalParams::default(), bb),
            Err(GimbalError::InvalidNodeId(_))
        ));
    }

    #[test]
    fn test_cycle_publishes_state() {
        let (mut g, handle, bb) = gimbal();

        g.bring_up().unwrap();
        for axis in g.axes() {
            assert_eq!(axis.phase(), AxisPhase::ClosedLoop);
        }

        // Axis X sits at 10 degrees
        handle.set_position(nodes()[0], (10.0 / 360.0) as f32);

        let report = g
            .run_cycle(&MotionTarget {
                goal_deg: [350.0, 0.1, 90.0],
                speed_deg_s: Some(1000.0),
            })
            .unwrap();

        // Y is within tolerance
        assert_eq!(report.moved, 2);
        assert!(report.settled);
        assert!(report.error_deg.iter().all(|e| e.abs() < 0.2));

        // X took the short way round
        let x_cmds = handle.commands_for(nodes()[0]);
        let pos = x_cmds
            .iter()
            .filter_map(|c| match c {
                BusCommand::SetInputPos { pos_turns, .. } => Some(*pos_turns as f64),
                _ => None,
            })
            .last()
            .unwrap();
        assert!((pos * 360.0 + 10.0).abs() < 1e-3, "pos was {} turns", pos);

        // Speed clamped to the maximum
        assert!(x_cmds.contains(&BusCommand::SetTrajVelLimit {
            vel_turns_s: (10.0f64 / 360.0) as f32
        }));

        let state = bb.gimbal();
        assert_eq!(state.goal_deg, [350.0, 0.1, 90.0]);
        assert!((state.encoder_deg[0] - 350.0).abs() < 1e-3);
    }

    #[test]
    fn test_shutdown_mid_cycle_idles_every_axis() {
        let (mut g, handle, _bb) = gimbal();
        handle.set_hold_trajectories(true);

        let stop = Arc::new(AtomicBool::new(false));
        let mut source = Scripted {
            targets: vec![[90.0, 180.0, 270.0]; 10],
            stop_at: Some((0, stop.clone())),
        };

        let end = g.run(&mut source, &stop).unwrap();
        assert_eq!(end, RunEnd::Stopped);

        for n in nodes() {
            let cmds = handle.commands_for(n);
            assert!(cmds
                .iter()
                .any(|c| matches!(c, BusCommand::SetInputPos { .. })));
            assert_eq!(idle_count(&handle, n), 1);
            assert_eq!(cmds.last(), Some(&BusCommand::SetAxisState(AxisState::Idle)));
            assert_eq!(handle.axis_state(n), Some(AxisState::Idle));
        }

        // Dropping the gimbal does not idle again
        drop(g);
        for n in nodes() {
            assert_eq!(idle_count(&handle, n), 1);
        }
    }

    #[test]
    fn test_bus_error_still_idles_every_axis() {
        let (mut g, handle, _bb) = gimbal();

        let stop = AtomicBool::new(false);
        let mut source = Scripted {
            targets: vec![[90.0, 180.0, 270.0]; 10],
            stop_at: None,
        };

        g.bring_up().unwrap();
        handle.inject_recv_failure();

        assert!(matches!(
            g.run_cycle(&source.next_target(0).unwrap()),
            Err(GimbalError::Bus(BusError::Io(_)))
        ));

        handle.inject_recv_failure();
        assert!(matches!(
            g.run(&mut source, &stop),
            Err(GimbalError::Bus(BusError::Io(_)))
        ));

        for n in nodes() {
            assert_eq!(idle_count(&handle, n), 1);
        }
    }

    #[test]
    fn test_source_exhaustion() {
        let (mut g, handle, bb) = gimbal();

        let stop = AtomicBool::new(false);
        let mut source = Scripted {
            targets: vec![[10.0, 20.0, 30.0], [40.0, 50.0, 60.0]],
            stop_at: None,
        };

        assert_eq!(g.run(&mut source, &stop).unwrap(), RunEnd::SourceExhausted);
        assert_eq!(bb.snapshot().gimbal_cycles, 2);
        assert_eq!(bb.gimbal().goal_deg, [40.0, 50.0, 60.0]);

        for n in nodes() {
            assert_eq!(idle_count(&handle, n), 1);
        }
    }

    #[test]
    fn test_unconfirmed_bring_up_is_tolerated() {
        let (mut g, handle, _bb) = gimbal();
        handle.set_silent(true);

        g.bring_up().unwrap();
        for axis in g.axes() {
            assert_eq!(axis.phase(), AxisPhase::Arming);
        }

        // Cycles still run, positions fall back to zero
        let report = g
            .run_cycle(&MotionTarget {
                goal_deg: [0.0, 0.0, 45.0],
                speed_deg_s: None,
            })
            .unwrap();
        assert_eq!(report.moved, 1);
        assert!(!report.settled);
    }
}
