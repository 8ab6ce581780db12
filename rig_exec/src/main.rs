//! Main rig executable entry point.
//!
//! # Architecture
//!
//! The rig runs two independent tasks which only meet on the blackboard:
//!
//!     - Tracker server (own thread):
//!         - UDP datagrams from trackers on the network
//!         - Reports from the dongle reader, if a dongle is given
//!         - Session eviction and tracker logging
//!     - Gimbal orchestrator (main thread):
//!         - Bring-up of the three axes
//!         - Move, settle and measure cycles with goals from the motion source
//!         - Idle every axis on the way out
//!
//! Ctrl-C, the end of a replay, or a fatal error in either task stops both.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use color_eyre::{
    eyre::{eyre, WrapErr},
    Report,
};
use log::info;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};
use structopt::StructOpt;

// Internal
#[cfg(feature = "can")]
use rig_lib::bus::can::CanBus;
use rig_lib::{
    blackboard::Blackboard,
    bus::{sim::SimBus, MotorBus},
    gimbal::{Gimbal, MotionSource, RandomSource, ReplaySource, RunEnd},
    log_sink::CsvLogSink,
    params::{BusParams, RigExecParams},
    tracker_server::{dongle, TrackerServer},
};
use util::{
    logger::{logger_init, LevelFilter},
    session::Session,
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Parameter file, relative to the params directory
const PARAMS_FILE: &str = "rig_exec.toml";

/// Time between attempts to open a missing dongle
const DONGLE_RETRY_PERIOD: Duration = Duration::from_secs(1);

/// Poll period of the stop flag when the gimbal is disabled
const IDLE_POLL_PERIOD: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// STRUCTS
// ---------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(name = "rig_exec", about = "Gimbal test rig for IMU trackers")]
struct Opt {
    /// Use the simulated motor bus instead of CAN
    #[structopt(long)]
    sim: bool,

    /// Replay goals from a CSV file with `x_deg,y_deg,z_deg` columns instead of exploring randomly
    #[structopt(long, parse(from_os_str))]
    replay: Option<PathBuf>,

    /// Read tracker reports from a dongle device, e.g. /dev/hidraw0
    #[structopt(long, parse(from_os_str))]
    dongle: Option<PathBuf>,

    /// Only serve trackers, leave the gimbal alone
    #[structopt(long)]
    no_gimbal: bool,

    /// Minimum level of log messages, one of info, debug or trace
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    /// Seed for random exploration, taken from the OS if not given
    #[structopt(long)]
    seed: Option<u64>,
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let opt = Opt::from_args();

    // ---- EARLY INITIALISATION ----

    // Initialise session
    let session = Session::new("rig_exec", "sessions").wrap_err("Failed to create the session")?;

    // Initialise logger
    logger_init(opt.log_level, &session).wrap_err("Failed to initialise logging")?;

    // Log information on this execution.
    info!("Gimbal Test Rig Executable\n");
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let params_path =
        util::params::path(PARAMS_FILE).wrap_err("Could not locate the rig_exec params")?;
    let params: RigExecParams =
        util::params::load_path(&params_path).wrap_err("Could not load rig_exec params")?;

    session
        .record_input(&params_path)
        .wrap_err("Could not record the rig_exec params")?;

    info!("Exec parameters loaded");

    // ---- STOP SIGNAL ----

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        })
        .wrap_err("Failed to set the Ctrl-C handler")?;
    }

    let blackboard = Arc::new(Blackboard::new());

    // ---- TRACKER SERVER ----

    let sink = CsvLogSink::new(&session, &params.tracker.log_file)
        .wrap_err("Failed to create the tracker log")?;

    let mut tracker_server =
        TrackerServer::bind(&params.tracker, params.decode, blackboard.clone())
            .wrap_err("Failed to start the tracker server")?
            .with_log_sink(Box::new(sink));

    // The reader may be blocked in a read of a silent device, so it is never joined
    if let Some(ref path) = opt.dongle {
        let (tx, rx) = mpsc::channel();
        tracker_server = tracker_server.with_dongle(rx);
        dongle::spawn_reader(path.clone(), tx, stop.clone(), DONGLE_RETRY_PERIOD)
            .wrap_err("Failed to start the dongle reader")?;
    }

    let tracker_thread = {
        let stop = stop.clone();
        thread::Builder::new()
            .name("tracker".to_string())
            .spawn(move || {
                let result = tracker_server.run(&stop);
                stop.store(true, Ordering::Relaxed);
                result
            })
            .wrap_err("Failed to start the tracker thread")?
    };

    // ---- GIMBAL ----

    let gimbal_result = if opt.no_gimbal {
        info!("Gimbal disabled, serving trackers only");
        while !stop.load(Ordering::Relaxed) {
            thread::sleep(IDLE_POLL_PERIOD);
        }
        Ok(())
    } else {
        run_gimbal(&opt, &session, &params, blackboard.clone(), &stop)
    };

    stop.store(true, Ordering::Relaxed);

    // ---- SHUTDOWN ----

    let tracker_result = tracker_thread
        .join()
        .map_err(|_| eyre!("The tracker thread panicked"))?;

    let snapshot = blackboard.snapshot();
    info!(
        "Completed {} gimbal cycles, {} tracker(s) connected at exit",
        snapshot.gimbal_cycles,
        snapshot.trackers.len()
    );

    gimbal_result?;
    tracker_result.wrap_err("Tracker server failed")?;

    info!("End of session");

    Ok(())
}

/// Open the bus, pick the motion source and run the gimbal until stopped.
fn run_gimbal(
    opt: &Opt,
    session: &Session,
    params: &RigExecParams,
    blackboard: Arc<Blackboard>,
    stop: &AtomicBool,
) -> Result<(), Report> {
    let bus = open_bus(opt, &params.bus)?;

    let mut gimbal = Gimbal::new(bus, &params.bus, &params.gimbal, blackboard)
        .wrap_err("Failed to create the gimbal")?;

    let mut source: Box<dyn MotionSource> = match opt.replay {
        Some(ref path) => {
            session
                .record_input(path)
                .wrap_err("Could not record the replay file")?;
            Box::new(
                ReplaySource::from_path(path, &params.replay, &params.gimbal)
                    .wrap_err_with(|| format!("Failed to load the replay file {:?}", path))?,
            )
        }
        None => {
            info!("Exploring random orientations");
            Box::new(RandomSource::new(opt.seed, &params.gimbal))
        }
    };

    match gimbal.run(source.as_mut(), stop).wrap_err("Gimbal failed")? {
        RunEnd::Stopped => info!("Gimbal stopped"),
        RunEnd::SourceExhausted => info!("Replay complete"),
    }

    Ok(())
}

fn open_bus(opt: &Opt, params: &BusParams) -> Result<Box<dyn MotorBus>, Report> {
    if opt.sim {
        info!("Using the simulated motor bus");
        return Ok(Box::new(SimBus::new()));
    }

    open_can(&params.channel)
}

#[cfg(feature = "can")]
fn open_can(channel: &str) -> Result<Box<dyn MotorBus>, Report> {
    let bus = CanBus::open(channel)
        .wrap_err_with(|| format!("Failed to open the CAN interface {}", channel))?;

    info!("Motor bus on {}", channel);

    Ok(Box::new(bus))
}

#[cfg(not(feature = "can"))]
fn open_can(channel: &str) -> Result<Box<dyn MotorBus>, Report> {
    Err(eyre!(
        "Cannot open {}, the rig was built without the `can` feature (use --sim)",
        channel
    ))
}
