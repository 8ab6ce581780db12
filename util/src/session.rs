//! Session management
//!
//! A session is a single run of a rig executable. Each session gets its own directory holding
//! the log file, the archives written during the run and a copy of every input file (parameters,
//! replay recordings) so a run can be reproduced later.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External imports
use chrono::{DateTime, Utc};
use conquer_once::OnceCell;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// Internal imports
use crate::time;

// ---------------------------------------------------------------------------
// STATICS
// ---------------------------------------------------------------------------

static SESSION_EPOCH: OnceCell<DateTime<Utc>> = OnceCell::uninit();

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// A chrono format string used to name session directories.
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Directory, under the session root, holding copies of the input files
const INPUTS_DIR: &str = "inputs";

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A struct storing information about the current session
#[derive(Clone, Debug)]
pub struct Session {
    /// The root directory for this session
    pub session_root: PathBuf,

    /// The root directory for this session's archives
    pub arch_root: PathBuf,

    /// The path to the session's log file
    pub log_file_path: PathBuf,

    /// Start of the session, the zero of every logged timestamp
    pub epoch: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Possible errors associated with the session module.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("The software root environment variable (RIG_SW_ROOT) is not set")]
    SwRootNotSet,

    #[error("Cannot create the session directory: {0}")]
    CannotCreateDir(std::io::Error),

    #[error(
        "Cannot initialise the session epoch, has a session already been started? \
         (conquer_once error: {0})"
    )]
    CannotInitEpoch(conquer_once::TryInitError),

    #[error("Cannot record the input file {0:?}: {1}")]
    CannotRecordInput(PathBuf, std::io::Error),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Session {
    /// Start a new session.
    ///
    /// This will create a new session directory named `{exec_name}_{timestamp}` under
    /// `$RIG_SW_ROOT/{sessions_dir}`.
    pub fn new(exec_name: &str, sessions_dir: &str) -> Result<Self, SessionError> {
        let root = crate::host::get_sw_root().map_err(|_| SessionError::SwRootNotSet)?;

        Self::new_in(exec_name, root.join(sessions_dir))
    }

    /// Start a new session inside an explicit directory rather than one relative to the
    /// software root. Only one session may be started per process.
    pub fn new_in(exec_name: &str, sessions_path: PathBuf) -> Result<Self, SessionError> {
        let epoch = Utc::now();
        SESSION_EPOCH
            .try_init_once(|| epoch)
            .map_err(SessionError::CannotInitEpoch)?;

        let path = sessions_path.join(format!("{}_{}", exec_name, epoch.format(TIMESTAMP_FORMAT)));
        let arch_path = path.join("arch");

        fs::create_dir_all(&arch_path).map_err(SessionError::CannotCreateDir)?;

        Ok(Session {
            log_file_path: path.join(format!("{}.log", exec_name)),
            session_root: path,
            arch_root: arch_path,
            epoch,
        })
    }

    /// Copy an input file into the session's `inputs` directory, keeping its file name.
    ///
    /// Returns the path of the copy.
    pub fn record_input<P: AsRef<Path>>(&self, src: P) -> Result<PathBuf, SessionError> {
        let src = src.as_ref();
        let err = |e| SessionError::CannotRecordInput(src.to_path_buf(), e);

        let file_name = src.file_name().ok_or_else(|| {
            err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a file",
            ))
        })?;

        let dir = self.session_root.join(INPUTS_DIR);
        fs::create_dir_all(&dir).map_err(err)?;

        let dst = dir.join(file_name);
        fs::copy(src, &dst).map_err(err)?;

        Ok(dst)
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Get the number of seconds elapsed since the start of the session.
///
/// Returns `NAN` if no session has been started yet.
pub fn get_elapsed_seconds() -> f64 {
    match SESSION_EPOCH.get() {
        Some(e) => time::duration_to_seconds(Utc::now() - *e).unwrap_or(std::f64::NAN),
        None => std::f64::NAN,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Only one session can exist per process, so everything is checked in one test
    #[test]
    fn test_session() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Session::new_in("test_exec", tmp.path().to_path_buf()).unwrap();

        assert!(session.session_root.starts_with(tmp.path()));
        assert!(session.arch_root.is_dir());
        assert_eq!(
            session.log_file_path.file_name().unwrap().to_str(),
            Some("test_exec.log")
        );
        assert!(get_elapsed_seconds() >= 0.0);

        // A second session is refused
        assert!(matches!(
            Session::new_in("other", tmp.path().to_path_buf()),
            Err(SessionError::CannotInitEpoch(_))
        ));

        // Inputs are copied under their own name
        let src = tmp.path().join("rig.toml");
        fs::write(&src, "[bus]\n").unwrap();
        let copy = session.record_input(&src).unwrap();
        assert_eq!(copy, session.session_root.join("inputs").join("rig.toml"));
        assert_eq!(fs::read_to_string(copy).unwrap(), "[bus]\n");

        assert!(matches!(
            session.record_input(tmp.path().join("missing.csv")),
            Err(SessionError::CannotRecordInput(_, _))
        ));
    }
}
