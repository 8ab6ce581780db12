//! # Log Sink
//!
//! Persistent record of every tracker update next to the gimbal state at that instant, so a
//! tracker's reported orientation can later be compared against the commanded and measured
//! gimbal angles.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use util::{
    archive::{ArchiveError, Archiver},
    session::Session,
};

use crate::{blackboard::SharedGimbalState, tracker_server::sessions::TrackerSession};

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Somewhere to append one record per tracker update.
pub trait LogSink: Send {
    fn append(
        &mut self,
        session: &TrackerSession,
        gimbal: &SharedGimbalState,
    ) -> Result<(), LogSinkError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Writes records as CSV rows into the session archive.
pub struct CsvLogSink {
    archiver: Archiver,
}

/// One flat CSV row. Values the tracker has not reported yet are left empty.
#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    time_unix_s: f64,
    tracker: &'a str,
    batt_pct: Option<f32>,
    batt_volt: Option<f32>,
    qx: Option<f32>,
    qy: Option<f32>,
    qz: Option<f32>,
    qw: Option<f32>,
    ax: Option<f32>,
    ay: Option<f32>,
    az: Option<f32>,
    enc_x_deg: f64,
    enc_y_deg: f64,
    enc_z_deg: f64,
    err_x_deg: f64,
    err_y_deg: f64,
    err_z_deg: f64,
    goal_x_deg: f64,
    goal_y_deg: f64,
    goal_z_deg: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LogSinkError {
    #[error("Could not write the tracker log: {0}")]
    Archive(#[from] ArchiveError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl CsvLogSink {
    /// Create a new sink writing to `file_name` in the session's archive directory.
    pub fn new<P: AsRef<Path>>(session: &Session, file_name: P) -> Result<Self, LogSinkError> {
        Ok(Self {
            archiver: Archiver::from_path(session, file_name)?,
        })
    }

    pub fn from_file_path<P: AsRef<Path>>(path: P) -> Result<Self, LogSinkError> {
        Ok(Self {
            archiver: Archiver::from_file_path(path)?,
        })
    }
}

impl LogSink for CsvLogSink {
    fn append(
        &mut self,
        session: &TrackerSession,
        gimbal: &SharedGimbalState,
    ) -> Result<(), LogSinkError> {
        let q = session.orientation;
        let a = session.acceleration;

        let record = LogRecord {
            time_unix_s: Utc::now().timestamp_millis() as f64 / 1000.0,
            tracker: &session.id,
            batt_pct: session.battery_pct,
            batt_volt: session.battery_volt,
            qx: q.map(|q| q.i),
            qy: q.map(|q| q.j),
            qz: q.map(|q| q.k),
            qw: q.map(|q| q.w),
            ax: a.map(|a| a.x),
            ay: a.map(|a| a.y),
            az: a.map(|a| a.z),
            enc_x_deg: gimbal.encoder_deg[0],
            enc_y_deg: gimbal.encoder_deg[1],
            enc_z_deg: gimbal.encoder_deg[2],
            err_x_deg: gimbal.error_deg[0],
            err_y_deg: gimbal.error_deg[1],
            err_z_deg: gimbal.error_deg[2],
            goal_x_deg: gimbal.goal_deg[0],
            goal_y_deg: gimbal.goal_deg[1],
            goal_z_deg: gimbal.goal_deg[2],
        };

        self.archiver.serialise(record)?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tracker_server::sessions::{SessionSource, TrackerSession};
    use nalgebra::Quaternion;
    use std::time::Instant;

    fn session() -> TrackerSession {
        TrackerSession {
            id: "0a:0b:0c:0d:0e:0f".to_string(),
            source: SessionSource::Dongle(1),
            last_seen: Instant::now(),
            battery_pct: Some(87.0),
            battery_volt: Some(3.5),
            orientation: Some(Quaternion::new(1.0, 0.0, 0.0, 0.0)),
            acceleration: None,
            handshake: None,
            rejected: 0,
        }
    }

    #[test]
    fn test_csv_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trackers.csv");

        let mut sink = CsvLogSink::from_file_path(&path).unwrap();
        let gimbal = SharedGimbalState::new([350.0, 0.0, 90.0], [10.0, 0.0, 90.0]);

        sink.append(&session(), &gimbal).unwrap();
        sink.append(&session(), &gimbal).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("time_unix_s,tracker,batt_pct,batt_volt,qx,qy,qz,qw,ax"));

        let fields: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(fields.len(), 20);
        assert_eq!(fields[1], "0a:0b:0c:0d:0e:0f");
        assert_eq!(fields[2], "87.0");
        assert_eq!(fields[7], "1.0");
        // No acceleration reported yet
        assert_eq!(fields[8], "");
        assert_eq!(fields[14], "-20.0");
    }
}
