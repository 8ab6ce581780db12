//! # Dongle Reader
//!
//! Reads fixed size reports from the dongle's byte stream (usually a hidraw device) and forwards
//! the decoded reports to the tracker server. The device is reopened if it disappears.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::eqpt::dongle::{decode_reports, DongleReport, REPORT_LEN};
use log::{debug, info, warn};
use std::{
    fs::File,
    io::{ErrorKind, Read},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Why [`pump_reports`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    Stopped,

    /// The stream reached its end.
    Eof,

    /// Nobody is listening for reports any more.
    ReceiverGone,
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Read reports from `reader` and send them on `tx` until the stream ends, the receiver hangs
/// up, `stop` is raised, or a read fails.
pub fn pump_reports<R: Read>(
    reader: &mut R,
    tx: &Sender<DongleReport>,
    stop: &AtomicBool,
) -> std::io::Result<PumpEnd> {
    let mut pending: Vec<u8> = Vec::with_capacity(4 * REPORT_LEN);
    let mut chunk = [0u8; 4 * REPORT_LEN];

    while !stop.load(Ordering::Relaxed) {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(PumpEnd::Eof),
            Ok(n) => n,
            Err(e) => match e.kind() {
                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => continue,
                _ => return Err(e),
            },
        };

        pending.extend_from_slice(&chunk[..n]);

        let whole = pending.len() - pending.len() % REPORT_LEN;
        for report in decode_reports(&pending[..whole]) {
            if tx.send(report).is_err() {
                return Ok(PumpEnd::ReceiverGone);
            }
        }
        pending.drain(..whole);
    }

    Ok(PumpEnd::Stopped)
}

/// Spawn a thread reading reports from the device at `path`, reopening it after `retry_period`
/// whenever it cannot be opened or read.
pub fn spawn_reader(
    path: PathBuf,
    tx: Sender<DongleReport>,
    stop: Arc<AtomicBool>,
    retry_period: Duration,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("dongle".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let mut file = match File::open(&path) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!("Could not open the dongle at {:?}: {}", path, e);
                        thread::sleep(retry_period);
                        continue;
                    }
                };

                info!("Reading dongle reports from {:?}", path);

                match pump_reports(&mut file, &tx, &stop) {
                    Ok(PumpEnd::Stopped) | Ok(PumpEnd::ReceiverGone) => break,
                    Ok(PumpEnd::Eof) => debug!("Dongle stream ended, reopening"),
                    Err(e) => warn!("Dongle read failed: {}", e),
                }

                thread::sleep(retry_period);
            }
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::eqpt::dongle::DongleReportKind;
    use std::{io::Cursor, sync::mpsc};

    fn announce(id: u8) -> [u8; REPORT_LEN] {
        let mut r = [0u8; REPORT_LEN];
        r[0] = 255;
        r[1] = id;
        r[2..8].copy_from_slice(&[1, 2, 3, 4, 5, id]);
        r
    }

    /// Hands out at most `step` bytes per read, like a device delivering partial reports.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_pump_whole_reports() {
        let mut bytes = announce(1).to_vec();
        bytes.extend_from_slice(&announce(2));
        // Trailing partial report is never decoded
        bytes.extend_from_slice(&[255, 3, 0]);

        let (tx, rx) = mpsc::channel();
        let stop = AtomicBool::new(false);

        let end = pump_reports(&mut Cursor::new(bytes), &tx, &stop).unwrap();
        assert_eq!(end, PumpEnd::Eof);

        let reports: Vec<DongleReport> = rx.try_iter().collect();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].tracker_id, 2);
        assert!(matches!(reports[0].kind, DongleReportKind::Announce(_)));
    }

    #[test]
    fn test_pump_partial_reads() {
        let mut data = announce(7).to_vec();
        data.extend_from_slice(&announce(8));

        let mut reader = Trickle { data, pos: 0, step: 5 };
        let (tx, rx) = mpsc::channel();
        let stop = AtomicBool::new(false);

        assert_eq!(pump_reports(&mut reader, &tx, &stop).unwrap(), PumpEnd::Eof);
        let ids: Vec<u8> = rx.try_iter().map(|r| r.tracker_id).collect();
        assert_eq!(ids, vec![7, 8]);
    }

    #[test]
    fn test_pump_ends() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let stop = AtomicBool::new(false);
        assert_eq!(
            pump_reports(&mut Cursor::new(announce(1).to_vec()), &tx, &stop).unwrap(),
            PumpEnd::ReceiverGone
        );

        let (tx, _rx) = mpsc::channel();
        let stop = AtomicBool::new(true);
        assert_eq!(
            pump_reports(&mut Cursor::new(announce(1).to_vec()), &tx, &stop).unwrap(),
            PumpEnd::Stopped
        );
    }
}
