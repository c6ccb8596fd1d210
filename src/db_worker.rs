use std::sync::mpsc::{Receiver, Sender};
use std::thread::JoinHandle;

use tracing::{error, trace};

use crate::db::{RecordingRow, RecordingsDb};

/// Requests served by the DB worker thread. Replies ride their own
/// one-shot channels so callers stay decoupled from the connection.
pub enum DbMessage {
    RecordingStarted {
        camera_key: String,
        path: String,
        started_at: String,
    },
    RecordingFinished {
        path: String,
        finished_at: String,
        bytes: i64,
        truncated: bool,
    },
    GetRecentRecordings {
        camera_key: String,
        limit: i64,
        reply: Sender<Vec<RecordingRow>>,
    },
}

pub struct DbWorker {
    pub recvr: Receiver<DbMessage>,
    pub db: RecordingsDb,
}

impl DbWorker {
    pub fn new(recvr: Receiver<DbMessage>, db_path: &str) -> rusqlite::Result<Self> {
        let db = RecordingsDb::setup(db_path)?;
        Ok(DbWorker { recvr, db })
    }
}

pub fn start_db_worker(worker: DbWorker) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while let Ok(message) = worker.recvr.recv() {
            match message {
                DbMessage::RecordingStarted {
                    camera_key,
                    path,
                    started_at,
                } => {
                    trace!(camera = %camera_key, %path, "DB worker: recording started");
                    if let Err(e) = worker.db.insert_started(&camera_key, &path, &started_at) {
                        error!("DB worker failed to insert recording: {e:#}");
                    }
                }

                DbMessage::RecordingFinished {
                    path,
                    finished_at,
                    bytes,
                    truncated,
                } => {
                    trace!(%path, bytes, truncated, "DB worker: recording finished");
                    if let Err(e) = worker.db.mark_finished(&path, &finished_at, bytes, truncated)
                    {
                        error!("DB worker failed to finish recording: {e:#}");
                    }
                }

                DbMessage::GetRecentRecordings {
                    camera_key,
                    limit,
                    reply,
                } => {
                    let rows = match worker.db.recent_for_camera(&camera_key, limit) {
                        Ok(rows) => rows,
                        Err(e) => {
                            error!(
                                "DB worker failed to list recordings for '{camera_key}': {e:#}"
                            );
                            Vec::new()
                        }
                    };
                    let _ = reply.send(rows);
                }
            }
        }
        trace!("DB worker channel closed. Exiting DB worker thread.");
    })
}
