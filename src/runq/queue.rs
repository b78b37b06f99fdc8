//! Run admission, deletion, listing, and previous-run lookup
//!
//! `add` is the only place run ids are minted. Under the queue lock it
//! reads the sequence token, skips over any id that already exists on disk
//! (a stale sequence file after a crash), creates the run directory with a
//! snapshot of the parameter repository, and advances the token file to the
//! successor, all inside the critical section, so concurrent submitters
//! can never mint the same id.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::error::QueueError;
use crate::runq::sequence::{self, SequenceToken};
use crate::runq::store::QueueStore;

/// Submission metadata stored alongside the parameter snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub submitter: String,
    pub submit_time: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
}

/// One pending run, as shown by `list`
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub run_id: String,
    pub bench_name: String,
    pub description: String,
    pub submitter: String,
    pub submit_time: DateTime<Utc>,
    token: SequenceToken,
}

/// The FIFO of pending runs
#[derive(Debug, Clone)]
pub struct RunQueue {
    store: QueueStore,
}

impl RunQueue {
    pub fn new(store: QueueStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    /// Admit a run: mint its id, snapshot the parameter repository, advance
    /// the sequence
    pub fn add(&self, submitter: &str, param_file: &Path) -> Result<String, QueueError> {
        let config =
            RunConfig::load(param_file).map_err(|e| QueueError::BadConfig(format!("{:#}", e)))?;
        let short_name = config.benchmark.short_name.clone();

        self.store.with_lock(|store| {
            let mut token = store.read_token();
            let run_id = loop {
                let candidate = format!("{}.{}", short_name, token.suffix());
                if !store.run_exists(&candidate) {
                    break candidate;
                }
                // Stale sequence file (crash between mint and advance):
                // re-mint from the next token.
                warn!("run id {} already exists; advancing sequence", candidate);
                token = token.successor();
            };

            let dir = store.queue_dir().join(&run_id);
            std::fs::create_dir_all(&dir)?;
            std::fs::copy(param_file, dir.join(format!("{}.toml", short_name)))?;
            let meta = RunMeta {
                submitter: submitter.to_string(),
                submit_time: Utc::now(),
                description: config.benchmark.description.clone(),
            };
            std::fs::write(
                dir.join("meta.json"),
                serde_json::to_vec_pretty(&meta).map_err(|e| {
                    QueueError::BadConfig(format!("meta serialization failed: {}", e))
                })?,
            )?;
            store.write_token(token.successor())?;

            info!(run_id = %run_id, submitter, "run queued");
            Ok(run_id)
        })
    }

    /// Remove a not-yet-started run. Returns `false` when the id is not in
    /// the queue (already running, finished, or never existed).
    pub fn delete(&self, run_id: &str) -> Result<bool, QueueError> {
        self.store.with_lock(|store| {
            let dir = store.queue_dir().join(run_id);
            if dir.is_dir() {
                std::fs::remove_dir_all(&dir)?;
                info!(run_id, "run deleted from queue");
                Ok(true)
            } else {
                Ok(false)
            }
        })
    }

    /// Pending runs in pick order. Reads optimistically, with no lock,
    /// since listing does not mutate.
    pub fn list(&self) -> Result<Vec<QueueEntry>, QueueError> {
        scan_queue(&self.store)
    }

    /// Id of the most recently minted run of `bench`, provided its
    /// parameter snapshot still exists in the queue or the output area
    pub fn get_valid_prev_run(&self, bench: &str) -> Result<Option<String>, QueueError> {
        let token = self.store.read_token();
        let Some(prev) = token.predecessor() else {
            return Ok(None);
        };
        let run_id = format!("{}.{}", bench, prev.suffix());
        let param_name = format!("{}.toml", bench);
        for dir in [self.store.queue_dir(), self.store.output_dir()] {
            if dir.join(&run_id).join(&param_name).is_file() {
                return Ok(Some(run_id));
            }
        }
        Ok(None)
    }
}

/// Scan the queue directory into pick order: sequence suffix first (int,
/// then char), submission time breaking exact ties.
pub(crate) fn scan_queue(store: &QueueStore) -> Result<Vec<QueueEntry>, QueueError> {
    let mut entries = Vec::new();
    for dir_entry in std::fs::read_dir(store.queue_dir())? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_dir() {
            continue;
        }
        let name = dir_entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some((bench, token)) = sequence::split_run_id(name) else {
            continue;
        };
        let meta: RunMeta = std::fs::read_to_string(dir_entry.path().join("meta.json"))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| RunMeta {
                submitter: String::new(),
                submit_time: DateTime::<Utc>::MIN_UTC,
                description: String::new(),
            });
        entries.push(QueueEntry {
            run_id: name.to_string(),
            bench_name: bench.to_string(),
            description: meta.description,
            submitter: meta.submitter,
            submit_time: meta.submit_time,
            token,
        });
    }
    entries.sort_by(|a, b| {
        a.token
            .sort_key()
            .cmp(&b.token.sort_key())
            .then(a.submit_time.cmp(&b.submit_time))
            .then(a.run_id.cmp(&b.run_id))
    });
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runq::sequence::SequenceToken;
    use std::path::PathBuf;

    fn param_file(dir: &Path, short_name: &str) -> PathBuf {
        let path = dir.join(format!("{}-params.toml", short_name));
        std::fs::write(
            &path,
            format!(
                r#"
                [benchmark]
                short_name = "{}"

                [run]
                steady_state = 10

                [driver]
                name = "unit"
                threads = 1

                [[driver.operations]]
                name = "ping"
                cycle = {{ dist = "fixed", ms = 100 }}

                [driver.foreground]
                mix = {{ type = "flat", weights = [1.0] }}
                "#,
                short_name
            ),
        )
        .unwrap();
        path
    }

    fn queue() -> (tempfile::TempDir, RunQueue) {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("data")).unwrap();
        (dir, RunQueue::new(store))
    }

    #[test]
    fn test_sequence_roll_on_add() {
        let (dir, queue) = queue();
        let params = param_file(dir.path(), "X");
        queue
            .store()
            .write_token(SequenceToken {
                number: 1,
                letter: 'z',
            })
            .unwrap();

        // Minting uses the current token; the file advances to the successor.
        assert_eq!(queue.add("tester", &params).unwrap(), "X.1z");
        assert_eq!(queue.store().read_token().to_string(), "2:A");
        assert_eq!(queue.add("tester", &params).unwrap(), "X.2A");
        assert_eq!(queue.store().read_token().to_string(), "2:B");

        // Predecessor of the next token is the last minted run.
        assert_eq!(
            queue.get_valid_prev_run("X").unwrap(),
            Some("X.2A".to_string())
        );
    }

    #[test]
    fn test_prev_run_requires_snapshot_on_disk() {
        let (dir, queue) = queue();
        let params = param_file(dir.path(), "X");

        // Fresh sequence: no predecessor at all.
        assert_eq!(queue.get_valid_prev_run("X").unwrap(), None);

        let run_id = queue.add("tester", &params).unwrap();
        assert_eq!(queue.get_valid_prev_run("X").unwrap(), Some(run_id.clone()));

        // Once the directory is gone the lookup comes back empty...
        assert!(queue.delete(&run_id).unwrap());
        assert_eq!(queue.get_valid_prev_run("X").unwrap(), None);

        // ...unless the run was archived to the output area.
        let out = queue.store().output_dir().join(&run_id);
        std::fs::create_dir_all(&out).unwrap();
        std::fs::copy(&params, out.join("X.toml")).unwrap();
        assert_eq!(queue.get_valid_prev_run("X").unwrap(), Some(run_id));
    }

    #[test]
    fn test_stale_sequence_file_reminted() {
        let (dir, queue) = queue();
        let params = param_file(dir.path(), "X");

        let first = queue.add("tester", &params).unwrap();
        assert_eq!(first, "X.1A");
        // Simulate a crash that rewound the token file.
        queue.store().write_token(SequenceToken::FIRST).unwrap();
        let second = queue.add("tester", &params).unwrap();
        assert_eq!(second, "X.1B", "collision must re-mint, not overwrite");
    }

    #[test]
    fn test_list_orders_by_suffix_then_insertion() {
        let (dir, queue) = queue();
        let x = param_file(dir.path(), "X");
        let y = param_file(dir.path(), "Y");

        // Y.1A, X.1B, X.1A submitted in that order (token file rewound
        // between adds to force the suffixes).
        queue.store().write_token(SequenceToken::FIRST).unwrap();
        assert_eq!(queue.add("tester", &y).unwrap(), "Y.1A");
        queue
            .store()
            .write_token(SequenceToken {
                number: 1,
                letter: 'B',
            })
            .unwrap();
        assert_eq!(queue.add("tester", &x).unwrap(), "X.1B");
        queue.store().write_token(SequenceToken::FIRST).unwrap();
        assert_eq!(queue.add("tester", &x).unwrap(), "X.1A");

        let ids: Vec<String> = queue
            .list()
            .unwrap()
            .into_iter()
            .map(|e| e.run_id)
            .collect();
        // Suffix 1A before 1B; the two 1A entries keep insertion order.
        assert_eq!(ids, vec!["Y.1A", "X.1A", "X.1B"]);
    }

    #[test]
    fn test_delete_unknown_run_is_false() {
        let (_dir, queue) = queue();
        assert!(!queue.delete("X.9z").unwrap());
    }

    #[test]
    fn test_add_rejects_broken_params() {
        let (dir, queue) = queue();
        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "this is not a parameter repository").unwrap();
        assert!(matches!(
            queue.add("tester", &bad),
            Err(QueueError::BadConfig(_))
        ));
        // Nothing was queued and the sequence did not advance.
        assert!(queue.list().unwrap().is_empty());
        assert_eq!(queue.store().read_token(), SequenceToken::FIRST);
    }
}
