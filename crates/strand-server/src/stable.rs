//! Durable Raft term and vote.
//!
//! Raft requires `current_term` and `voted_for` to survive restarts; a node
//! that forgets its vote can hand two leaders the same term. Writes go to a
//! temp file, sync, then rename over the live one.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use strand_raft::rpc::{NodeId, Term};

use crate::error::ServerResult;

const STATE_FILE: &str = "state";
const STATE_FILE_TMP: &str = "state.tmp";

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct PersistedState {
    term: Term,
    voted_for: Option<NodeId>,
}

/// File-backed store for the node's term and vote.
#[derive(Debug)]
pub struct StableStore {
    dir: PathBuf,
    state: PersistedState,
}

impl StableStore {
    /// Opens the store in `dir`, loading any existing state.
    pub fn new(dir: impl AsRef<Path>) -> ServerResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let path = dir.join(STATE_FILE);
        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            bincode::deserialize(&bytes).unwrap_or_default()
        } else {
            PersistedState::default()
        };

        Ok(Self { dir, state })
    }

    /// The persisted term.
    pub fn term(&self) -> Term {
        self.state.term
    }

    /// The persisted vote.
    pub fn voted_for(&self) -> Option<NodeId> {
        self.state.voted_for
    }

    /// Persists term and vote if they changed; atomic replace + fsync.
    pub fn save(&mut self, term: Term, voted_for: Option<NodeId>) -> ServerResult<()> {
        let next = PersistedState { term, voted_for };
        if next == self.state {
            return Ok(());
        }

        let tmp = self.dir.join(STATE_FILE_TMP);
        let live = self.dir.join(STATE_FILE);

        let bytes = bincode::serialize(&next)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &live)?;
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        self.state = next;
        Ok(())
    }
}
