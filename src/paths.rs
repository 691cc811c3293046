//! XDG directory helpers and the daemon's on-disk layout.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::PathsConfig;
use crate::core::{FormulaNumber, NodeId, Sha512Digest};

const APP_DIR: &str = "endo";

/// Base directory for durable daemon state (formulas, blobs, pet stores).
///
/// `$XDG_STATE_HOME/endo` or `~/.local/state/endo`.
pub fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| home().join(".local").join("state"))
        .join(APP_DIR)
}

/// Base directory for state that does not survive a reboot (pid files).
///
/// `$XDG_RUNTIME_DIR/endo`, falling back to a per-user directory in `/tmp`.
pub fn default_ephemeral_dir() -> PathBuf {
    dirs::runtime_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(per_user_tmp_dir)
}

/// `$XDG_CACHE_HOME/endo` or `~/.cache/endo`.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| home().join(".cache"))
        .join(APP_DIR)
}

/// `$XDG_CONFIG_HOME/endo` or `~/.config/endo`.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home().join(".config"))
        .join(APP_DIR)
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn per_user_tmp_dir() -> PathBuf {
    #[allow(unsafe_code)]
    let uid = unsafe { libc::geteuid() };
    PathBuf::from("/tmp").join(format!("endo-{uid}"))
}

/// Resolved roots plus every path the daemon writes under them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonPaths {
    pub state: PathBuf,
    pub ephemeral: PathBuf,
    pub cache: PathBuf,
    pub sock: PathBuf,
}

impl DaemonPaths {
    pub fn resolve(cfg: &PathsConfig) -> Self {
        let state = cfg.state.clone().unwrap_or_else(default_state_dir);
        let ephemeral = cfg.ephemeral_state.clone().unwrap_or_else(default_ephemeral_dir);
        let cache = cfg.cache.clone().unwrap_or_else(default_cache_dir);
        let sock = cfg
            .sock
            .clone()
            .unwrap_or_else(|| ephemeral.join("captp0.sock"));
        Self {
            state,
            ephemeral,
            cache,
            sock,
        }
    }

    /// Every root under a single directory. Used by tests and throwaway daemons.
    pub fn rooted(root: &Path) -> Self {
        Self {
            state: root.join("state"),
            ephemeral: root.join("run"),
            cache: root.join("cache"),
            sock: root.join("run").join("captp0.sock"),
        }
    }

    pub fn ensure_roots(&self) -> io::Result<()> {
        fs::create_dir_all(&self.state)?;
        fs::create_dir_all(&self.ephemeral)?;
        fs::create_dir_all(&self.cache)?;
        if let Some(dir) = self.sock.parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn node_id_path(&self) -> PathBuf {
        self.state.join("node-id")
    }

    pub fn root_host_path(&self) -> PathBuf {
        self.state.join("root-host")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.ephemeral.join("endo.pid")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state.join("logs")
    }

    pub fn formulas_dir(&self) -> PathBuf {
        self.state.join("formulas")
    }

    /// `formulas/<number[0..2]>/<number[2..]>.json`
    pub fn formula_path(&self, number: &FormulaNumber) -> PathBuf {
        let (head, tail) = number.split_shard();
        self.formulas_dir().join(head).join(format!("{tail}.json"))
    }

    pub fn content_dir(&self) -> PathBuf {
        self.state.join("store-sha512")
    }

    pub fn content_path(&self, digest: &Sha512Digest) -> PathBuf {
        self.content_dir().join(digest.to_hex())
    }

    pub fn pet_store_dir(&self, store: &FormulaNumber) -> PathBuf {
        self.state.join("pet-store").join(store.as_str())
    }

    /// Peer formula id recorded for a remote node.
    pub fn known_peer_path(&self, node: &NodeId) -> PathBuf {
        self.state.join("known-peers").join(node.as_str())
    }

    pub fn worker_state_dir(&self, worker: &FormulaNumber) -> PathBuf {
        self.state.join("worker").join(worker.as_str())
    }

    pub fn worker_ephemeral_dir(&self, worker: &FormulaNumber) -> PathBuf {
        self.ephemeral.join("worker").join(worker.as_str())
    }

    pub fn worker_cache_dir(&self, worker: &FormulaNumber) -> PathBuf {
        self.cache.join("worker").join(worker.as_str())
    }

    pub fn worker_log_path(&self, worker: &FormulaNumber) -> PathBuf {
        self.worker_state_dir(worker).join("worker.log")
    }

    pub fn worker_pid_path(&self, worker: &FormulaNumber) -> PathBuf {
        self.worker_ephemeral_dir(worker).join("worker.pid")
    }
}
