//! Requests the daemon sends to a worker over its stdin/stdout session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Evaluate `source` with `names[i]` bound to `values[i]`.
    Evaluate {
        source: String,
        #[serde(default)]
        names: Vec<String>,
        #[serde(default)]
        values: Vec<Value>,
    },
    /// Import bundle text with `powers` endowed.
    ImportBundle { source: String, powers: Value },
    /// Reply, then exit.
    Terminate,
    Ping,
}
