//! The object a client session talks to.
//!
//! Every request acts on the root host's pet names. Replies are JSON: data
//! values as themselves, live capabilities as `@type` descriptors.
//!
//! Blobs too large for one frame are uploaded with `store_begin`, any number
//! of `store_chunk`s and `store_commit`. Uploads belong to the session and
//! are discarded with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::NodeId;

use super::agent::{Host, PendingBlob};
use super::cancel::{CancelReason, CancelToken};
use super::graph::{Capability, Graph, GraphError};
use super::session::{Bootstrap, ErrorPayload, SessionError};
use super::sync::lock;

/// Calls a client may make on the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DaemonRequest {
    Ping,
    /// Stop the daemon.
    Terminate,
    /// A pet name, a formula id or an `endo://` locator.
    Provide {
        reference: String,
    },
    Store {
        /// Hex-encoded bytes.
        content: String,
        #[serde(default)]
        name: Option<String>,
    },
    /// Open an upload; replies `{ "upload": <id> }`.
    StoreBegin {
        #[serde(default)]
        name: Option<String>,
    },
    /// Append hex-encoded bytes; replies with the bytes received so far.
    StoreChunk {
        upload: u64,
        content: String,
    },
    /// Publish the upload as a blob.
    StoreCommit {
        upload: u64,
    },
    MakeWorker {
        #[serde(default)]
        name: Option<String>,
    },
    Evaluate {
        worker: String,
        source: String,
        #[serde(default)]
        code_names: Vec<String>,
        #[serde(default)]
        pet_names: Vec<String>,
        #[serde(default)]
        result_name: Option<String>,
    },
    TerminateWorker {
        name: String,
    },
    /// UTF-8 text of a named blob.
    Text {
        name: String,
    },
    Locate {
        name: String,
    },
    List,
    Remove {
        name: String,
    },
    Rename {
        from: String,
        to: String,
    },
    ProvideGuest {
        #[serde(default)]
        name: Option<String>,
    },
    ProvideHost {
        #[serde(default)]
        name: Option<String>,
    },
    MakeBundle {
        worker: String,
        bundle: String,
        powers: String,
        #[serde(default)]
        result_name: Option<String>,
    },
    AddPeer {
        name: String,
        node: NodeId,
        #[serde(default)]
        addresses: Vec<String>,
    },
}

pub struct DaemonFacet {
    graph: Weak<Graph>,
    stop: CancelToken,
    uploads: Mutex<HashMap<u64, PendingBlob>>,
    next_upload: AtomicU64,
}

fn decode_hex(content: &str) -> Result<Vec<u8>, GraphError> {
    hex::decode(content).map_err(|e| {
        GraphError::Session(SessionError::Protocol {
            reason: format!("store content is not hex: {e}"),
        })
    })
}

fn unknown_upload(upload: u64) -> GraphError {
    GraphError::UnknownReference {
        reference: format!("upload {upload}"),
    }
}

impl DaemonFacet {
    /// `stop` is cancelled by a `terminate` request.
    pub fn new(graph: &Arc<Graph>, stop: CancelToken) -> Self {
        Self {
            graph: Arc::downgrade(graph),
            stop,
            uploads: Mutex::new(HashMap::new()),
            next_upload: AtomicU64::new(1),
        }
    }

    fn host(&self) -> Result<Arc<Host>, GraphError> {
        self.graph
            .upgrade()
            .ok_or_else(|| GraphError::Cancelled {
                reason: "daemon is stopping".into(),
            })?
            .root_host()
    }

    fn handle(&self, request: DaemonRequest) -> Result<Value, GraphError> {
        match request {
            DaemonRequest::Ping => Ok(json!("pong")),
            DaemonRequest::Terminate => {
                tracing::info!("terminate requested by client");
                self.stop
                    .cancel(CancelReason::requested("terminate requested"));
                Ok(Value::Null)
            }
            DaemonRequest::Provide { reference } => {
                Ok(self.host()?.provide(&reference)?.into_value())
            }
            DaemonRequest::Store { content, name } => {
                let bytes = decode_hex(&content)?;
                let blob = self.host()?.store(bytes.as_slice(), name.as_deref())?;
                Ok(Capability::Blob(blob).to_wire())
            }
            DaemonRequest::StoreBegin { name } => {
                let pending = self.host()?.begin_store(name.as_deref())?;
                let upload = self.next_upload.fetch_add(1, Ordering::Relaxed);
                lock(&self.uploads).insert(upload, pending);
                Ok(json!({ "upload": upload }))
            }
            DaemonRequest::StoreChunk { upload, content } => {
                let bytes = decode_hex(&content)?;
                let mut uploads = lock(&self.uploads);
                let pending = uploads.get_mut(&upload).ok_or_else(|| unknown_upload(upload))?;
                match pending.append(&bytes) {
                    Ok(received) => Ok(json!(received)),
                    Err(err) => {
                        uploads.remove(&upload);
                        Err(err)
                    }
                }
            }
            DaemonRequest::StoreCommit { upload } => {
                let pending = lock(&self.uploads)
                    .remove(&upload)
                    .ok_or_else(|| unknown_upload(upload))?;
                let blob = self.host()?.finish_store(pending)?;
                Ok(Capability::Blob(blob).to_wire())
            }
            DaemonRequest::MakeWorker { name } => {
                let worker = self.host()?.make_worker(name.as_deref())?;
                Ok(Capability::Worker(worker).to_wire())
            }
            DaemonRequest::Evaluate {
                worker,
                source,
                code_names,
                pet_names,
                result_name,
            } => Ok(self
                .host()?
                .evaluate(&worker, &source, code_names, pet_names, result_name.as_deref())?
                .into_value()),
            DaemonRequest::TerminateWorker { name } => {
                self.host()?.terminate_worker(&name)?;
                Ok(Value::Null)
            }
            DaemonRequest::Text { name } => {
                let host = self.host()?;
                let id = host
                    .identify(&name)?
                    .ok_or_else(|| GraphError::UnknownReference {
                        reference: name.clone(),
                    })?;
                let text = host.provide(&name)?.into_blob(&id)?.text()?;
                Ok(Value::String(text))
            }
            DaemonRequest::Locate { name } => Ok(Value::String(self.host()?.locate(&name)?)),
            DaemonRequest::List => Ok(json!(self.host()?.list()?)),
            DaemonRequest::Remove { name } => {
                self.host()?.remove(&name)?;
                Ok(Value::Null)
            }
            DaemonRequest::Rename { from, to } => {
                self.host()?.rename(&from, &to)?;
                Ok(Value::Null)
            }
            DaemonRequest::ProvideGuest { name } => {
                let guest = self.host()?.provide_guest(name.as_deref())?;
                Ok(Capability::Guest(guest).to_wire())
            }
            DaemonRequest::ProvideHost { name } => {
                let host = self.host()?.provide_host(name.as_deref())?;
                Ok(Capability::Host(host).to_wire())
            }
            DaemonRequest::MakeBundle {
                worker,
                bundle,
                powers,
                result_name,
            } => Ok(self
                .host()?
                .make_bundle(&worker, &bundle, &powers, result_name.as_deref())?
                .into_value()),
            DaemonRequest::AddPeer {
                name,
                node,
                addresses,
            } => {
                let id = self.host()?.add_peer(&name, node, addresses)?;
                Ok(json!({ "@type": "peer", "id": id }))
            }
        }
    }
}

impl Bootstrap for DaemonFacet {
    fn dispatch(&self, request: Value) -> Result<Value, ErrorPayload> {
        let request: DaemonRequest = serde_json::from_value(request)
            .map_err(|e| ErrorPayload::new("protocol", format!("bad daemon request: {e}")))?;
        self.handle(request).map_err(|err| {
            tracing::debug!(code = err.code(), error = %err, "request failed");
            err.to_payload()
        })
    }
}
