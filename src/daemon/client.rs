//! Client side of the daemon socket.

use std::io::{self, Read};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::core::NodeId;

use super::cancel::{CancelReason, CancelToken};
use super::facet::DaemonRequest;
use super::graph::GraphError;
use super::session::{NoBootstrap, Session, SessionError, SessionOptions, Transport};

/// A session with the daemon facet. Failures reported by the daemon come
/// back as [`GraphError::Remote`] carrying the daemon's error code.
pub struct DaemonClient {
    session: Session,
    // Largest raw chunk whose hex form fits a frame with room to spare.
    chunk_bytes: usize,
}

impl DaemonClient {
    pub fn connect(sock: &Path, max_frame_bytes: usize) -> io::Result<Self> {
        let stream = UnixStream::connect(sock)?;
        Self::from_stream(stream, max_frame_bytes)
    }

    /// Keep trying `connect` until the daemon is listening or `timeout`
    /// elapses.
    pub fn connect_with_retry(sock: &Path, max_frame_bytes: usize, timeout: Duration) -> io::Result<Self> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_millis(25);
        loop {
            match Self::connect(sock, max_frame_bytes) {
                Ok(client) => return Ok(client),
                Err(e)
                    if Instant::now() < deadline
                        && matches!(
                            e.kind(),
                            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                        ) =>
                {
                    thread::sleep(backoff);
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(200));
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn from_stream(stream: UnixStream, max_frame_bytes: usize) -> io::Result<Self> {
        let session = Session::open(
            Transport::unix(stream)?,
            Arc::new(NoBootstrap),
            &CancelToken::new(),
            SessionOptions::named("client").with_max_frame_bytes(max_frame_bytes),
        );
        Ok(Self {
            session,
            chunk_bytes: (max_frame_bytes / 4).max(1),
        })
    }

    pub fn request(&self, request: &DaemonRequest) -> Result<Value, GraphError> {
        Ok(self.session.call_as(request)?)
    }

    pub fn ping(&self) -> Result<Value, GraphError> {
        self.request(&DaemonRequest::Ping)
    }

    /// Ask the daemon to stop. The session closes once the daemon exits.
    pub fn terminate(&self) -> Result<(), GraphError> {
        self.request(&DaemonRequest::Terminate)?;
        Ok(())
    }

    pub fn provide(&self, reference: &str) -> Result<Value, GraphError> {
        self.request(&DaemonRequest::Provide {
            reference: reference.to_string(),
        })
    }

    /// Small blobs go in one request, larger ones through [`Self::store_stream`].
    pub fn store(&self, bytes: &[u8], name: Option<&str>) -> Result<Value, GraphError> {
        if bytes.len() > self.chunk_bytes {
            return self.store_stream(bytes, name);
        }
        self.request(&DaemonRequest::Store {
            content: hex::encode(bytes),
            name: name.map(str::to_string),
        })
    }

    /// Upload `reader` in frame-sized chunks. A read failure abandons the
    /// upload; the daemon drops it with the session.
    pub fn store_stream(&self, mut reader: impl Read, name: Option<&str>) -> Result<Value, GraphError> {
        let begun = self.request(&DaemonRequest::StoreBegin {
            name: name.map(str::to_string),
        })?;
        let upload = begun["upload"].as_u64().ok_or_else(|| {
            GraphError::Session(SessionError::Protocol {
                reason: format!("store_begin replied {begun}"),
            })
        })?;
        let mut buf = vec![0u8; self.chunk_bytes];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(GraphError::Session(SessionError::Protocol {
                        reason: format!("reading upload: {e}"),
                    }));
                }
            };
            self.request(&DaemonRequest::StoreChunk {
                upload,
                content: hex::encode(&buf[..n]),
            })?;
        }
        self.request(&DaemonRequest::StoreCommit { upload })
    }

    pub fn text(&self, name: &str) -> Result<String, GraphError> {
        Ok(self.session.call_as(&DaemonRequest::Text {
            name: name.to_string(),
        })?)
    }

    pub fn make_worker(&self, name: Option<&str>) -> Result<Value, GraphError> {
        self.request(&DaemonRequest::MakeWorker {
            name: name.map(str::to_string),
        })
    }

    pub fn evaluate(
        &self,
        worker: &str,
        source: &str,
        code_names: &[&str],
        pet_names: &[&str],
        result_name: Option<&str>,
    ) -> Result<Value, GraphError> {
        self.request(&DaemonRequest::Evaluate {
            worker: worker.to_string(),
            source: source.to_string(),
            code_names: code_names.iter().map(|s| s.to_string()).collect(),
            pet_names: pet_names.iter().map(|s| s.to_string()).collect(),
            result_name: result_name.map(str::to_string),
        })
    }

    pub fn terminate_worker(&self, name: &str) -> Result<(), GraphError> {
        self.request(&DaemonRequest::TerminateWorker {
            name: name.to_string(),
        })?;
        Ok(())
    }

    pub fn locate(&self, name: &str) -> Result<String, GraphError> {
        Ok(self.session.call_as(&DaemonRequest::Locate {
            name: name.to_string(),
        })?)
    }

    pub fn list(&self) -> Result<Vec<String>, GraphError> {
        Ok(self.session.call_as(&DaemonRequest::List)?)
    }

    pub fn remove(&self, name: &str) -> Result<(), GraphError> {
        self.request(&DaemonRequest::Remove {
            name: name.to_string(),
        })?;
        Ok(())
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), GraphError> {
        self.request(&DaemonRequest::Rename {
            from: from.to_string(),
            to: to.to_string(),
        })?;
        Ok(())
    }

    pub fn provide_guest(&self, name: Option<&str>) -> Result<Value, GraphError> {
        self.request(&DaemonRequest::ProvideGuest {
            name: name.map(str::to_string),
        })
    }

    pub fn provide_host(&self, name: Option<&str>) -> Result<Value, GraphError> {
        self.request(&DaemonRequest::ProvideHost {
            name: name.map(str::to_string),
        })
    }

    pub fn make_bundle(
        &self,
        worker: &str,
        bundle: &str,
        powers: &str,
        result_name: Option<&str>,
    ) -> Result<Value, GraphError> {
        self.request(&DaemonRequest::MakeBundle {
            worker: worker.to_string(),
            bundle: bundle.to_string(),
            powers: powers.to_string(),
            result_name: result_name.map(str::to_string),
        })
    }

    pub fn add_peer(&self, name: &str, node: &NodeId, addresses: &[String]) -> Result<Value, GraphError> {
        self.request(&DaemonRequest::AddPeer {
            name: name.to_string(),
            node: node.clone(),
            addresses: addresses.to_vec(),
        })
    }

    pub fn closed(&self) -> &CancelToken {
        self.session.closed()
    }

    pub fn close(&self) {
        self.session.close(CancelReason::closed("client closed"));
    }
}

impl Drop for DaemonClient {
    fn drop(&mut self) {
        self.close();
    }
}
