//! Peer connections: hello exchange, outbound dialing and the gateway facet
//! a peer sees.
//!
//! Both ends of a peer connection serve a [`GatewayFacet`]. Before the
//! session starts each side sends one `Hello` frame naming its node, so
//! remote control knows which peer a connection belongs to.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::{FormulaId, NodeId};

use super::cancel::{CancelToken, bind_fates};
use super::graph::{Graph, GraphError};
use super::session::{
    Bootstrap, ErrorPayload, Hello, MessageReader, MessageWriter, Session, SessionError,
    SessionOptions, Transport,
};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Calls a peer may make on our gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GatewayRequest {
    Provide { id: FormulaId },
    Ping,
}

/// Our side of a live peer session.
#[derive(Debug)]
pub struct PeerGateway {
    node: NodeId,
    session: Session,
}

impl PeerGateway {
    /// `connection` and the session share a fate from here on.
    pub fn new(node: NodeId, session: Session, connection: &CancelToken) -> Self {
        bind_fates(session.closed(), connection);
        Self { node, session }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn closed(&self) -> &CancelToken {
        self.session.closed()
    }

    /// Ask the peer for the value of one of its formulas.
    pub fn provide(&self, id: &FormulaId) -> Result<Value, GraphError> {
        Ok(self
            .session
            .call_as(&GatewayRequest::Provide { id: id.clone() })?)
    }

    pub fn ping(&self) -> Result<Value, GraphError> {
        Ok(self.session.call_as(&GatewayRequest::Ping)?)
    }
}

/// What a connected peer can reach. Only local formulas are served.
pub struct GatewayFacet {
    graph: Weak<Graph>,
    peer: NodeId,
}

impl GatewayFacet {
    pub fn new(graph: Weak<Graph>, peer: NodeId) -> Self {
        Self { graph, peer }
    }
}

impl Bootstrap for GatewayFacet {
    fn dispatch(&self, request: Value) -> Result<Value, ErrorPayload> {
        let request: GatewayRequest = serde_json::from_value(request)
            .map_err(|e| ErrorPayload::new("protocol", format!("bad gateway request: {e}")))?;
        let graph = self
            .graph
            .upgrade()
            .ok_or_else(|| ErrorPayload::new("cancelled", "daemon is stopping"))?;
        match request {
            GatewayRequest::Ping => Ok(json!("pong")),
            GatewayRequest::Provide { id } => {
                tracing::debug!(peer = self.peer.short(), formula = %id, "peer provide");
                if !id.is_local_to(graph.node()) {
                    return Err(GraphError::UnknownReference {
                        reference: id.to_string(),
                    }
                    .to_payload());
                }
                graph
                    .provide_id(&id)
                    .map(|capability| capability.to_wire())
                    .map_err(|err| err.to_payload())
            }
        }
    }
}

/// Opens outbound peer sessions.
pub trait PeerDialer: Send + Sync + 'static {
    fn dial(
        &self,
        local: &NodeId,
        remote: &NodeId,
        addresses: &[String],
        bootstrap: Arc<dyn Bootstrap>,
        parent: &CancelToken,
    ) -> Result<Session, GraphError>;
}

/// Refuses every dial. For daemons without networking.
pub struct NoDialer;

impl PeerDialer for NoDialer {
    fn dial(
        &self,
        _local: &NodeId,
        remote: &NodeId,
        _addresses: &[String],
        _bootstrap: Arc<dyn Bootstrap>,
        _parent: &CancelToken,
    ) -> Result<Session, GraphError> {
        Err(GraphError::ConnectionRefused {
            node: remote.to_string(),
            reason: "networking is disabled".into(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct TcpDialer {
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl TcpDialer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_frame_bytes,
        }
    }

    fn dial_address(
        &self,
        local: &NodeId,
        remote: &NodeId,
        address: &str,
        bootstrap: &Arc<dyn Bootstrap>,
        parent: &CancelToken,
    ) -> Result<Session, GraphError> {
        let target = address.strip_prefix("tcp://").unwrap_or(address);
        let candidates: Vec<SocketAddr> = target
            .to_socket_addrs()
            .map_err(|e| refused(remote, format!("cannot resolve {address}: {e}")))?
            .collect();

        let mut last = refused(remote, format!("{address} resolved to nothing"));
        for addr in candidates {
            let stream = match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => stream,
                Err(e) => {
                    last = refused(remote, format!("connect {addr}: {e}"));
                    continue;
                }
            };
            let greeted = exchange_hello(&stream, local, self.max_frame_bytes)?;
            if &greeted != remote {
                return Err(refused(
                    remote,
                    format!("{addr} answered as node {}", greeted.short()),
                ));
            }
            let transport =
                Transport::tcp(stream).map_err(|e| refused(remote, format!("socket setup: {e}")))?;
            tracing::info!(node = remote.short(), address = %addr, "peer connected");
            return Ok(Session::open(
                transport,
                Arc::clone(bootstrap),
                parent,
                SessionOptions::named(format!("peer-out-{}", remote.short()))
                    .with_max_frame_bytes(self.max_frame_bytes),
            ));
        }
        Err(last)
    }
}

impl PeerDialer for TcpDialer {
    fn dial(
        &self,
        local: &NodeId,
        remote: &NodeId,
        addresses: &[String],
        bootstrap: Arc<dyn Bootstrap>,
        parent: &CancelToken,
    ) -> Result<Session, GraphError> {
        let mut last = refused(remote, "peer has no addresses");
        for address in addresses {
            match self.dial_address(local, remote, address, &bootstrap, parent) {
                Ok(session) => return Ok(session),
                Err(err) => {
                    tracing::debug!(node = remote.short(), address, error = %err, "dial failed");
                    last = err;
                }
            }
        }
        Err(last)
    }
}

fn refused(node: &NodeId, reason: impl Into<String>) -> GraphError {
    GraphError::ConnectionRefused {
        node: node.to_string(),
        reason: reason.into(),
    }
}

/// Send our `Hello`, read theirs. Returns the peer's node id.
pub fn exchange_hello(
    stream: &TcpStream,
    local: &NodeId,
    max_frame_bytes: usize,
) -> Result<NodeId, GraphError> {
    let protocol = |reason: String| GraphError::Session(SessionError::Protocol { reason });
    stream
        .set_read_timeout(Some(HELLO_TIMEOUT))
        .map_err(|e| protocol(format!("socket setup: {e}")))?;
    MessageWriter::new(stream, max_frame_bytes)
        .send(&Hello {
            node: local.clone(),
        })
        .map_err(|e| protocol(format!("send hello: {e}")))?;
    let hello: Hello = MessageReader::new(stream, max_frame_bytes)
        .recv()
        .map_err(|e| protocol(format!("read hello: {e}")))?
        .ok_or_else(|| protocol("connection closed before hello".into()))?;
    stream
        .set_read_timeout(None)
        .map_err(|e| protocol(format!("socket setup: {e}")))?;
    Ok(hello.node)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::TcpListener;
    use std::thread;

    use crate::daemon::session::NoBootstrap;

    #[test]
    fn hello_exchange_reports_both_nodes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_node = NodeId::generate();
        let client_node = NodeId::generate();

        let expected_client = client_node.clone();
        let server_id = server_node.clone();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let greeted = exchange_hello(&stream, &server_id, 1 << 20).unwrap();
            assert_eq!(greeted, expected_client);
        });

        let stream = TcpStream::connect(addr).unwrap();
        let greeted = exchange_hello(&stream, &client_node, 1 << 20).unwrap();
        assert_eq!(greeted, server_node);
        server.join().unwrap();
    }

    #[test]
    fn dialer_rejects_the_wrong_node() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let impostor = NodeId::generate();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let _ = exchange_hello(&stream, &impostor, 1 << 20);
        });

        let err = TcpDialer::new(1 << 20)
            .dial(
                &NodeId::generate(),
                &NodeId::generate(),
                &[format!("tcp://{addr}")],
                Arc::new(NoBootstrap),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert_eq!(err.code(), "connection_refused");
    }

    #[test]
    fn no_addresses_is_refused() {
        let err = TcpDialer::new(1 << 20)
            .dial(
                &NodeId::generate(),
                &NodeId::generate(),
                &[],
                Arc::new(NoBootstrap),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert_eq!(err.code(), "connection_refused");
    }
}
