//! The capability graph.
//!
//! `provide` turns a formula identifier into a live [`Capability`], reviving
//! it from its durable formula at most once per daemon lifetime. Each
//! identifier maps to a deferred cell that is in the table before any I/O
//! starts, so concurrent and diamond-shaped requests join one construction.
//!
//! Revival is a single dispatch over [`Formula`]. Dependencies are provided
//! recursively with a [`Trail`] of the identifiers being resolved; meeting
//! an identifier already on the trail is a corrupt (cyclic) formula.
//!
//! Values tied to a live resource (workers, peer gateways, remote values)
//! are evicted when that resource is cancelled, so the next `provide`
//! revives them afresh.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::{Value, json};
use thiserror::Error;

use crate::core::{
    CoreError, Formula, FormulaId, FormulaNumber, FormulaType, NodeId, PetName, parse_locator,
};
use crate::error::{Effect, Transience};
use crate::paths::DaemonPaths;

use super::agent::{Guest, Host};
use super::cancel::{CancelReason, CancelToken};
use super::content_store::{ContentStore, ReadableBlob, StagedBlob};
use super::deferred::{Abandoned, Deferred, Memo};
use super::durable::{StoreError, read_optional, write_once, write_replace};
use super::formula_store::FormulaStore;
use super::gateway::{GatewayFacet, PeerDialer, PeerGateway};
use super::pet_store::PetStore;
use super::remote_control::{RemoteControl, RemoteControlProvider};
use super::session::{Bootstrap, ErrorPayload, Session, SessionError};
use super::sync::lock;
use super::worker::{EndoWorker, WorkerError, WorkerLauncher, WorkerSettings};

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum GraphError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown reference `{reference}`")]
    UnknownReference { reference: String },
    #[error("corrupt formula {id}: {reason}")]
    CorruptFormula { id: String, reason: String },
    #[error("{names} code names but {values} pet names")]
    ArityMismatch { names: usize, values: usize },
    #[error("`{reference}` is a {actual}, expected a {expected}")]
    WrongType {
        reference: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("connection to node {node} refused: {reason}")]
    ConnectionRefused { node: String, reason: String },
    #[error(transparent)]
    Session(SessionError),
    #[error("remote error {0}")]
    Remote(ErrorPayload),
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },
    #[error("construction abandoned")]
    Abandoned,
}

impl GraphError {
    pub fn code(&self) -> &'static str {
        match self {
            GraphError::Core(e) => e.code(),
            GraphError::Store(e) => e.code(),
            GraphError::UnknownReference { .. } => "unknown_reference",
            GraphError::CorruptFormula { .. } => "corrupt_formula",
            GraphError::ArityMismatch { .. } => "arity_mismatch",
            GraphError::WrongType { .. } => "type_mismatch",
            GraphError::Worker(e) => e.code(),
            GraphError::ConnectionRefused { .. } => "connection_refused",
            GraphError::Session(e) => e.code(),
            GraphError::Remote(_) => "remote",
            GraphError::Cancelled { .. } => "cancelled",
            GraphError::Abandoned => "abandoned",
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            GraphError::Core(e) => e.transience(),
            GraphError::Store(e) => e.transience(),
            GraphError::Worker(e) => e.transience(),
            GraphError::Session(e) => e.transience(),
            GraphError::ConnectionRefused { .. } | GraphError::Abandoned => Transience::Retryable,
            GraphError::Remote(_) | GraphError::Cancelled { .. } => Transience::Unknown,
            GraphError::UnknownReference { .. }
            | GraphError::CorruptFormula { .. }
            | GraphError::ArityMismatch { .. }
            | GraphError::WrongType { .. } => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            GraphError::Core(e) => e.effect(),
            GraphError::Store(e) => e.effect(),
            GraphError::Worker(e) => e.effect(),
            GraphError::Session(e) => e.effect(),
            GraphError::ArityMismatch { .. } | GraphError::ConnectionRefused { .. } => {
                Effect::None
            }
            _ => Effect::Unknown,
        }
    }

    /// Wire form. Relayed payloads pass through untouched.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            GraphError::Remote(payload) => payload.clone(),
            GraphError::Worker(e) => e.to_payload(),
            GraphError::Session(e) => e.to_payload(),
            GraphError::ArityMismatch { names, values } => {
                ErrorPayload::new(self.code(), self.to_string())
                    .with_details(json!({ "names": names, "values": values }))
            }
            GraphError::Store(StoreError::IntegrityFailure { expected, actual }) => {
                ErrorPayload::new(self.code(), self.to_string()).with_details(json!({
                    "expected": expected.to_hex(),
                    "actual": actual.to_hex(),
                }))
            }
            other => ErrorPayload::new(other.code(), other.to_string()),
        }
    }
}

impl From<SessionError> for GraphError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Remote(payload) => GraphError::Remote(payload),
            other => GraphError::Session(other),
        }
    }
}

impl From<Abandoned> for GraphError {
    fn from(_: Abandoned) -> Self {
        GraphError::Abandoned
    }
}

/// A constructed value.
#[derive(Clone, Debug)]
pub enum Capability {
    Data(Value),
    Blob(ReadableBlob),
    Worker(Arc<EndoWorker>),
    PetStore(Arc<PetStore>),
    Host(Arc<Host>),
    Guest(Arc<Guest>),
    Gateway(Arc<PeerGateway>),
}

impl Capability {
    pub fn kind(&self) -> &'static str {
        match self {
            Capability::Data(_) => "value",
            Capability::Blob(_) => "readable-blob",
            Capability::Worker(_) => "worker",
            Capability::PetStore(_) => "pet-store",
            Capability::Host(_) => "host",
            Capability::Guest(_) => "guest",
            Capability::Gateway(_) => "peer",
        }
    }

    /// JSON handed to workers, peers and clients. Live objects travel as
    /// descriptors.
    pub fn to_wire(&self) -> Value {
        match self {
            Capability::Data(value) => value.clone(),
            Capability::Blob(blob) => {
                json!({ "@type": "readable-blob", "sha512": blob.sha512().to_hex() })
            }
            Capability::Worker(worker) => json!({ "@type": "worker", "id": worker.id() }),
            Capability::PetStore(store) => json!({ "@type": "pet-store", "number": store.number() }),
            Capability::Host(host) => json!({ "@type": "host", "id": host.id() }),
            Capability::Guest(guest) => json!({ "@type": "guest", "id": guest.id() }),
            Capability::Gateway(gateway) => json!({ "@type": "peer", "node": gateway.node() }),
        }
    }

    /// The JSON value of a data capability, or the descriptor of anything
    /// else.
    pub fn into_value(self) -> Value {
        match self {
            Capability::Data(value) => value,
            other => other.to_wire(),
        }
    }

    fn mismatch(&self, reference: &FormulaId, expected: &'static str) -> GraphError {
        GraphError::WrongType {
            reference: reference.to_string(),
            expected,
            actual: self.kind(),
        }
    }

    pub fn into_worker(self, reference: &FormulaId) -> Result<Arc<EndoWorker>, GraphError> {
        match self {
            Capability::Worker(worker) => Ok(worker),
            other => Err(other.mismatch(reference, "worker")),
        }
    }

    pub fn into_blob(self, reference: &FormulaId) -> Result<ReadableBlob, GraphError> {
        match self {
            Capability::Blob(blob) => Ok(blob),
            other => Err(other.mismatch(reference, "readable-blob")),
        }
    }

    pub fn into_pet_store(self, reference: &FormulaId) -> Result<Arc<PetStore>, GraphError> {
        match self {
            Capability::PetStore(store) => Ok(store),
            other => Err(other.mismatch(reference, "pet-store")),
        }
    }

    pub fn into_host(self, reference: &FormulaId) -> Result<Arc<Host>, GraphError> {
        match self {
            Capability::Host(host) => Ok(host),
            other => Err(other.mismatch(reference, "host")),
        }
    }

    pub fn into_gateway(self, reference: &FormulaId) -> Result<Arc<PeerGateway>, GraphError> {
        match self {
            Capability::Gateway(gateway) => Ok(gateway),
            other => Err(other.mismatch(reference, "peer")),
        }
    }
}

/// Identifiers currently being resolved, innermost first.
#[derive(Clone, Copy)]
pub struct Trail<'a> {
    id: &'a FormulaId,
    parent: Option<&'a Trail<'a>>,
}

impl<'a> Trail<'a> {
    fn extend(parent: Option<&'a Trail<'a>>, id: &'a FormulaId) -> Self {
        Trail { id, parent }
    }

    fn contains(trail: Option<&Trail<'_>>, id: &FormulaId) -> bool {
        let mut cursor = trail;
        while let Some(step) = cursor {
            if step.id == id {
                return true;
            }
            cursor = step.parent;
        }
        false
    }
}

/// Gateway for a peer, possibly still being dialed.
pub type GatewayCell = Deferred<Arc<PeerGateway>, GraphError>;

pub struct GraphOptions {
    pub node: NodeId,
    pub paths: DaemonPaths,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub dialer: Arc<dyn PeerDialer>,
    pub settings: WorkerSettings,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GraphStats {
    /// Formulas revived since start.
    pub revivals: u64,
    /// Entries in the value table.
    pub values: usize,
}

pub struct Graph {
    node: NodeId,
    paths: DaemonPaths,
    formulas: FormulaStore,
    content: ContentStore,
    values: Arc<Memo<FormulaId, Capability, GraphError>>,
    // Non-local formula id -> local `remote` formula id.
    remotes: Mutex<HashMap<FormulaId, FormulaId>>,
    root_host: Mutex<Option<FormulaId>>,
    launcher: Arc<dyn WorkerLauncher>,
    dialer: Arc<dyn PeerDialer>,
    settings: WorkerSettings,
    remote_controls: RemoteControlProvider<GatewayCell>,
    cancel: CancelToken,
    revivals: AtomicU64,
    this: Weak<Graph>,
}

impl Graph {
    /// The graph's token is a child of `parent`; every worker and peer
    /// connection hangs off it.
    pub fn new(options: GraphOptions, parent: &CancelToken) -> Arc<Graph> {
        let GraphOptions {
            node,
            paths,
            launcher,
            dialer,
            settings,
        } = options;
        Arc::new_cyclic(|this| Graph {
            formulas: FormulaStore::new(paths.clone()),
            content: ContentStore::new(&paths),
            values: Arc::new(Memo::new()),
            remotes: Mutex::new(HashMap::new()),
            root_host: Mutex::new(None),
            remote_controls: RemoteControlProvider::new(node.clone()),
            cancel: parent.child(),
            revivals: AtomicU64::new(0),
            this: this.clone(),
            node,
            paths,
            launcher,
            dialer,
            settings,
        })
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    pub fn formulas(&self) -> &FormulaStore {
        &self.formulas
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn settings(&self) -> WorkerSettings {
        self.settings
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            revivals: self.revivals.load(Ordering::Relaxed),
            values: self.values.len(),
        }
    }

    pub fn remote_control(&self, node: &NodeId) -> Arc<RemoteControl<GatewayCell>> {
        self.remote_controls.provide(node)
    }

    /// Cancel every worker and peer connection.
    pub fn shutdown(&self, reason: CancelReason) {
        self.cancel.cancel(reason);
    }

    /// Persist `formula` under a fresh number (or its digest, for blobs).
    pub fn formulate(&self, formula: &Formula) -> Result<FormulaId, GraphError> {
        let number = match formula {
            Formula::ReadableBlob { content } => FormulaNumber::from_digest(content),
            _ => FormulaNumber::generate(),
        };
        self.formulas.write(&number, formula)?;
        let id = FormulaId::new(number, self.node.clone());
        tracing::debug!(formula = %id, formula_type = %formula.formula_type(), "formulated");
        Ok(id)
    }

    /// A host with its own pet store and main worker.
    pub fn formulate_host(&self) -> Result<FormulaId, GraphError> {
        let pet_store = self.formulate(&Formula::PetStore)?;
        let worker = self.formulate(&Formula::Worker)?;
        self.formulate(&Formula::Host { pet_store, worker })
    }

    pub fn formula_type_of(&self, id: &FormulaId) -> Result<FormulaType, GraphError> {
        if !id.is_local_to(&self.node) {
            return Ok(FormulaType::Remote);
        }
        Ok(self.formulas.read(id)?.formula_type())
    }

    pub fn provide_id(&self, id: &FormulaId) -> Result<Capability, GraphError> {
        self.provide_in(id, None)
    }

    /// Accepts `endo://` locators. Locators of other nodes resolve through
    /// the known peer for that node.
    pub fn provide_locator(&self, raw: &str) -> Result<Capability, GraphError> {
        let locator = parse_locator(raw)?;
        self.provide_id(&locator.id)
    }

    fn provide_in(&self, id: &FormulaId, trail: Option<&Trail<'_>>) -> Result<Capability, GraphError> {
        if Trail::contains(trail, id) {
            return Err(GraphError::CorruptFormula {
                id: id.to_string(),
                reason: "formula depends on itself".into(),
            });
        }
        if self.cancel.is_cancelled() {
            return Err(GraphError::Cancelled {
                reason: "daemon is stopping".into(),
            });
        }
        if !id.is_local_to(&self.node) {
            let remote = self.remote_formula_for(id)?;
            return self.provide_in(&remote, trail);
        }
        self.values.get_or_construct(id, || {
            self.revivals.fetch_add(1, Ordering::Relaxed);
            let formula = self.formulas.read(id)?;
            let trail = Trail::extend(trail, id);
            tracing::debug!(formula = %id, formula_type = %formula.formula_type(), "reviving");
            self.revive(Some(id), &formula, Some(&trail))
        })
    }

    /// Build a value from a formula that was never persisted. Nothing is
    /// memoized.
    pub fn revive_detached(&self, formula: &Formula) -> Result<Capability, GraphError> {
        self.revive(None, formula, None)
    }

    fn revive(
        &self,
        id: Option<&FormulaId>,
        formula: &Formula,
        trail: Option<&Trail<'_>>,
    ) -> Result<Capability, GraphError> {
        match formula {
            Formula::Eval {
                worker,
                source,
                names,
                values,
            } => {
                check_arity(names, values)?;
                let worker_cap = self.provide_in(worker, trail)?.into_worker(worker)?;
                self.evaluate_in(&worker_cap, source, names, values, trail)
            }
            Formula::Worker => {
                let id = require_id(id, formula)?;
                let worker = EndoWorker::spawn(
                    id.clone(),
                    &self.paths,
                    self.launcher.as_ref(),
                    &self.cancel,
                    self.settings,
                )?;
                self.evict_when_cancelled(id, worker.cancel_token());
                Ok(Capability::Worker(worker))
            }
            Formula::ReadableBlob { content } => {
                self.content.verify(content)?;
                Ok(Capability::Blob(ReadableBlob::new(*content, self.content.clone())))
            }
            Formula::PetStore => {
                let id = require_id(id, formula)?;
                let store = PetStore::open(&self.paths, id.number().clone())?;
                Ok(Capability::PetStore(Arc::new(store)))
            }
            Formula::Host { pet_store, worker } => {
                let id = require_id(id, formula)?;
                let store = self.provide_in(pet_store, trail)?.into_pet_store(pet_store)?;
                Ok(Capability::Host(Arc::new(Host::new(
                    id.clone(),
                    store,
                    worker.clone(),
                    self.this.clone(),
                ))))
            }
            Formula::Guest { host, pet_store } => {
                let id = require_id(id, formula)?;
                let store = self.provide_in(pet_store, trail)?.into_pet_store(pet_store)?;
                Ok(Capability::Guest(Arc::new(Guest::new(
                    id.clone(),
                    host.clone(),
                    store,
                    self.this.clone(),
                ))))
            }
            Formula::Bundle {
                worker,
                bundle,
                powers,
            } => {
                let worker_cap = self.provide_in(worker, trail)?.into_worker(worker)?;
                self.import_in(&worker_cap, bundle, powers, trail)
            }
            Formula::Peer { node, addresses } => self.connect_peer(id, node, addresses),
            Formula::Remote { peer, id: remote } => {
                let gateway = self.provide_in(peer, trail)?.into_gateway(peer)?;
                let value = gateway.provide(remote)?;
                if let Some(id) = id {
                    self.evict_when_cancelled(id, gateway.closed());
                }
                Ok(Capability::Data(value))
            }
        }
    }

    fn evaluate_in(
        &self,
        worker: &EndoWorker,
        source: &str,
        names: &[String],
        values: &[FormulaId],
        trail: Option<&Trail<'_>>,
    ) -> Result<Capability, GraphError> {
        let endowments = values
            .iter()
            .map(|value| self.provide_in(value, trail).map(|cap| cap.to_wire()))
            .collect::<Result<Vec<_>, _>>()?;
        let result = worker.evaluate(source, names.to_vec(), endowments)?;
        Ok(Capability::Data(result))
    }

    fn import_in(
        &self,
        worker: &EndoWorker,
        bundle: &FormulaId,
        powers: &FormulaId,
        trail: Option<&Trail<'_>>,
    ) -> Result<Capability, GraphError> {
        let text = self.provide_in(bundle, trail)?.into_blob(bundle)?.text()?;
        let powers = self.provide_in(powers, trail)?.to_wire();
        let result = worker.import_bundle(&text, powers)?;
        Ok(Capability::Data(result))
    }

    /// Run an `eval` or `bundle` formula in a worker launched for this one
    /// call. Neither the worker nor the formula is persisted or memoized, and
    /// the worker is terminated before this returns.
    pub fn revive_in_transient_worker(
        &self,
        build: impl FnOnce(FormulaId) -> Formula,
    ) -> Result<Capability, GraphError> {
        let id = FormulaId::new(FormulaNumber::generate(), self.node.clone());
        let worker = EndoWorker::spawn(
            id.clone(),
            &self.paths,
            self.launcher.as_ref(),
            &self.cancel,
            self.settings,
        )?;
        let result = match build(id) {
            Formula::Eval {
                source,
                names,
                values,
                ..
            } => check_arity(&names, &values)
                .and_then(|()| self.evaluate_in(&worker, &source, &names, &values, None)),
            Formula::Bundle { bundle, powers, .. } => {
                self.import_in(&worker, &bundle, &powers, None)
            }
            other => Err(GraphError::CorruptFormula {
                id: "(detached)".into(),
                reason: format!("{} formulas do not run in a worker", other.formula_type()),
            }),
        };
        if let Err(err) = worker.terminate() {
            tracing::warn!(worker = %worker.id(), error = %err, "transient worker did not stop cleanly");
        }
        result
    }

    /// Drop the memoized value for `id` once `token` fires, unless a newer
    /// construction replaced it.
    fn evict_when_cancelled(&self, id: &FormulaId, token: &CancelToken) {
        let Some(cell) = self.values.get(id) else {
            return;
        };
        let values = Arc::downgrade(&self.values);
        let key = id.clone();
        token.on_cancel(move |reason| {
            if let Some(values) = values.upgrade()
                && values.evict_if_same(&key, &cell)
            {
                tracing::debug!(formula = %key, reason = %reason, "value evicted");
            }
        });
    }

    fn connect_peer(
        &self,
        id: Option<&FormulaId>,
        node: &NodeId,
        addresses: &[String],
    ) -> Result<Capability, GraphError> {
        if node == &self.node {
            return Err(GraphError::ConnectionRefused {
                node: node.to_string(),
                reason: "peer formula names this node".into(),
            });
        }
        let control = self.remote_controls.provide(node);
        let connection = self.cancel.child();
        let candidate = GatewayCell::new();
        let gateway = control.connect(candidate.clone(), &connection, || {
            candidate.settle(self.dial_peer(node, addresses, &connection));
        });
        if let Some(id) = id {
            self.evict_when_cancelled(id, &connection);
        }
        Ok(Capability::Gateway(gateway.wait()?))
    }

    fn dial_peer(
        &self,
        node: &NodeId,
        addresses: &[String],
        connection: &CancelToken,
    ) -> Result<Arc<PeerGateway>, GraphError> {
        match self
            .dialer
            .dial(&self.node, node, addresses, self.gateway_facet(node), connection)
        {
            Ok(session) => Ok(Arc::new(PeerGateway::new(node.clone(), session, connection))),
            Err(err) => {
                connection.cancel(CancelReason::closed(format!("dial failed: {err}")));
                Err(err)
            }
        }
    }

    /// The bootstrap a peer session with `peer` serves.
    pub fn gateway_facet(&self, peer: &NodeId) -> Arc<dyn Bootstrap> {
        Arc::new(GatewayFacet::new(self.this.clone(), peer.clone()))
    }

    /// Offer an inbound peer session to remote control. A refused session is
    /// closed before this returns.
    pub fn accept_peer(&self, node: &NodeId, session: Session, connection: &CancelToken) -> bool {
        let cell = GatewayCell::new();
        cell.resolve(Arc::new(PeerGateway::new(node.clone(), session, connection)));
        let accepted = self.remote_controls.provide(node).accept(cell, connection);
        tracing::info!(node = node.short(), accepted, "inbound peer connection");
        accepted
    }

    pub fn record_known_peer(&self, node: &NodeId, peer: &FormulaId) -> Result<(), GraphError> {
        write_replace(&self.paths.known_peer_path(node), peer.to_string().as_bytes())?;
        Ok(())
    }

    pub fn known_peer(&self, node: &NodeId) -> Result<Option<FormulaId>, GraphError> {
        let Some(bytes) = read_optional(&self.paths.known_peer_path(node))? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&bytes);
        Ok(Some(FormulaId::parse(text.trim())?))
    }

    fn remote_formula_for(&self, id: &FormulaId) -> Result<FormulaId, GraphError> {
        if let Some(existing) = lock(&self.remotes).get(id) {
            return Ok(existing.clone());
        }
        let peer = self
            .known_peer(id.node())?
            .ok_or_else(|| GraphError::ConnectionRefused {
                node: id.node().to_string(),
                reason: "no known peer for node".into(),
            })?;
        let remote = self.formulate(&Formula::Remote {
            peer,
            id: id.clone(),
        })?;
        Ok(lock(&self.remotes)
            .entry(id.clone())
            .or_insert(remote)
            .clone())
    }

    /// Stream `reader` into the content store and publish it as a
    /// `readable-blob`. The pet name (if any) is written before the formula,
    /// and both before the blob becomes visible.
    pub fn store_blob(
        &self,
        reader: impl Read,
        name: Option<(&PetStore, &PetName)>,
    ) -> Result<(FormulaId, ReadableBlob), GraphError> {
        let staged = self.content.stage(reader)?;
        self.publish_blob(staged, name)
    }

    /// Publish bytes staged by the content store, as [`Graph::store_blob`]
    /// does.
    pub fn publish_blob(
        &self,
        staged: StagedBlob,
        name: Option<(&PetStore, &PetName)>,
    ) -> Result<(FormulaId, ReadableBlob), GraphError> {
        let digest = staged.digest();
        let bytes = staged.len();
        let formula = Formula::ReadableBlob { content: digest };
        let id = FormulaId::new(FormulaNumber::from_digest(&digest), self.node.clone());
        if let Some((store, name)) = name {
            store.write(name, &id, FormulaType::ReadableBlob)?;
        }
        self.formulas.write(id.number(), &formula)?;
        self.content.commit(staged)?;
        tracing::info!(formula = %id, bytes, "stored");
        Ok((id, ReadableBlob::new(digest, self.content.clone())))
    }

    /// The root host, formulated on first use and recorded at
    /// `<state>/root-host`.
    pub fn root_host(&self) -> Result<Arc<Host>, GraphError> {
        let id = self.root_host_id()?;
        self.provide_id(&id)?.into_host(&id)
    }

    pub fn root_host_id(&self) -> Result<FormulaId, GraphError> {
        let mut cached = lock(&self.root_host);
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }
        let path = self.paths.root_host_path();
        let id = match read_optional(&path)? {
            Some(bytes) => FormulaId::parse(String::from_utf8_lossy(&bytes).trim())?,
            None => {
                let id = self.formulate_host()?;
                write_once(&path, format!("{id}\n").as_bytes())?;
                tracing::info!(host = %id, "root host formulated");
                id
            }
        };
        *cached = Some(id.clone());
        Ok(id)
    }
}

fn check_arity(names: &[String], values: &[FormulaId]) -> Result<(), GraphError> {
    if names.len() == values.len() {
        Ok(())
    } else {
        Err(GraphError::ArityMismatch {
            names: names.len(),
            values: values.len(),
        })
    }
}

fn require_id<'a>(id: Option<&'a FormulaId>, formula: &Formula) -> Result<&'a FormulaId, GraphError> {
    id.ok_or_else(|| GraphError::CorruptFormula {
        id: "(detached)".into(),
        reason: format!("{} formulas must be persisted", formula.formula_type()),
    })
}
