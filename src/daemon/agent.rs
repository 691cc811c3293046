//! Agents: the objects clients act through.
//!
//! A [`Host`] owns a pet store and a main worker and can formulate new
//! values. A [`Guest`] is a narrower agent: it can name and provide what it
//! was given, but not make workers or evaluate code.
//!
//! Every operation that writes validates its names (and arity) before the
//! first durable write.

use std::io::Read;
use std::sync::{Arc, Weak};

use crate::core::{
    Formula, FormulaId, FormulaType, NodeId, PetName, SpecialName, format_locator,
};

use super::content_store::{BlobWriter, ReadableBlob};
use super::graph::{Capability, Graph, GraphError};
use super::pet_store::PetStore;
use super::worker::EndoWorker;

fn upgrade(graph: &Weak<Graph>) -> Result<Arc<Graph>, GraphError> {
    graph.upgrade().ok_or_else(|| GraphError::Cancelled {
        reason: "daemon is stopping".into(),
    })
}

fn parse_optional(name: Option<&str>) -> Result<Option<PetName>, GraphError> {
    Ok(name.map(PetName::parse).transpose()?)
}

fn unknown(reference: &str) -> GraphError {
    GraphError::UnknownReference {
        reference: reference.to_string(),
    }
}

/// Resolve a reference an agent was handed: an `endo://` locator, a
/// `<number>:<node>` id, or a name.
fn provide_reference(
    graph: &Graph,
    reference: &str,
    identify: impl FnOnce(&str) -> Result<Option<FormulaId>, GraphError>,
) -> Result<Capability, GraphError> {
    if reference.starts_with("endo://") {
        return graph.provide_locator(reference);
    }
    if reference.contains(':') {
        return graph.provide_id(&FormulaId::parse(reference)?);
    }
    let id = identify(reference)?.ok_or_else(|| unknown(reference))?;
    graph.provide_id(&id)
}

fn locate_id(graph: &Graph, id: &FormulaId) -> Result<String, GraphError> {
    match graph.formulas().read(id) {
        Ok(Formula::Remote { id: remote, .. }) => Ok(format_locator(&remote, FormulaType::Remote)),
        Ok(formula) => Ok(format_locator(id, formula.formula_type())),
        Err(err) if !id.is_local_to(graph.node()) => {
            tracing::debug!(formula = %id, error = %err, "locating foreign id");
            Ok(format_locator(id, FormulaType::Remote))
        }
        Err(err) => Err(err.into()),
    }
}

/// An upload begun with [`Host::begin_store`].
pub struct PendingBlob {
    writer: BlobWriter,
    name: Option<PetName>,
}

impl std::fmt::Debug for PendingBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingBlob")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PendingBlob {
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64, GraphError> {
        self.writer.append(bytes)?;
        Ok(self.writer.len())
    }
}

enum WorkerChoice {
    Existing(FormulaId),
    Fresh,
}

#[derive(Debug)]
pub struct Host {
    id: FormulaId,
    pet_store: Arc<PetStore>,
    worker: FormulaId,
    graph: Weak<Graph>,
}

impl Host {
    pub fn new(id: FormulaId, pet_store: Arc<PetStore>, worker: FormulaId, graph: Weak<Graph>) -> Self {
        Self {
            id,
            pet_store,
            worker,
            graph,
        }
    }

    pub fn id(&self) -> &FormulaId {
        &self.id
    }

    pub fn main_worker(&self) -> &FormulaId {
        &self.worker
    }

    pub fn pet_store(&self) -> &PetStore {
        &self.pet_store
    }

    fn graph(&self) -> Result<Arc<Graph>, GraphError> {
        upgrade(&self.graph)
    }

    /// `SELF` and `MAIN` resolve without a record; `NEW` names nothing.
    pub fn identify(&self, name: &str) -> Result<Option<FormulaId>, GraphError> {
        match SpecialName::parse(name) {
            Some(SpecialName::SelfAgent) => Ok(Some(self.id.clone())),
            Some(SpecialName::Main) => Ok(Some(self.worker.clone())),
            Some(SpecialName::New) => Ok(None),
            None => Ok(self.pet_store.identify(&PetName::parse(name)?)?),
        }
    }

    fn resolve(&self, name: &str) -> Result<FormulaId, GraphError> {
        self.identify(name)?.ok_or_else(|| unknown(name))
    }

    pub fn provide(&self, reference: &str) -> Result<Capability, GraphError> {
        let graph = self.graph()?;
        provide_reference(&graph, reference, |name| self.identify(name))
    }

    /// Content-address `reader` and optionally name it.
    pub fn store(&self, reader: impl Read, name: Option<&str>) -> Result<ReadableBlob, GraphError> {
        let name = parse_optional(name)?;
        let graph = self.graph()?;
        let (_, blob) = graph.store_blob(reader, name.as_ref().map(|n| (&*self.pet_store, n)))?;
        Ok(blob)
    }

    /// Start a blob that arrives in pieces. The name is checked now, before
    /// any bytes are written.
    pub fn begin_store(&self, name: Option<&str>) -> Result<PendingBlob, GraphError> {
        let name = parse_optional(name)?;
        let writer = self.graph()?.content().writer()?;
        Ok(PendingBlob { writer, name })
    }

    pub fn finish_store(&self, pending: PendingBlob) -> Result<ReadableBlob, GraphError> {
        let PendingBlob { writer, name } = pending;
        let staged = writer.finish()?;
        let graph = self.graph()?;
        let (_, blob) =
            graph.publish_blob(staged, name.as_ref().map(|n| (&*self.pet_store, n)))?;
        Ok(blob)
    }

    fn name_new(
        &self,
        graph: &Graph,
        formula: &Formula,
        name: Option<&PetName>,
    ) -> Result<FormulaId, GraphError> {
        let id = graph.formulate(formula)?;
        if let Some(name) = name {
            self.pet_store.write(name, &id, formula.formula_type())?;
        }
        Ok(id)
    }

    pub fn make_worker(&self, name: Option<&str>) -> Result<Arc<EndoWorker>, GraphError> {
        let name = parse_optional(name)?;
        let graph = self.graph()?;
        let id = self.name_new(&graph, &Formula::Worker, name.as_ref())?;
        tracing::info!(worker = %id, "worker formulated");
        graph.provide_id(&id)?.into_worker(&id)
    }

    /// `MAIN`, `NEW` or a named worker.
    fn worker_for(&self, worker: &str) -> Result<WorkerChoice, GraphError> {
        match SpecialName::parse(worker) {
            Some(SpecialName::New) => Ok(WorkerChoice::Fresh),
            _ => Ok(WorkerChoice::Existing(self.resolve(worker)?)),
        }
    }

    /// With a `result_name` the formula (and a fresh worker, if asked for)
    /// and the name are persisted before anything is provided. Without one
    /// the formula runs detached, and a fresh worker lives only for the call.
    fn run_in(
        &self,
        graph: &Graph,
        worker: WorkerChoice,
        result_name: Option<PetName>,
        build: impl FnOnce(FormulaId) -> Formula,
    ) -> Result<Capability, GraphError> {
        match (worker, result_name) {
            (WorkerChoice::Fresh, None) => graph.revive_in_transient_worker(build),
            (WorkerChoice::Existing(worker), None) => graph.revive_detached(&build(worker)),
            (worker, Some(name)) => {
                let worker = match worker {
                    WorkerChoice::Existing(id) => id,
                    WorkerChoice::Fresh => graph.formulate(&Formula::Worker)?,
                };
                let id = self.name_new(graph, &build(worker), Some(&name))?;
                graph.provide_id(&id)
            }
        }
    }

    /// Evaluate `source` in a worker with `code_names[i]` bound to the value
    /// named `pet_names[i]`.
    pub fn evaluate(
        &self,
        worker: &str,
        source: &str,
        code_names: Vec<String>,
        pet_names: Vec<String>,
        result_name: Option<&str>,
    ) -> Result<Capability, GraphError> {
        let result_name = parse_optional(result_name)?;
        if code_names.len() != pet_names.len() {
            return Err(GraphError::ArityMismatch {
                names: code_names.len(),
                values: pet_names.len(),
            });
        }
        let graph = self.graph()?;
        let values = pet_names
            .iter()
            .map(|name| self.resolve(name))
            .collect::<Result<Vec<_>, _>>()?;
        let worker = self.worker_for(worker)?;
        self.run_in(&graph, worker, result_name, |worker| Formula::Eval {
            worker,
            source: source.to_string(),
            names: code_names,
            values,
        })
    }

    /// Import the bundle text named `bundle_name` in a worker, endowed with
    /// the value named `powers_name`.
    pub fn make_bundle(
        &self,
        worker: &str,
        bundle_name: &str,
        powers_name: &str,
        result_name: Option<&str>,
    ) -> Result<Capability, GraphError> {
        let result_name = parse_optional(result_name)?;
        let graph = self.graph()?;
        let bundle = self.resolve(bundle_name)?;
        let powers = self.resolve(powers_name)?;
        let worker = self.worker_for(worker)?;
        self.run_in(&graph, worker, result_name, |worker| Formula::Bundle {
            worker,
            bundle,
            powers,
        })
    }

    pub fn provide_guest(&self, name: Option<&str>) -> Result<Arc<Guest>, GraphError> {
        let name = parse_optional(name)?;
        let graph = self.graph()?;
        let pet_store = graph.formulate(&Formula::PetStore)?;
        let formula = Formula::Guest {
            host: self.id.clone(),
            pet_store,
        };
        let id = self.name_new(&graph, &formula, name.as_ref())?;
        match graph.provide_id(&id)? {
            Capability::Guest(guest) => Ok(guest),
            other => Err(GraphError::WrongType {
                reference: id.to_string(),
                expected: "guest",
                actual: other.kind(),
            }),
        }
    }

    pub fn provide_host(&self, name: Option<&str>) -> Result<Arc<Host>, GraphError> {
        let name = parse_optional(name)?;
        let graph = self.graph()?;
        let id = graph.formulate_host()?;
        if let Some(name) = &name {
            self.pet_store.write(name, &id, FormulaType::Host)?;
        }
        graph.provide_id(&id)?.into_host(&id)
    }

    pub fn locate(&self, name: &str) -> Result<String, GraphError> {
        let graph = self.graph()?;
        let id = self.resolve(name)?;
        locate_id(&graph, &id)
    }

    pub fn list(&self) -> Result<Vec<String>, GraphError> {
        Ok(self
            .pet_store
            .list()?
            .into_iter()
            .map(String::from)
            .collect())
    }

    pub fn remove(&self, name: &str) -> Result<(), GraphError> {
        Ok(self.pet_store.remove(&PetName::parse(name)?)?)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), GraphError> {
        let from = PetName::parse(from)?;
        let to = PetName::parse(to)?;
        Ok(self.pet_store.rename(&from, &to)?)
    }

    /// Persist a `peer` formula and remember it as the route to `node`.
    pub fn add_peer(
        &self,
        name: &str,
        node: NodeId,
        addresses: Vec<String>,
    ) -> Result<FormulaId, GraphError> {
        let name = PetName::parse(name)?;
        let graph = self.graph()?;
        if &node == graph.node() {
            return Err(GraphError::ConnectionRefused {
                node: node.to_string(),
                reason: "cannot peer with this node".into(),
            });
        }
        let formula = Formula::Peer {
            node: node.clone(),
            addresses,
        };
        let id = self.name_new(&graph, &formula, Some(&name))?;
        graph.record_known_peer(&node, &id)?;
        tracing::info!(node = node.short(), peer = %id, "peer added");
        Ok(id)
    }

    pub fn terminate_worker(&self, name: &str) -> Result<(), GraphError> {
        let graph = self.graph()?;
        let id = self.resolve(name)?;
        let worker = graph.provide_id(&id)?.into_worker(&id)?;
        Ok(worker.terminate()?)
    }
}

#[derive(Debug)]
pub struct Guest {
    id: FormulaId,
    host: FormulaId,
    pet_store: Arc<PetStore>,
    graph: Weak<Graph>,
}

impl Guest {
    pub fn new(id: FormulaId, host: FormulaId, pet_store: Arc<PetStore>, graph: Weak<Graph>) -> Self {
        Self {
            id,
            host,
            pet_store,
            graph,
        }
    }

    pub fn id(&self) -> &FormulaId {
        &self.id
    }

    pub fn host_id(&self) -> &FormulaId {
        &self.host
    }

    pub fn pet_store(&self) -> &PetStore {
        &self.pet_store
    }

    pub fn identify(&self, name: &str) -> Result<Option<FormulaId>, GraphError> {
        match SpecialName::parse(name) {
            Some(SpecialName::SelfAgent) => Ok(Some(self.id.clone())),
            Some(SpecialName::Main | SpecialName::New) => Ok(None),
            None => Ok(self.pet_store.identify(&PetName::parse(name)?)?),
        }
    }

    pub fn provide(&self, reference: &str) -> Result<Capability, GraphError> {
        let graph = upgrade(&self.graph)?;
        provide_reference(&graph, reference, |name| self.identify(name))
    }

    /// Name a value this guest was handed by id.
    pub fn adopt(&self, name: &str, id: &FormulaId) -> Result<(), GraphError> {
        let name = PetName::parse(name)?;
        let graph = upgrade(&self.graph)?;
        let formula_type = graph.formula_type_of(id)?;
        Ok(self.pet_store.write(&name, id, formula_type)?)
    }

    pub fn locate(&self, name: &str) -> Result<String, GraphError> {
        let graph = upgrade(&self.graph)?;
        let id = self.identify(name)?.ok_or_else(|| unknown(name))?;
        locate_id(&graph, &id)
    }

    pub fn list(&self) -> Result<Vec<String>, GraphError> {
        Ok(self
            .pet_store
            .list()?
            .into_iter()
            .map(String::from)
            .collect())
    }

    pub fn remove(&self, name: &str) -> Result<(), GraphError> {
        Ok(self.pet_store.remove(&PetName::parse(name)?)?)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), GraphError> {
        Ok(self
            .pet_store
            .rename(&PetName::parse(from)?, &PetName::parse(to)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::time::Duration;

    use serde_json::json;

    use crate::core::{FormulaNumber, parse_locator};
    use crate::test_harness::TestGraph;

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn storing_the_same_bytes_twice_is_idempotent() {
        let t = TestGraph::new();
        let host = t.host();
        let a = host.store(&b"same bytes"[..], Some("first")).unwrap();
        let b = host.store(&b"same bytes"[..], Some("second")).unwrap();
        assert_eq!(a.sha512(), b.sha512());
        assert_eq!(
            host.identify("first").unwrap(),
            host.identify("second").unwrap()
        );
        let blobs = fs::read_dir(t.paths().content_dir()).unwrap().count();
        assert_eq!(blobs, 1);
    }

    #[test]
    fn pieced_store_matches_a_whole_store() {
        let t = TestGraph::new();
        let host = t.host();
        let mut pending = host.begin_store(Some("pieced")).unwrap();
        pending.append(b"same ").unwrap();
        assert_eq!(pending.append(b"bytes").unwrap(), 10);
        let pieced = host.finish_store(pending).unwrap();
        let whole = host.store(&b"same bytes"[..], Some("whole")).unwrap();
        assert_eq!(pieced.sha512(), whole.sha512());
        assert_eq!(
            host.identify("pieced").unwrap(),
            host.identify("whole").unwrap()
        );
        assert_eq!(host.begin_store(Some("No")).unwrap_err().code(), "invalid_name");
    }

    #[test]
    fn invalid_store_name_writes_nothing() {
        let t = TestGraph::new();
        let host = t.host();
        let before = t.formula_count();
        let err = host.store(&b"data"[..], Some("Bad-Name")).unwrap_err();
        assert_eq!(err.code(), "invalid_name");
        assert_eq!(t.formula_count(), before);
        assert!(!t.paths().content_dir().exists() || fs::read_dir(t.paths().content_dir()).unwrap().count() == 0);
    }

    #[test]
    fn corrupted_blob_fails_integrity() {
        let t = TestGraph::new();
        let host = t.host();
        let blob = host.store(&b"precious"[..], Some("doc")).unwrap();
        fs::write(t.paths().content_path(&blob.sha512()), b"tampered").unwrap();

        let err = host.provide("doc").unwrap_err();
        assert_eq!(err.code(), "integrity_failure");
        let err = host
            .evaluate("MAIN", "d", strings(&["d"]), strings(&["doc"]), None)
            .unwrap_err();
        assert_eq!(err.code(), "integrity_failure");
    }

    #[test]
    fn blob_tampered_after_revival_fails_on_read() {
        let t = TestGraph::new();
        let host = t.host();
        let blob = host.store(&b"precious"[..], Some("doc")).unwrap();
        let Capability::Blob(provided) = host.provide("doc").unwrap() else {
            panic!("expected a blob");
        };
        fs::write(t.paths().content_path(&blob.sha512()), b"tampered").unwrap();
        assert_eq!(provided.text().unwrap_err().code(), "integrity_failure");
    }

    #[test]
    fn arity_mismatch_fails_before_any_write() {
        let t = TestGraph::new();
        let host = t.host();
        let before = t.formula_count();
        let revivals = t.graph.stats().revivals;
        let err = host
            .evaluate("NEW", "a", strings(&["a", "b"]), strings(&["x"]), Some("out"))
            .unwrap_err();
        assert_eq!(err.code(), "arity_mismatch");
        assert_eq!(t.formula_count(), before);
        assert_eq!(t.graph.stats().revivals, revivals);
        assert!(host.identify("out").unwrap().is_none());
        assert_eq!(t.launcher.launches(), 0);
    }

    #[test]
    fn evaluate_with_result_name_persists_then_provides() {
        let t = TestGraph::new();
        let host = t.host();
        host.evaluate("MAIN", "{\"port\": 8080}", vec![], vec![], Some("cfg"))
            .unwrap();
        let value = host
            .evaluate("MAIN", "c.port", strings(&["c"]), strings(&["cfg"]), Some("port"))
            .unwrap()
            .into_value();
        assert_eq!(value, json!(8080));

        let id = host.identify("port").unwrap().unwrap();
        assert!(matches!(
            t.graph.formulas().read(&id).unwrap(),
            Formula::Eval { .. }
        ));
        assert_eq!(host.provide("port").unwrap().into_value(), json!(8080));
    }

    #[test]
    fn evaluate_without_result_name_persists_nothing_new() {
        let t = TestGraph::new();
        let host = t.host();
        host.evaluate("MAIN", "1", vec![], vec![], None).unwrap();
        let before = t.formula_count();
        let value = host.evaluate("MAIN", "[1, 2]", vec![], vec![], None).unwrap();
        assert_eq!(value.into_value(), json!([1, 2]));
        assert_eq!(t.formula_count(), before);
    }

    #[test]
    fn unnamed_evaluations_in_new_workers_leave_nothing_behind() {
        let t = TestGraph::new();
        let host = t.host();
        host.store(&b"powers.n"[..], Some("app")).unwrap();
        host.evaluate("MAIN", "{\"n\": 7}", vec![], vec![], Some("caps"))
            .unwrap();
        host.provide("app").unwrap();
        let formulas = t.formula_count();
        let values = t.graph.stats().values;
        let live = t.launcher.live();
        let launches = t.launcher.launches();

        for _ in 0..3 {
            let value = host.evaluate("NEW", "1", vec![], vec![], None).unwrap();
            assert_eq!(value.into_value(), json!(1));
        }
        let value = host.make_bundle("NEW", "app", "caps", None).unwrap();
        assert_eq!(value.into_value(), json!(7));

        assert_eq!(t.launcher.launches(), launches + 4);
        assert!(t.launcher.wait_for_live(live, Duration::from_secs(2)));
        assert_eq!(t.formula_count(), formulas);
        assert_eq!(t.graph.stats().values, values);
    }

    #[test]
    fn named_evaluation_in_new_worker_persists_the_worker() {
        let t = TestGraph::new();
        let host = t.host();
        let formulas = t.formula_count();
        host.evaluate("NEW", "2", vec![], vec![], Some("two")).unwrap();
        // The worker formula and the eval formula.
        assert_eq!(t.formula_count(), formulas + 2);
        assert_eq!(t.launcher.live(), 1);
        assert_eq!(host.provide("two").unwrap().into_value(), json!(2));
    }

    #[test]
    fn evaluate_reports_unknown_pet_names() {
        let t = TestGraph::new();
        let host = t.host();
        let err = host
            .evaluate("MAIN", "x", strings(&["x"]), strings(&["missing"]), None)
            .unwrap_err();
        assert_eq!(err.code(), "unknown_reference");
    }

    #[test]
    fn special_names() {
        let t = TestGraph::new();
        let host = t.host();
        assert_eq!(host.identify("SELF").unwrap().as_ref(), Some(host.id()));
        assert_eq!(host.identify("MAIN").unwrap().as_ref(), Some(host.main_worker()));
        assert!(host.identify("NEW").unwrap().is_none());
        assert_eq!(host.identify("Nope").unwrap_err().code(), "invalid_name");
        assert!(matches!(host.provide("MAIN").unwrap(), Capability::Worker(_)));
    }

    #[test]
    fn make_and_terminate_named_worker() {
        let t = TestGraph::new();
        let host = t.host();
        let worker = host.make_worker(Some("helper")).unwrap();
        assert_eq!(host.identify("helper").unwrap().as_ref(), Some(worker.id()));
        host.terminate_worker("helper").unwrap();
        assert!(worker.cancel_token().is_cancelled());
    }

    #[test]
    fn pet_name_management() {
        let t = TestGraph::new();
        let host = t.host();
        host.store(&b"1"[..], Some("one")).unwrap();
        host.store(&b"2"[..], Some("two")).unwrap();
        assert_eq!(host.list().unwrap(), strings(&["one", "two"]));
        host.rename("one", "uno").unwrap();
        host.remove("two").unwrap();
        assert_eq!(host.list().unwrap(), strings(&["uno"]));
        assert_eq!(host.remove("two").unwrap_err().code(), "unknown_reference");
    }

    #[test]
    fn locate_round_trips_through_the_locator() {
        let t = TestGraph::new();
        let host = t.host();
        host.store(&b"locate me"[..], Some("blob")).unwrap();
        let locator = host.locate("blob").unwrap();
        let parsed = parse_locator(&locator).unwrap();
        assert_eq!(parsed.formula_type, FormulaType::ReadableBlob);
        assert_eq!(Some(parsed.id), host.identify("blob").unwrap());
        assert!(matches!(host.provide(&locator).unwrap(), Capability::Blob(_)));
    }

    #[test]
    fn guests_have_their_own_names() {
        let t = TestGraph::new();
        let host = t.host();
        let blob = host.store(&b"shared"[..], Some("gift")).unwrap();
        let guest = host.provide_guest(Some("visitor")).unwrap();
        assert_eq!(guest.host_id(), host.id());
        assert!(guest.identify("gift").unwrap().is_none());

        let id = host.identify("gift").unwrap().unwrap();
        guest.adopt("present", &id).unwrap();
        let Capability::Blob(seen) = guest.provide("present").unwrap() else {
            panic!("expected a blob");
        };
        assert_eq!(seen.sha512(), blob.sha512());
        assert!(matches!(host.provide("visitor").unwrap(), Capability::Guest(_)));
    }

    #[test]
    fn child_hosts_get_fresh_pet_stores() {
        let t = TestGraph::new();
        let host = t.host();
        let child = host.provide_host(Some("child")).unwrap();
        assert_ne!(child.id(), host.id());
        assert!(child.list().unwrap().is_empty());
        assert_eq!(host.identify("child").unwrap().as_ref(), Some(child.id()));
    }

    #[test]
    fn bundles_import_with_powers() {
        let t = TestGraph::new();
        let host = t.host();
        host.store(&b"powers.greeting"[..], Some("app")).unwrap();
        host.evaluate("MAIN", "{\"greeting\": \"hi\"}", vec![], vec![], Some("caps"))
            .unwrap();
        let value = host
            .make_bundle("MAIN", "app", "caps", Some("running"))
            .unwrap()
            .into_value();
        assert_eq!(value, json!("hi"));
        assert!(host.identify("running").unwrap().is_some());
    }

    #[test]
    fn add_peer_records_route() {
        let t = TestGraph::new();
        let host = t.host();
        let node = NodeId::generate();
        let id = host
            .add_peer("friend", node.clone(), vec!["tcp://127.0.0.1:1".into()])
            .unwrap();
        assert_eq!(t.graph.known_peer(&node).unwrap(), Some(id));

        // Dialing is disabled in the fixture.
        let foreign = FormulaId::new(FormulaNumber::generate(), node);
        let err = host.provide(&foreign.to_string()).unwrap_err();
        assert_eq!(err.code(), "connection_refused");
    }
}
