//! Daemon module - the capability service.
//!
//! Provides:
//! - Durable stores: formulas, content-addressed blobs, pet names
//! - The capability graph that revives formulas into live values
//! - Worker supervision and peer connections
//! - Sessions over the Unix socket and TCP

pub mod agent;
pub mod cancel;
pub mod client;
pub mod content_store;
pub mod deferred;
pub mod durable;
pub mod facet;
pub mod formula_store;
pub mod gateway;
pub mod graph;
pub mod pet_store;
pub mod race;
pub mod remote_control;
pub mod run;
pub mod session;
pub(crate) mod sync;
pub mod worker;

pub use agent::{Guest, Host, PendingBlob};
pub use cancel::{CancelKind, CancelReason, CancelToken, bind_fates};
pub use client::DaemonClient;
pub use content_store::{BlobWriter, ContentStore, ReadableBlob};
pub use deferred::{Abandoned, Deferred, Memo};
pub use durable::StoreError;
pub use facet::{DaemonFacet, DaemonRequest};
pub use formula_store::FormulaStore;
pub use gateway::{GatewayFacet, NoDialer, PeerDialer, PeerGateway, TcpDialer};
pub use graph::{Capability, Graph, GraphError, GraphOptions, GraphStats};
pub use pet_store::PetStore;
pub use race::{Elapsed, Finish, Race};
pub use remote_control::{RemoteControl, RemoteControlProvider};
pub use run::{Daemon, DaemonOptions, load_or_create_node_id, run_daemon};
pub use session::{Bootstrap, ErrorPayload, Session, SessionError, SessionOptions, Transport};
pub use worker::{
    EndoWorker, LaunchedWorker, ProcessLauncher, WorkerError, WorkerLauncher, WorkerSettings,
    WorkerSpec,
};
