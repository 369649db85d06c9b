#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # keel
//!
//! Declarative control plane for Kafka clusters.
//!
//! Desired state (namespaces, topics, access grants, connectors, stream
//! applications and quotas) lives in compacted log topics and is replayed
//! into local stores. Periodic executors converge every managed cluster
//! toward it.
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use keel::prelude::*;
//!
//! # async fn run() -> keel::Result<()> {
//! let config = ControlPlaneConfig::from_toml_str(r#"
//!     [[clusters]]
//!     name = "local"
//! "#)?;
//!
//! let log = InMemoryLog::new_arc();
//! let transport: Arc<dyn LogTransport> = log.clone();
//! let admin: Arc<dyn LogAdmin> = log;
//! let stores = ResourceStores::open(&transport, &admin, &config.store);
//!
//! let backends = BTreeMap::from([(
//!     "local".to_string(),
//!     ClusterBackends::new(InMemoryBroker::new_arc()),
//! )]);
//!
//! let plane = ControlPlane::new(config, stores, backends)?;
//! plane.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod plane;
pub mod prelude;
pub mod telemetry;

pub use keel_core;
pub use keel_reconciler;
pub use keel_store;

pub use error::{Error, Result};
pub use plane::{ClusterBackends, ControlPlane};
pub use telemetry::init_tracing;
