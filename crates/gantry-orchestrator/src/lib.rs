//! gantry-orchestrator — server lifecycle for the Gantry control plane.
//!
//! The orchestrator owns the server state machine:
//!
//! ```text
//! Installing → Stopped ⇄ Starting → Running ⇄ Stopping → Stopped
//!                  │                    │
//!                  └──── Restarting ────┘
//! ```
//!
//! Any remote failure during a transition parks the server in `Error`;
//! `kill` is the unconditional correction path back to `Stopped`. Suspension
//! overlays the machine: a suspended server refuses `start` until
//! unsuspended.
//!
//! Every lifecycle operation holds a per-server mutex for its full duration,
//! so concurrent operations on one server serialize and the loser observes
//! the winner's in-flight status. Commands reach nodes through the
//! [`NodeTransport`] seam; the orchestrator never blocks on a node for
//! deletes (local state wins).

pub mod error;
pub mod lifecycle;
pub mod node;
pub mod transport;

pub use error::{LifecycleError, LifecycleResult};
pub use lifecycle::{CreateServerRequest, Orchestrator};
pub use node::{CreateNodeRequest, NodeConfiguration, NodeManager};
pub use transport::{HttpNodeTransport, NodeTransport, NoopTransport, TransportError};
