//! gantry-agent — the per-node daemon side of Gantry.
//!
//! The agent owns everything node-local: it materializes server containers
//! against the local container engine, supervises their lifecycle, scrapes
//! health and resource usage on fixed intervals, bridges server consoles to
//! WebSocket clients, and exposes the HTTP API the panel drives it through.
//!
//! # Architecture
//!
//! ```text
//!  panel ──HTTP──▶ api ──▶ Supervisor ──▶ ContainerRuntime ──▶ engine socket
//!                   │          ▲
//!              ConsoleBridge   │
//!                         health/metrics loops
//! ```
//!
//! The engine is reached through the [`ContainerRuntime`](runtime::ContainerRuntime)
//! trait so supervision logic tests against an in-memory fake.

pub mod api;
pub mod backup;
pub mod config;
pub mod console;
pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod panel;
pub mod runtime;
pub mod supervisor;

pub use config::AgentConfig;
pub use console::ConsoleBridge;
pub use engine::EngineClient;
pub use error::{AgentError, AgentResult};
pub use panel::PanelClient;
pub use runtime::{ContainerRuntime, ContainerSpec, ContainerState, RuntimeError};
pub use supervisor::Supervisor;
