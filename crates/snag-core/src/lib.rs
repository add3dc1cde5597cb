//! Core transfer engine for snag: probe, plan, schedule, verify, resume.
//! Used by the CLI binary; can be reused by other frontends (e.g. a TUI
//! or a service wrapper).

pub mod assembly;
pub mod bandwidth;
pub mod chunker;
pub mod controller;
pub mod error;
pub mod events;
pub mod handler;
pub mod integrity;
pub mod optimizer;
pub mod plan;
pub mod probe;
pub mod request;
pub mod retry;
pub mod scheduler;
pub mod target;
pub mod tls;

// Re-export the main API for the CLI.
pub use controller::{CancelHandle, Fetcher};
pub use error::{FetchError, FetchErrorKind};
pub use events::{EventSink, NullSink};
pub use handler::{HandlerCaps, HandlerConfig, HandlerRegistry, ProtocolHandler, Session};
pub use plan::{FetchMode, FetchPlan};
pub use probe::{ProbeResult, TlsSummary, Validators};
pub use request::{FetchOutcome, FetchRequest, FetchSummary, OutputTarget};
pub use target::Target;
