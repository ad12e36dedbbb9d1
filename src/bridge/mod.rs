//! Bridge engine: routing, rendering, leak guard, attachment relay and
//! dispatch.
//!
//! ## Module Structure
//!
//! - `router`: rule matching (`RuleEngine`)
//! - `formatter`: `msg_format` rendering and rich headers
//! - `guard`: credential registry and leak guard
//! - `relay`: fetch-once attachment relay
//! - `queue`: per-(source, target) FIFO workers
//! - `driver`: the platform driver contract
//! - `orchestrator`: the `Coordinator` tying it together

pub mod driver;
pub mod formatter;
pub mod guard;
pub mod orchestrator;
pub mod queue;
pub mod relay;
pub mod router;

pub use guard::CredentialRegistry;
pub use orchestrator::{CoordinatorBuilder, DispatchSettings};
pub use router::RuleEngine;
