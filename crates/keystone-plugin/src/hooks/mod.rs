//! Hook system: binding registry, dispatcher, and payload definitions.

pub mod definitions;
pub mod dispatcher;
pub mod registry;

pub use definitions::{HookOutcome, HookPayload};
pub use dispatcher::HookDispatcher;
pub use registry::{BindingId, HookBinding, HookHandler, HookRegistry};
