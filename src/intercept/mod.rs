//! Response interception: endpoint matching, entity correlation and dispatch.

mod context;
mod router;
mod types;

pub use context::{EntityContext, EntityHarvest};
pub use router::{DropReason, Handler, ResponseRouter, RouteOutcome};
pub use types::{EndpointPattern, InterceptedResponse, KeySource};
