//! Authenticated browser sessions: cookie persistence, liveness probing and
//! the interactive login fallback.

mod manager;
mod probe;
mod state;
mod store;

pub use manager::{SessionConfig, SessionManager};
pub use probe::{Liveness, LivenessProbe, ProbeObservation};
pub use state::{SessionCookie, SessionState};
pub use store::SessionStore;
