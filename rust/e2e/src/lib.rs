//! End-to-end tooling: a linear regression training plan and an in-process federation of nodes
//! training it, used by the `simulation` binary and the end-to-end tests.

pub mod federation;
pub mod linear;

pub use self::federation::{Federation, FederationError, NodeSpec};
