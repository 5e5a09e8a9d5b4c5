//! Retrieval decision engine
//!
//! The router walks a fixed priority chain of data sources per question;
//! `sources` defines the injected collaborator interfaces and `length`
//! hosts the length-resolution priority shared with the direct-lookup
//! step.

pub mod length;
pub mod router;
pub mod sources;

pub use router::{RetrievalRouter, RouteOptions, RoutingResult};
