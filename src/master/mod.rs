//! Master Module
//!
//! The client-facing request model and the engine executing it.

mod engine;
pub mod request;

pub use engine::{MasterEngine, VERSION};
pub use request::{Operation, Payload, Request, Response, Status};
