//! Orchestration services.
//!
//! Leaves first: the state machine and completion plumbing, the persistence
//! capabilities, the endpoint transport and data motion, then the template
//! service and its reconciliation sweep on top.

pub mod async_call;
pub mod catalog;
pub mod data_motion;
pub mod endpoint;
pub mod local_endpoint;
pub mod state_machine;
pub mod template_service;
pub mod template_sync;
