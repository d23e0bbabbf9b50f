//! Run lifecycle core.
//!
//! This module owns the run state machine, the polling session, and the
//! controller that drives a submitted run to completion. UI/CLI layers talk
//! to it through commands and events only.

mod controller;
pub(crate) mod machine;
pub(crate) mod poller;

pub(crate) use controller::{run_controller, UiCommand};
