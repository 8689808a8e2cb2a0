//! Application-level orchestration.
//!
//! This module owns job lifecycle control (register/cancel/teardown). UI/CLI
//! layers talk to it through `UiCommand`s and receive `JobEvent`s back.

mod controller;

pub(crate) use controller::{run_controller, UiCommand};
