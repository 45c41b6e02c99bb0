pub extern crate tracing;
// alias
pub extern crate tracing as log;

pub mod logging;
pub mod resource;
pub mod state_mgr;
