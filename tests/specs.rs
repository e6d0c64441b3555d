//! Workspace-level end-to-end specs: the dispatcher driven through its
//! router with real worker logic running in-process over duplex pipes.

mod pool_specs;
mod resolver_specs;
mod scenario_specs;
