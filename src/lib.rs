//! flownav: hierarchical navigation with scoped state.
//!
//! Start from [`flow::Flow`]; the modules underneath are usable on their own.

pub mod blueprint;
pub mod core;
pub mod debug;
pub mod flow;
pub mod runtime;
pub mod script;
pub mod storage;
pub mod store;

#[cfg(test)]
pub mod test_support;
