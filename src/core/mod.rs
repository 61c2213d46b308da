//! # Core
//!
//! The data side of navigation: what nodes exist, where each parent has
//! been, and how changes are announced. Nothing here makes a navigation
//! decision; that is the runtime's job.
//!
//! ```text
//!          ┌──────────────┐      events      ┌──────────────┐
//!          │   Registry   │ ───────────────▶ │   EventBus   │
//!          │ (node arena) │                  └──────┬───────┘
//!          └──────┬───────┘                         │
//!                 │ lookups                         ▼
//!          ┌──────▼───────┐                  subscribers
//!          │   Runtime    │ ───── push/pop ─────┐
//!          └──────────────┘                     ▼
//!                                        ┌──────────────┐
//!                                        │   History    │──▶ storage
//!                                        └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`node`]: node kinds, props, hooks and registration specs
//! - [`registry`]: the node arena and its structural rules
//! - [`history`]: per-parent back/forward stacks
//! - [`event`]: the subscriber bus
//! - [`config`]: settings from defaults, file, env and flags

pub mod config;
pub mod event;
pub mod history;
pub mod node;
pub mod registry;
