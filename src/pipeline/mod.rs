//! The stage-based execution engine.
//!
//! Each submodule owns one piece of the engine; they compose leaves first:
//!
//! ```text
//! fallback   resource
//!     \         |
//!      stage ── fold ── restart
//!                 |        |
//!             checkpoint store
//! ```
//!
//! 1. [`stage`]    — stage declarations and the validated [`stage::Pipeline`]
//! 2. [`resource`] — services acquired around one stage call, released in
//!    reverse order on every exit path
//! 3. [`fold`]     — the executor: skip, gather, call, bind, time, checkpoint
//! 4. [`restart`]  — clear state from a stage onward and fold again
//! 5. [`fallback`] — ordered alternatives for one operation, used inside
//!    stage functions

pub mod fallback;
pub mod fold;
pub mod resource;
pub mod restart;
pub mod stage;
