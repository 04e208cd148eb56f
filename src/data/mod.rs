//! Data layer - Pure state without I/O
//!
//! Widgets, action descriptors and UI settings as plain data structures.
//! NO imports from persistence/, hub/ or the event loop.

pub mod action;
pub mod ui_state;
pub mod widget;

pub use action::*;
pub use ui_state::*;
pub use widget::*;
