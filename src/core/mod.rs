//! Core business logic layer
//!
//! The event loop and the surface protocol. AppCore mutates the store and
//! catalog; the surface only ever sees `RenderUpdate`s.

pub mod app_core;
pub mod events;

pub use app_core::{write_updates, AppCore};
pub use events::{RenderUpdate, SurfaceEvent, WidgetView};
