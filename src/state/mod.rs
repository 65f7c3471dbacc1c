//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `FetchState`: Execution state of a single fetch unit attempt
//! - `ControlState`: Lifecycle state of a crawl controller

mod control_state;
mod fetch_state;

// Re-export main types
pub use control_state::ControlState;
pub use fetch_state::FetchState;
