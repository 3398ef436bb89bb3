//! Per-stage run status.
//!
//! Each stage of each session owns one `status.json` document under its log
//! directory. The document is re-read and re-written on every access so an
//! observer inspecting the filesystem mid-run sees the last committed state.

mod state;
mod store;

pub use state::{StageState, StageStatus};
pub use store::StatusStore;
