pub mod controller;
pub mod events;
mod loop_worker;
pub mod state;

pub use controller::ScanController;
pub use events::{CycleReport, ScanEvent};
pub use loop_worker::ScanOptions;
pub use state::{ScannerSnapshot, ScannerState, ScannerStatus, SessionPolicy};
