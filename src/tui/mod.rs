//! Terminal user interface for live check progress

mod check_progress;

pub use check_progress::CheckProgressApp;
