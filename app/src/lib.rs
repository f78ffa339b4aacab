pub mod app;

pub use app::{format_message, role_badge, ExemiApp, TranscriptPrinter};
