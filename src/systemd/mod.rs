pub mod client;
pub mod journal;

pub use client::{SystemdClient, UnitInfo};
pub use journal::JournalSource;
