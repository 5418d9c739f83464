//! Stime — the single simulation clock used by all services (spec.md
//! §4.10, §6.4, C1/C12): sim-time UTC, advance + cancellable sequential
//! fan-out tick. State is in-memory only (spec.md §6.5) — a process
//! restart resets the clock to real (wall-clock) mode.

pub mod api;
pub mod config;
pub mod driver;

pub use config::Config;
pub use driver::{AdvanceAndTickRequest, AdvanceUnit, SimDriver, TickStatus};
