//! Shared domain types and interfaces for the quant-trading platform:
//! [`clock::Clock`], [`symbol::canonicalize`], [`bar::BarStore`],
//! [`fetcher::Fetcher`], [`notifier::Notifier`], the HTTP header contract,
//! and the [`error::AppError`] every service renders to its HTTP callers.

pub mod bar;
pub mod clock;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod notifier;
pub mod retry;
pub mod symbol;

pub use bar::{Bar, BarStore, Interval};
pub use clock::Clock;
pub use error::AppError;
pub use fetcher::{Fetcher, Quote, SyntheticFetcher};
pub use notifier::{LoggingNotifier, Notifier};
