//! Root of the `nova-hub-core` library.

// Library code reports through `tracing`, never by printing.
#![deny(clippy::print_stdout, clippy::print_stderr)]
// Orchestrator wiring passes its collaborators explicitly.
#![allow(clippy::too_many_arguments)]

pub mod alerts;
pub mod authz;
pub mod config;
pub mod db;
pub mod engine;
pub mod ledger;
pub mod mailbox;
pub mod notify;
pub mod packet;
pub mod processing;
pub mod store;

pub use alerts::AlertError;
pub use config::HubConfig;
pub use mailbox::Mailbox;
pub use mailbox::TransferError;
pub use notify::HubEvent;
pub use processing::Orchestrator;
pub use processing::ProcessingError;
pub use store::HubStore;
