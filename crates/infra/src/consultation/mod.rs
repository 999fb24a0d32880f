//! Adapters for the consultation collaborators.
//!
//! - `command_runner`: portal automation through an external program
//! - `companies`: company directory (in-memory and SQLite)
//! - `sink`: where retrieved messages end up

pub mod command_runner;
pub mod companies;
pub mod sink;

pub use command_runner::CommandRunner;
pub use companies::{InMemoryCompanyDirectory, SqliteCompanyDirectory};
pub use sink::{
    ConsultationSink, InMemoryConsultationSink, SinkError, SqliteConsultationSink, StoredConsultation,
};
