//! Persistence for the SMS dispatcher.
//!
//! This crate provides:
//! - The `SmsRepository` port with a transactional unit of work
//! - A transactional outbox for events that must leave the process
//! - In-memory and PostgreSQL adapters

pub mod error;
pub mod filter;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod repository;

pub use error::{Result, StorageError};
pub use filter::SmsFilter;
pub use memory::InMemorySmsRepository;
pub use outbox::OutboxEntry;
pub use postgres::PostgresSmsRepository;
pub use repository::{OutboxStore, SmsRepository, SmsRepositoryExt, SmsStore, SmsTransaction};
