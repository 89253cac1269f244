//! abs-kosync: reading progress sync between Audiobookshelf, KOSync and Storyteller
//!
//! Three processes share this crate:
//! - the supervisor (`run`), which starts and stops the other two
//! - the sync daemon (`daemon`), which runs the sync, job and discovery cycles
//! - the web server (`web`), which manages mappings and suggestions

pub mod clients;
pub mod config;
pub mod daemon;
pub mod ebook;
pub mod fuzzy;
pub mod models;
pub mod store;
pub mod supervisor;
pub mod sync;
pub mod transcript;
pub mod web;
