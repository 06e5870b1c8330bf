//! Parser module.
//!
//! This module contains the best-effort parsers for the flat text
//! listings returned by the RT REST interface: the ticket attachment
//! list, the history list and individual history messages.

pub mod attachments;
pub use attachments::*;

pub mod history;
pub use history::*;
