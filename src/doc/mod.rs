//! The canonical document and its persistence.
//!
//! The document is a single rich-text markup string, opaque to the server
//! except as bytes. It mutates only through textual patch application in
//! [`store::DocumentStore`] and reaches disk only through the debounced
//! scheduler in [`saver::DocSaver`] or the final synchronous save at
//! shutdown.

pub mod saver;
pub mod store;

pub use saver::DocSaver;
pub use store::{ApplyOutcome, DocumentStore};
