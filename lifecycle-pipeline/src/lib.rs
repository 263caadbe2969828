#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod corpus;
pub mod removal;
pub mod tagging;
#[cfg(test)]
mod test_support;

pub use corpus::{CorpusMaintenance, CorpusUpdateReport, KindUpdate};
pub use removal::{FileRemover, RemovalReport};
pub use tagging::{FileResult, FileStatus, FileTags, MetadataPropagator};
