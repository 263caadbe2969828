#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod idf;
pub mod reranking;

pub use idf::{smoothed_idf, IdfCalculator, IdfStatus};
pub use reranking::{
    build_blocking_reranker, build_reranker, BlockingReranker, RerankCandidate, RerankOutcome,
    Reranker,
};
