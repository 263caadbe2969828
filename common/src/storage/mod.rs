pub mod addressing;
pub mod corpus_store;
pub mod db;
pub mod pool;
pub mod store;
pub mod types;
pub mod vector;
