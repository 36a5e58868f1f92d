// nc_doc_loader/src/lib.rs
// Public API for the nc_doc_loader module: tabular rows in, nested documents out.

pub mod cli;
pub mod error;
pub mod index;
pub mod ingestor;
pub mod mapping;
pub mod mongo;
pub mod pipeline;
pub mod retry;
pub mod row;
pub mod writer;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_WRITE_RETRIES: u32 = 5;
pub const DEFAULT_WRITE_RETRY_DELAY_SECS: u64 = 10;
