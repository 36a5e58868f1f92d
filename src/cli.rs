// nc_doc_loader/src/cli.rs
// Command Line Interface (CLI) specific logic for nc_doc_loader.

use std::path::PathBuf;

use clap::Parser;

/// Command Line Interface for the nc_doc_loader module.
#[derive(Parser, Debug,)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// The document store to load rows into.
    #[clap(subcommand)]
    pub command: Commands,

    /// Halt execution immediately upon encountering any non-recoverable error.
    #[clap(long)]
    pub strict: bool,

    /// Generate a structured summary report (loading_report.json) at the end.
    #[clap(long)]
    pub report: bool,

    /// Number of pipeline instances (one per input file) running in parallel.
    #[clap(short, long, default_value_t = 4)]
    pub concurrency: usize,
}

#[derive(Parser, Debug,)]
pub enum Commands {
    /// Load rows into MongoDB
    Mongo(MongoArgs,),
}

#[derive(Parser, Debug,)]
pub struct MongoArgs {
    /// Connection string for MongoDB
    #[clap(long, env = "MONGO_URI")]
    pub uri:        String,
    /// Pipeline configuration (JSON): field mappings, indexes, write options
    #[clap(long)]
    pub config:     PathBuf,
    /// JSON Lines file, or a directory of them, holding the rows to load
    #[clap(short, long)]
    pub path:       PathBuf,
    /// Overrides the database named in the configuration
    #[clap(long)]
    pub database:   Option<String,>,
    /// Overrides the collection named in the configuration
    #[clap(long)]
    pub collection: Option<String,>,
    /// Principal recorded on every unit of row processing
    #[clap(long)]
    pub principal:  Option<String,>,
}
