use std::{collections::BTreeSet, path::PathBuf};

use clap::{Parser, Subcommand};
use lifecycle_pipeline::FileTags;

#[derive(Debug, Parser)]
#[command(name = "hybrid-index", about = "Maintains the hybrid sparse+dense index")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Replace the tag ids stored on every chunk of the given files
    UpdateTags {
        #[arg(long)]
        org_id: i64,

        /// `FILE_ID=TAG,TAG,...`; an empty tag list clears the tags
        #[arg(long = "file", value_parser = parse_file_tags, required = true)]
        files: Vec<FileTags>,
    },

    /// Drop files from the persisted content and metadata corpora
    UpdateCorpus {
        #[arg(long)]
        org_id: i64,

        #[arg(long = "file-id", required = true)]
        file_ids: Vec<String>,
    },

    /// Delete files from both vector stores, archive their term frequencies and update the corpora
    RemoveFiles {
        #[arg(long)]
        org_id: i64,

        #[arg(long = "file-id", required = true)]
        file_ids: Vec<String>,
    },

    /// Print IDF weights for the query terms over the given files
    Idf {
        #[arg(long)]
        org_id: i64,

        #[arg(long)]
        query: String,

        #[arg(long = "file-id")]
        file_ids: Vec<String>,
    },

    /// Rerank candidates read from a JSON file (`-` for stdin)
    Rerank {
        #[arg(long)]
        query: String,

        #[arg(long)]
        candidates: PathBuf,

        #[arg(long, default_value_t = 10)]
        top_n: usize,

        /// Use the blocking HTTP client
        #[arg(long, default_value_t = false)]
        blocking: bool,
    },
}

fn parse_file_tags(raw: &str) -> Result<FileTags, String> {
    let (file_id, tags) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected FILE_ID=TAG,TAG,... but got '{raw}'"))?;
    let file_id = file_id.trim();
    if file_id.is_empty() {
        return Err("file id must not be empty".to_string());
    }

    let tag_ids = tags
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(|tag| {
            tag.parse::<i64>()
                .map_err(|err| format!("invalid tag id '{tag}': {err}"))
        })
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(FileTags {
        file_id: file_id.to_string(),
        tag_ids,
    })
}
