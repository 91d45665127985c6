//! Build automation tasks for stacforge
//!
//! - Generating the CLI reference from the clap definitions

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for stacforge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<stacforge_ingest::Cli>();

    let content = format!(
        r#"# stacforge CLI Reference

Generated from the CLI source code on {}.

## Overview

`stacforge` turns a partition of source objects (or text manifests) into
catalog records. Work is split into fixed-size batches; every completed batch
is checkpointed, so an interrupted run picks up after the last completed batch.
Records are buffered into `{{year}}-chunkNNNN.ndjson` files and consolidated into
`{{year}}.ndjson` once the partition is exhausted.

## Quick Start

```bash
# Process one partition, results under ./output/N60W040/
stacforge run \
  --source s3://its-live-data/velocity_image_pair/landsatOLI/v02 \
  --partition N60W040 \
  --pattern '**/*.nc' \
  --generator 'itslive-stac --json'

# Same, with chunks, checkpoints and outputs kept in S3
stacforge run --partition N60W040 --sync --destination s3://my-bucket/stac

# Where did a partition get to?
stacforge status --partition N60W040

# Load a consolidated file into a STAC API
stacforge ingest output/N60W040/2019.ndjson \
  --catalog-url https://stac.example.org --collection itslive
```

Press Ctrl+C once to stop after the current batch; press it again to exit
immediately.

## Commands

{}

## Environment Variables

Every `run` flag has a `FORGE_*` counterpart (`FORGE_SOURCE`, `FORGE_PARTITION`,
`FORGE_PATTERN`, `FORGE_SOURCE_MODE`, `FORGE_BATCH_SIZE`, `FORGE_WORKERS`,
`FORGE_SYNC`, `FORGE_REINGEST`, `FORGE_OUTPUT_DIR`, `FORGE_DESTINATION`,
`FORGE_CATALOG_URL`, `FORGE_COLLECTION`, `FORGE_TIME_FIELD`, `FORGE_GENERATOR`,
`FORGE_TASK_ID`). A `.env` file in the working directory is loaded first.

- `S3_ENDPOINT`, `S3_REGION`, `S3_ACCESS_KEY`, `S3_SECRET_KEY`, `S3_PATH_STYLE`,
  `S3_ANONYMOUS` - object storage access
- `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR` - logging

---

*To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("Generated CLI documentation at: {}", file_path.display());

    Ok(())
}
