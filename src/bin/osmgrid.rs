//! osmgrid CLI: import a snapshot, run queries, serve them over HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use osmgrid::import::pbf::PbfSource;
use osmgrid::import::Importer;
use osmgrid::{geojson, server, IndexOptions, OsmIndex};

#[derive(Parser)]
#[command(name = "osmgrid", version, about = "Spatial + tag queries over OSM snapshots")]
struct Cli {
    /// Directory holding the built index
    #[arg(long, global = true, default_value = "osmgrid-index")]
    index_dir: PathBuf,

    /// Log filter, e.g. "info" or "osmgrid=debug"
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the index from an .osm.pbf snapshot
    Import {
        file: PathBuf,
        /// Cell size in degrees (width and height)
        #[arg(long, default_value_t = 0.1)]
        cell_size: f64,
        /// Max nodes per import sub-extent
        #[arg(long, default_value_t = 10_000_000)]
        node_budget: u64,
    },
    /// Evaluate a query and print the GeoJSON result
    Query {
        text: String,
        /// Worker threads per bbox scan
        #[arg(long, default_value_t = 3)]
        workers: usize,
        /// Re-check decoded features against the dictionary
        #[arg(long)]
        check_validity: bool,
    },
    /// Serve queries over HTTP
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Worker threads per bbox scan
        #[arg(long, default_value_t = 3)]
        workers: usize,
    },
    /// Validate every cell file against the tag dictionary
    Check {
        /// Sweep threads (default: one per core)
        #[arg(long)]
        threads: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .init();

    match cli.command {
        Command::Import {
            file,
            cell_size,
            node_budget,
        } => {
            let options = IndexOptions {
                cell_width: cell_size,
                cell_height: cell_size,
                node_budget,
                ..IndexOptions::default()
            };
            let mut source = PbfSource::open(&file)?;
            let stats = Importer::new(&cli.index_dir, options)
                .run(&mut source)
                .context("import failed")?;
            println!(
                "imported {} nodes, {} ways, {} relations into {} cells ({} sub-extents)",
                stats.nodes, stats.ways, stats.relations, stats.cells, stats.extents
            );
        }
        Command::Query {
            text,
            workers,
            check_validity,
        } => {
            let options = IndexOptions {
                scan_workers: workers,
                check_validity,
                ..IndexOptions::default()
            };
            let index = OsmIndex::open(&cli.index_dir, options)?;
            let features = index.query(&text)?;
            let collection = geojson::feature_collection(&features, index.tag_index());
            println!("{}", serde_json::to_string_pretty(&collection)?);
        }
        Command::Serve { port, workers } => {
            let options = IndexOptions {
                scan_workers: workers,
                ..IndexOptions::default()
            };
            let index = Arc::new(OsmIndex::open(&cli.index_dir, options)?);
            server::serve(index, port).await?;
        }
        Command::Check { threads } => {
            let index = OsmIndex::open(&cli.index_dir, IndexOptions::default())?;
            let report = index.grid().validate_all(threads)?;
            println!(
                "checked {} features in {} cell files: all valid",
                report.features, report.files
            );
        }
    }
    Ok(())
}
