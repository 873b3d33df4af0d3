//! Operator utility to dump statistics or fully merge a litecask datastore.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use litecask::{Config, Datastore, LogLevel};
use tracing::Level;

#[derive(Parser)]
#[command(
    name = "litecask",
    about = "Litecask utility to dump statistics or fully merge a datastore",
    version
)]
struct Cli {
    /// Verbose store logs (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summary of the datastore figures (size, items, compactness)
    Stat {
        /// Path of the datastore directory
        path: PathBuf,
    },
    /// Per-data-file statistics
    File {
        /// Path of the datastore directory
        path: PathBuf,
    },
    /// Offline full merge of the datastore
    Merge {
        /// Path of the datastore directory
        path: PathBuf,

        /// Maximum byte size of the merged data files
        #[arg(short = 's', long = "data-file-max-bytes")]
        data_file_max_bytes: Option<u64>,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let (path, merge_max_bytes) = match &cli.command {
        Commands::Stat { path } | Commands::File { path } => (path.clone(), None),
        Commands::Merge {
            path,
            data_file_max_bytes,
        } => (path.clone(), Some(*data_file_max_bytes)),
    };

    let store = Datastore::new();
    store.set_log_level(match cli.verbose {
        0 => LogLevel::Warn,
        1 => LogLevel::Info,
        _ => LogLevel::Debug,
    });

    if let Err(e) = store.open(&path, false) {
        eprintln!("Unable to open the datastore {}: {e}", path.display());
        std::process::exit(1);
    }

    // A full merge selects every sealed file, whatever its fragmentation
    if merge_max_bytes.is_some() {
        let mut config = Config {
            merge_trigger_data_file_fragmentation_percentage: 1,
            merge_trigger_data_file_dead_byte_threshold: 0,
            merge_select_data_file_fragmentation_percentage: 1,
            merge_select_data_file_dead_byte_threshold: 0,
            ..Config::default()
        };
        if let Some(Some(max_bytes)) = merge_max_bytes {
            config.data_file_max_bytes = max_bytes;
            println!("Setting data_file_max_bytes to {max_bytes}");
        }
        if let Err(e) = store.set_config(config) {
            eprintln!("Unable to set the configuration: {e}");
            let _ = store.close();
            std::process::exit(1);
        }
    }

    match cli.command {
        Commands::Stat { .. } => {
            let s = store.file_stats();
            let live_entries = s.entries - s.tomb_entries - s.dead_entries;
            let live_bytes = s.entry_bytes - s.tomb_bytes - s.dead_bytes;
            println!("Data files         : {}", s.file_qty);
            println!(
                "Valid entries      : {:<7} in {:7.1} MB",
                live_entries,
                1e-6 * live_bytes as f64
            );
            println!(
                "Dead & tomb entries: {:<7} in {:7.1} MB",
                s.tomb_entries + s.dead_entries,
                1e-6 * (s.tomb_bytes + s.dead_bytes) as f64
            );
            println!(
                "Compactness        : {} %",
                100 * live_bytes / s.entry_bytes.max(1)
            );
        }
        Commands::File { .. } => {
            let s = store.file_stats();
            println!("Database content ({} data files):", s.file_qty);
            println!("  Bytes       : {:10}", s.entry_bytes);
            println!("  Entries     : {:10}", s.entries);
            println!("  Tomb bytes  : {:10}", s.tomb_bytes);
            println!("  Tomb entries: {:10}", s.tomb_entries);
            println!("  Dead bytes  : {:10}", s.dead_bytes);
            println!("  Dead entries: {:10}", s.dead_entries);
        }
        Commands::Merge { .. } => {
            if !store.request_merge() && !store.is_merge_ongoing() {
                eprintln!("Error: unable to start the merge");
                let _ = store.close();
                std::process::exit(1);
            }
            print!("Merging ");
            while store.is_merge_ongoing() {
                std::thread::sleep(Duration::from_millis(100));
                print!(".");
                use std::io::Write;
                let _ = std::io::stdout().flush();
            }
            println!("\nMerge finished");
            let counters = store.counters();
            println!(
                "Gained {} data file(s), {} bytes",
                counters.merge_gained_data_file_qty, counters.merge_gained_bytes
            );
        }
    }

    if let Err(e) = store.close() {
        eprintln!("Error while closing the datastore: {e}");
        std::process::exit(1);
    }
}
