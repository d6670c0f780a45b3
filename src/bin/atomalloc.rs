//! atomalloc command line tool
//!
//! Offline inspection and editing of allocator stores.
//!
//! # Examples
//!
//! ```bash
//! # Create an empty store
//! atomalloc create data.db
//!
//! # Store a blob and read it back
//! echo hello | atomalloc put data.db
//! atomalloc get data.db 0xd31
//!
//! # Check the store
//! atomalloc audit data.db
//! ```

use anyhow::Context;
use atomalloc::{AtomAllocator, Backend, Handle, StoreConfig};
use clap::{Args, Parser, Subcommand};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// atomalloc - persistent space allocator with stable handles
#[derive(Parser, Debug)]
#[command(name = "atomalloc")]
#[command(version = atomalloc::VERSION)]
#[command(about = "Inspect and edit atomalloc stores", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    store: StoreArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "ATOMALLOC_LOG")]
    log_level: String,
}

/// Store stack options; these override the configuration file
#[derive(Args, Debug)]
struct StoreArgs {
    /// TOML configuration file
    #[arg(long, global = true, env = "ATOMALLOC_CONFIG")]
    config: Option<PathBuf>,

    /// Store backend (file, memory)
    #[arg(long, global = true, env = "ATOMALLOC_BACKEND")]
    backend: Option<Backend>,

    /// Pages held by the read cache
    #[arg(long, global = true, env = "ATOMALLOC_CACHE_PAGES")]
    cache_pages: Option<usize>,

    /// Log I/O statistics when the store is closed
    #[arg(long, global = true, env = "ATOMALLOC_PROBE")]
    probe: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty store, replacing any existing file
    Create {
        path: PathBuf,
    },

    /// Verify the structure of a store
    Audit {
        path: PathBuf,
    },

    /// List the heads of the non-empty free lists
    FreeLists {
        path: PathBuf,
    },

    /// Store a blob and print its handle
    Put {
        path: PathBuf,
        /// Read the blob from this file instead of stdin
        file: Option<PathBuf>,
    },

    /// Write the blob at a handle to stdout
    Get {
        path: PathBuf,
        #[arg(value_parser = parse_handle)]
        handle: Handle,
    },

    /// Release the blob at a handle
    Free {
        path: PathBuf,
        #[arg(value_parser = parse_handle)]
        handle: Handle,
    },

    /// Print the root record, or replace it with the content of a file
    Root {
        path: PathBuf,
        file: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    setup_logging(&cli);

    if let Err(e) = run(cli) {
        eprintln!("{}", failure_message(&e));
        std::process::exit(1);
    }
}

/// One line naming the failure and every context it passed through.
fn failure_message(e: &anyhow::Error) -> String {
    format!("atomalloc: {:#}", e)
}

fn setup_logging(cli: &Cli) {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.store)?;

    match cli.command {
        Commands::Create { path } => create_command(&config, &path),
        Commands::Audit { path } => audit_command(&config, &path),
        Commands::FreeLists { path } => free_lists_command(&config, &path),
        Commands::Put { path, file } => put_command(&config, &path, file.as_deref()),
        Commands::Get { path, handle } => get_command(&config, &path, handle),
        Commands::Free { path, handle } => free_command(&config, &path, handle),
        Commands::Root { path, file } => root_command(&config, &path, file.as_deref()),
    }
}

fn load_config(args: &StoreArgs) -> anyhow::Result<StoreConfig> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::from_toml_file(path)?,
        None => StoreConfig::default(),
    };

    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(pages) = args.cache_pages {
        config.cache_pages = pages;
    }
    config.probe |= args.probe;
    Ok(config)
}

/// Accepts decimal or `0x` prefixed hexadecimal.
fn parse_handle(s: &str) -> Result<Handle, String> {
    let atom = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    }
    .map_err(|e| format!("invalid handle {:?}: {}", s, e))?;

    if atom > Handle::MAX.atom() {
        return Err(format!("handle {:#x} exceeds 56 bits", atom));
    }
    Ok(Handle::new(atom))
}

fn open(config: &StoreConfig, path: &Path) -> anyhow::Result<AtomAllocator<Box<dyn atomalloc::Accessor>>> {
    let store = config.open(path)?;
    AtomAllocator::open(store).with_context(|| format!("opening {}", path.display()))
}

fn read_input(file: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    match file {
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display())),
        None => {
            let mut content = Vec::new();
            std::io::stdin().read_to_end(&mut content)?;
            Ok(content)
        }
    }
}

fn create_command(config: &StoreConfig, path: &Path) -> anyhow::Result<()> {
    let allocator = AtomAllocator::create(config.create(path)?)?;
    info!(path = %path.display(), atoms = allocator.atoms(), "Store created");
    println!("created {} ({} atoms)", path.display(), allocator.atoms());
    config.close(allocator)?;
    Ok(())
}

fn audit_command(config: &StoreConfig, path: &Path) -> anyhow::Result<()> {
    let allocator = open(config, path)?;
    let report = allocator.audit()?;
    print!("{}", toml::to_string(&report)?);
    config.close(allocator)?;
    Ok(())
}

fn free_lists_command(config: &StoreConfig, path: &Path) -> anyhow::Result<()> {
    let allocator = open(config, path)?;
    let entries = allocator.free_report();
    if entries.is_empty() {
        println!("no free blocks");
    }
    for entry in entries {
        println!("class {:>4}  head {:#x}", entry.class, entry.head.atom());
    }
    config.close(allocator)?;
    Ok(())
}

fn put_command(config: &StoreConfig, path: &Path, file: Option<&Path>) -> anyhow::Result<()> {
    let content = read_input(file)?;
    let mut allocator = open(config, path)?;
    let handle = allocator.alloc(&content)?;
    println!("{:#x}", handle.atom());
    config.close(allocator)?;
    Ok(())
}

fn get_command(config: &StoreConfig, path: &Path, handle: Handle) -> anyhow::Result<()> {
    let allocator = open(config, path)?;
    let content = allocator.read(handle)?;
    std::io::stdout().write_all(&content)?;
    config.close(allocator)?;
    Ok(())
}

fn free_command(config: &StoreConfig, path: &Path, handle: Handle) -> anyhow::Result<()> {
    let mut allocator = open(config, path)?;
    allocator.free(handle)?;
    info!(handle = %handle, "Block freed");
    config.close(allocator)?;
    Ok(())
}

fn root_command(config: &StoreConfig, path: &Path, file: Option<&Path>) -> anyhow::Result<()> {
    let mut allocator = open(config, path)?;
    let root = allocator.root();
    match file {
        Some(file) => {
            let content = read_input(Some(file))?;
            allocator.realloc(root, &content, true)?;
        }
        None => {
            std::io::stdout().write_all(&allocator.read(root)?)?;
        }
    }
    config.close(allocator)?;
    Ok(())
}
