use anyhow::{Context, Result};
use bindex::archive::Translator;
use bindex::codec::{EntryReader, EntryTranslator};
use bindex::{
    ArchiverConfig, FileArchiver, IndexContext, PackerSettings, Reference, StoreProfile,
    TermEntry, TermIndex, TreeSettings,
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const MANIFEST: &str = "index.json";

#[derive(Parser)]
#[command(name = "bindex")]
#[command(about = "Partially-loaded persistent term index", long_about = None)]
struct Args {
    /// Block store directory; the index root is kept in index.json there
    #[arg(long, global = true, env = "BINDEX_STORE", default_value = "./store")]
    store: PathBuf,

    /// Store profile (memory, durable, bulk)
    #[arg(long, global = true, env = "BINDEX_PROFILE", default_value = "durable")]
    profile: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Merge files of encoded entries into the index
    Merge {
        /// B-tree minimum degree, used when creating a new index
        #[arg(long, default_value = "64")]
        node_min: usize,

        /// Maximum entries per value bin
        #[arg(long, default_value = "256")]
        bin_capacity: usize,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print the entries for a term
    Lookup { term: String },
    /// Print the root, term count and block count
    Stats,
    /// Append a page entry to an entry file
    Encode {
        #[arg(long)]
        subject: String,

        /// Page key, stored as the raw bytes of the reference
        #[arg(long)]
        page: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long, default_value = "1.0")]
        relevance: f32,

        out: PathBuf,
    },
}

/// What the store directory remembers between runs.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    root: String,
    terms: usize,
    node_min: usize,
    bin_capacity: usize,
}

impl Manifest {
    fn path(store: &Path) -> PathBuf {
        store.join(MANIFEST)
    }

    fn load(store: &Path) -> Result<Option<Self>> {
        let path = Self::path(store);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        let manifest = serde_json::from_str(&raw).with_context(|| format!("parsing {:?}", path))?;
        Ok(Some(manifest))
    }

    fn save(&self, store: &Path) -> Result<()> {
        let path = Self::path(store);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn root(&self) -> Result<Reference> {
        Ok(Reference::from_hex(&self.root)?)
    }
}

fn open_store(args: &Args) -> Result<(Arc<FileArchiver>, ArchiverConfig)> {
    let profile: StoreProfile = args.profile.parse()?;
    let config = ArchiverConfig::new(args.store.clone()).with_profile(profile);
    let blocks = FileArchiver::open(&config)
        .with_context(|| format!("opening store {:?}", args.store))?;
    Ok((Arc::new(blocks), config))
}

fn context(
    blocks: Arc<FileArchiver>,
    config: ArchiverConfig,
    node_min: usize,
    bin_capacity: usize,
) -> IndexContext {
    IndexContext::new(blocks)
        .with_tree_settings(TreeSettings::default().with_node_min(node_min))
        .with_packer_settings(PackerSettings::default().with_bin_capacity(bin_capacity))
        .with_archiver_config(config)
}

fn read_entries(path: &Path) -> Result<Vec<TermEntry>> {
    let bytes = fs::read(path).with_context(|| format!("reading {:?}", path))?;
    let mut reader = EntryReader::new(&bytes);
    let mut entries = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .with_context(|| format!("decoding entry {} of {:?}", entries.len(), path))?
    {
        entries.push(entry);
    }
    Ok(entries)
}

fn merge(args: &Args, node_min: usize, bin_capacity: usize, files: &[PathBuf]) -> Result<()> {
    let (blocks, config) = open_store(args)?;
    let existing = Manifest::load(&args.store)?;
    let node_min = match &existing {
        Some(m) if m.node_min != node_min => {
            warn!(stored = m.node_min, requested = node_min, "keeping the stored node_min");
            m.node_min
        }
        _ => node_min,
    };
    let ctx = context(blocks, config, node_min, bin_capacity);
    let mut index = match &existing {
        Some(m) => TermIndex::open(m.root()?, &ctx)?,
        None => TermIndex::new(&ctx)?,
    };

    let mut entries = Vec::new();
    for file in files {
        let read = read_entries(file)?;
        info!(file = ?file, entries = read.len(), "read entry file");
        entries.extend(read);
    }

    let outcome = index.insert(entries)?;
    let root = index.flush()?;
    Manifest {
        root: root.to_hex(),
        terms: index.len(),
        node_min,
        bin_capacity,
    }
    .save(&args.store)?;
    println!("{:?}", outcome);
    println!("root {}", root);
    Ok(())
}

fn load_index(args: &Args) -> Result<(TermIndex, Manifest, Arc<FileArchiver>)> {
    let manifest = Manifest::load(&args.store)?
        .with_context(|| format!("no index in {:?}; run merge first", args.store))?;
    let (blocks, config) = open_store(args)?;
    let ctx = context(blocks.clone(), config, manifest.node_min, manifest.bin_capacity);
    let index = TermIndex::open(manifest.root()?, &ctx)?;
    Ok((index, manifest, blocks))
}

fn lookup(args: &Args, term: &str) -> Result<()> {
    let (mut index, _, _) = load_index(args)?;
    let entries = index.lookup(term)?;
    if entries.is_empty() {
        println!("no entries for {:?}", term);
    }
    for entry in entries {
        println!("{}", entry);
    }
    Ok(())
}

fn stats(args: &Args) -> Result<()> {
    let (index, manifest, blocks) = load_index(args)?;
    println!("root:     {}", manifest.root);
    println!("terms:    {}", index.len());
    println!("blocks:   {}", blocks.block_count()?);
    println!("node_min: {}", manifest.node_min);
    Ok(())
}

fn encode(subject: &str, page: &str, title: Option<&str>, relevance: f32, out: &Path) -> Result<()> {
    let reference = Reference::new(page.as_bytes().to_vec())?;
    let mut entry = TermEntry::page(subject, reference, relevance);
    if let Some(title) = title {
        entry = entry.with_title(title);
    }
    let buf = EntryTranslator.app(&entry)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(out)
        .with_context(|| format!("opening {:?}", out))?;
    file.write_all(&buf)?;
    info!(subject, bytes = buf.len(), "appended entry");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    info!("bindex v{}", bindex::VERSION);

    match &args.command {
        Command::Merge {
            node_min,
            bin_capacity,
            files,
        } => merge(&args, *node_min, *bin_capacity, files),
        Command::Lookup { term } => lookup(&args, term),
        Command::Stats => stats(&args),
        Command::Encode {
            subject,
            page,
            title,
            relevance,
            out,
        } => encode(subject, page, title.as_deref(), *relevance, out),
    }
}
