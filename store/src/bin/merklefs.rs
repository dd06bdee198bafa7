use std::path::PathBuf;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use merklefs_castore::fs::fuse::Mount;
use merklefs_castore::fs::MerkleFs;
use merklefs_castore::import::build_tree;
use merklefs_castore::metadata::{bundle, BundleOptions};
use merklefs_castore::pool::ObjectPool;
use merklefs_castore::{CasDigest, Tree};
use merklefs_store::compress::{compress_tree, ZstdOptions};
use merklefs_store::config::{Config, DEFAULT_CONFIG_PATH};
use merklefs_store::location::LocationClient;
use merklefs_store::resolver::FetchingObjectService;

#[derive(Parser)]
#[command(author, version, about = "read-only content-addressed filesystem", long_about = None)]
struct Cli {
    /// A global log level to use when printing logs. `RUST_LOG` always has
    /// priority.
    #[arg(long)]
    log_level: Option<Level>,

    /// Configuration file providing defaults for pool, remote, tracker and
    /// conversion knobs.
    #[arg(long, env = "MERKLEFS_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mounts a manifest at the given mountpoint.
    Mount {
        #[clap(value_name = "PATH")]
        dest: PathBuf,

        /// Metadata manifest describing the tree.
        #[arg(long, short = 'm', env = "MERKLEFS_META")]
        meta: PathBuf,

        /// Local content pool.
        #[arg(long, env = "MERKLEFS_POOL")]
        pool: Option<PathBuf>,

        /// Remote origin serving objects over HTTP.
        #[arg(long, env = "MERKLEFS_REMOTE")]
        remote: Option<String>,

        /// Tracker endpoint; enables fetching from peers.
        #[arg(long, env = "MERKLEFS_TRACKER")]
        tracker: Option<String>,

        /// Name announced to the tracker.
        #[arg(long, env = "HOSTNAME")]
        host: Option<String>,

        /// Port peers serve their pool on.
        #[arg(long)]
        port: Option<u16>,

        /// Number of FUSE threads to spawn.
        #[arg(long, env, default_value_t = default_threads())]
        threads: usize,

        /// Whether to configure the mountpoint with allow_other.
        #[arg(long, env, default_value_t = false)]
        allow_other: bool,
    },
    /// Builds a manifest (and pool) from a source directory.
    Convert {
        /// Source directory to convert from.
        #[arg(long, short = 'f')]
        from: PathBuf,

        /// File to store the manifest in.
        #[arg(long, short = 'o')]
        output: PathBuf,

        /// Content pool to stash objects into; hashing only when absent.
        #[arg(long, short = 'p')]
        pool: Option<PathBuf>,

        /// Bundle container target size; 0 disables bundling.
        #[arg(long)]
        bsize: Option<u64>,

        /// Intra-container alignment; 0 disables.
        #[arg(long)]
        asize: Option<u64>,

        /// Bundle reference directory for incremental reuse.
        #[arg(long)]
        brefs: Option<PathBuf>,

        /// Compressed mirror directory; enables the zstd pass.
        #[arg(long)]
        zpool: Option<PathBuf>,

        /// Only compress objects at least this large.
        #[arg(long)]
        zsize: Option<u64>,

        /// Keep compressed variants smaller than original * zrate.
        #[arg(long)]
        zrate: Option<f64>,

        /// External compressor level.
        #[arg(long)]
        zlevel: Option<i32>,
    },
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.into())
        .unwrap_or(4)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                EnvFilter::builder()
                    .with_default_directive(
                        cli.log_level.unwrap_or(Level::INFO).into(),
                    )
                    .from_env_lossy(),
            ),
        )
        .init();

    let config = Config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Mount {
            dest,
            meta,
            pool,
            remote,
            tracker,
            host,
            port,
            threads,
            allow_other,
        } => {
            let tree = Tree::restore(&meta)
                .with_context(|| format!("restoring manifest {}", meta.display()))?;
            info!(meta = %meta.display(), nodes = tree.len(), "manifest restored");

            let Some(pool_path) = pool.or(config.pool.clone()) else {
                bail!("no pool directory configured (--pool or config `pool`)");
            };
            let pool = ObjectPool::new(&pool_path)
                .with_context(|| format!("opening pool {}", pool_path.display()))?;

            let origin = match remote {
                Some(remote) => Config {
                    remote: Some(remote),
                    ..Default::default()
                }
                .remote_url()?,
                None => config.remote_url()?,
            };

            // an explicit --tracker enables peer fetching; the config file
            // needs its `fetcher` toggle as well
            let tracker_addr = match tracker {
                Some(addr) => Some(addr),
                None if config.fetcher => config.tracker.clone(),
                None => None,
            };
            let location = match tracker_addr {
                Some(addr) => {
                    let Some(host) = host.or(config.host.clone()) else {
                        bail!("tracker configured but no hostname (--host or config `host`)");
                    };
                    Some(LocationClient::new(&addr, host, port.or(config.port))?)
                }
                None => None,
            };

            let service = FetchingObjectService::new(pool, origin, location);
            let fs = MerkleFs::new(tree, service)?;

            let mut mount = Mount::new(fs, &dest, threads, allow_other)
                .with_context(|| format!("mounting at {}", dest.display()))?;
            info!(mountpoint = %dest.display(), "mounted");

            tokio::signal::ctrl_c().await?;
            info!("interrupted, unmounting");
            mount.unmount()?;
        }
        Commands::Convert {
            from,
            output,
            pool,
            bsize,
            asize,
            brefs,
            zpool,
            zsize,
            zrate,
            zlevel,
        } => {
            let pool = pool
                .or(config.pool.clone())
                .map(ObjectPool::new)
                .transpose()?;

            let mut tree = match &pool {
                Some(pool) => build_tree(&from, |path| pool.stash_file(path))?,
                None => {
                    warn!("no pool configured, hashing without stashing");
                    build_tree(&from, CasDigest::from_file)?
                }
            };
            info!(nodes = tree.len(), "tree built");

            let bsize = bsize.unwrap_or(config.bsize);
            if bsize > 0 {
                let Some(pool) = &pool else {
                    bail!("bundling requires a pool directory");
                };
                let brefs = brefs.or(config.brefs.clone());
                if let Some(brefs) = &brefs {
                    std::fs::create_dir_all(brefs)?;
                }
                bundle(
                    &mut tree,
                    pool,
                    &BundleOptions {
                        bsize,
                        asize: asize.unwrap_or(config.asize),
                        brefs: brefs.as_deref(),
                    },
                );
                info!(bsize, "bundling pass done");
            }

            if let Some(zpool) = zpool.or(config.zpool.clone()) {
                let Some(pool) = &pool else {
                    bail!("the zstd pass requires a pool directory");
                };
                std::fs::create_dir_all(&zpool)?;
                let opts = ZstdOptions {
                    zsize: zsize.unwrap_or(config.zsize),
                    zrate: zrate.unwrap_or(if config.zrate > 0.0 {
                        config.zrate
                    } else {
                        1.0
                    }),
                    level: zlevel.unwrap_or_else(|| config.zstd_level()),
                };
                compress_tree(&mut tree, pool, &zpool, &opts);
                info!(zpool = %zpool.display(), "zstd pass done");
            }

            tree.save(&output)
                .with_context(|| format!("saving manifest {}", output.display()))?;
            info!(output = %output.display(), "manifest saved");
        }
    }

    Ok(())
}
