//! xlpatch - game patch downloader and installer
//!
//! Command line front end over the install pipeline.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use xlpatch::cancel::CancelToken;
use xlpatch::installer::{InstallConfig, InstallError, InstallEvent, PatchInstaller, MAX_CONCURRENT_DOWNLOADS};
use xlpatch::paths::{GameLayout, InstallRoots};
use xlpatch::patchlist::{ManifestSource, PatchDescriptor};
use xlpatch::repository::Repository;
use xlpatch::settings::LauncherSettings;
use xlpatch::verify::{compute_block_hashes, verify_patch, VerifyOutcome};
use xlpatch::version::VersionStore;
use xlpatch::zipatch::{apply_patch_file, ApplyConfig, Platform, ZiPatchReader};

#[derive(Parser)]
#[command(name = "xlpatch")]
#[command(version)]
#[command(about = "Downloads and installs game patches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true, env = "XLPATCH_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Args)]
struct GameArgs {
    /// Game root (holds boot/ and game/); defaults to the saved setting
    #[arg(short, long, env = "XLPATCH_GAME_PATH")]
    game: Option<PathBuf>,
}

#[derive(Args)]
struct SourceArgs {
    /// Session id from the login service (uses the authenticated patch check)
    #[arg(long, env = "XLPATCH_SESSION_ID", hide_env_values = true)]
    session_id: Option<String>,

    /// Boot integrity line sent ahead of the expansion versions
    #[arg(long)]
    boot_report: Option<String>,

    /// Public tab-separated patch list URL
    #[arg(long, env = "XLPATCH_PATCH_LIST")]
    patch_list: Option<String>,

    /// Override the boot patch server base URL
    #[arg(long)]
    boot_base: Option<String>,

    /// Override the game patch server base URL
    #[arg(long)]
    game_base: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show installed versions
    Status {
        #[command(flatten)]
        game: GameArgs,
    },

    /// Save defaults to the settings file
    Configure {
        #[command(flatten)]
        game: GameArgs,

        /// Directory for downloaded patches
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// Maximum concurrent downloads
        #[arg(short, long)]
        concurrent: Option<usize>,

        /// Keep patch files after they are applied
        #[arg(long)]
        keep_patches: Option<bool>,

        /// Public tab-separated patch list URL
        #[arg(long)]
        patch_list: Option<String>,
    },

    /// List the patches this install still needs
    Check {
        #[command(flatten)]
        game: GameArgs,

        #[command(flatten)]
        source: SourceArgs,
    },

    /// Download and install every required patch
    Update {
        #[command(flatten)]
        game: GameArgs,

        #[command(flatten)]
        source: SourceArgs,

        /// Directory for downloaded patches
        #[arg(short, long, env = "XLPATCH_PATCH_STORE")]
        store: Option<PathBuf>,

        /// Maximum concurrent downloads
        #[arg(short, long)]
        concurrent: Option<usize>,

        /// Delete patch files after they are applied
        #[arg(long)]
        delete_patches: bool,

        /// Print events as JSON lines instead of progress bars
        #[arg(long)]
        json: bool,
    },

    /// Apply one local patch file
    Apply {
        /// Path to the .patch file
        patch_file: PathBuf,

        #[command(flatten)]
        game: GameArgs,

        /// Repository the patch belongs to
        #[arg(short, long, default_value = "game")]
        repository: String,

        /// Platform used for sqpack file names until the patch says otherwise
        #[arg(long, value_enum, default_value = "win32")]
        platform: PlatformArg,

        /// Treat missing files and directories as already deleted
        #[arg(long)]
        ignore_missing: bool,

        /// Record this version in the repository's marker afterwards
        #[arg(long)]
        set_version: Option<String>,
    },

    /// List the chunks of a patch file
    Inspect {
        /// Path to the .patch file
        patch_file: PathBuf,
    },

    /// Check a downloaded patch against its block hashes
    Verify {
        /// Path to the .patch file
        patch_file: PathBuf,

        /// Bytes covered by each hash
        #[arg(long)]
        block_size: u64,

        /// Expected SHA1 hashes, comma separated; omit to print them
        #[arg(long, value_delimiter = ',')]
        hashes: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PlatformArg {
    Win32,
    Ps3,
    Ps4,
}

impl From<PlatformArg> for Platform {
    fn from(arg: PlatformArg) -> Self {
        match arg {
            PlatformArg::Win32 => Platform::Win32,
            PlatformArg::Ps3 => Platform::Ps3,
            PlatformArg::Ps4 => Platform::Ps4,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.log_file.as_deref())?;
    let mut settings = LauncherSettings::load();

    match cli.command {
        Commands::Configure {
            game,
            store,
            concurrent,
            keep_patches,
            patch_list,
        } => {
            if let Some(path) = game.game {
                settings.game_path = path.to_string_lossy().into_owned();
            }
            if let Some(path) = store {
                settings.patch_store = path.to_string_lossy().into_owned();
            }
            if let Some(n) = concurrent {
                if n == 0 || n > MAX_CONCURRENT_DOWNLOADS {
                    bail!("--concurrent must be between 1 and {}", MAX_CONCURRENT_DOWNLOADS);
                }
                settings.max_concurrent_downloads = Some(n);
            }
            if keep_patches.is_some() {
                settings.keep_patches = keep_patches;
            }
            if patch_list.is_some() {
                settings.endpoints.public_list = patch_list;
            }

            settings.save()?;
            println!("Settings saved to {}", LauncherSettings::settings_path()?.display());
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }

        Commands::Status { game } => {
            let game_path = resolve_game_path(game, &settings)?;
            let store = VersionStore::new(&game_path);

            println!("Game: {}\n", game_path.display());
            for repo in Repository::ALL {
                let marker = store.read(repo)?;
                let state = if marker.is_installed() { "" } else { " (not installed)" };
                println!("{:<5} {}{}", repo.to_string(), marker.version, state);
            }
        }

        Commands::Check { game, source } => {
            let config = build_config(game, source, None, &settings)?;
            let installer = PatchInstaller::new(config)?;
            let patches = installer.check().await?;

            if patches.is_empty() {
                println!("Up to date.");
            } else {
                print_patch_table(&patches);
            }
        }

        Commands::Update {
            game,
            source,
            store,
            concurrent,
            delete_patches,
            json,
        } => {
            let mut config = build_config(game, source, store, &settings)?;
            if let Some(n) = concurrent.or(settings.max_concurrent_downloads) {
                config.max_concurrent_downloads = n;
            }
            config.keep_patches = !delete_patches && settings.keep_patches.unwrap_or(true);

            let installer = PatchInstaller::new(config)?;
            let cancel = CancelToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nCancelling...");
                    ctrl_c.cancel();
                }
            });

            let (tx, rx) = mpsc::unbounded_channel();
            let render = tokio::spawn(render_events(rx, json));
            let result = installer.run(&tx, &cancel).await;
            drop(tx);
            render.await.context("Progress display failed")?;

            match result {
                Ok(stats) => {
                    if !json {
                        println!("\n=== Update Summary ===");
                        println!(
                            "Patches:    {} installed ({} already downloaded)",
                            stats.installed, stats.skipped
                        );
                        println!("Downloaded: {}", HumanBytes(stats.bytes_downloaded));
                    }
                }
                Err(InstallError::Cancelled) => bail!("Update cancelled"),
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Apply {
            patch_file,
            game,
            repository,
            platform,
            ignore_missing,
            set_version,
        } => {
            let repository = Repository::from_name(&repository)
                .with_context(|| format!("Unknown repository '{}'", repository))?;
            let game_path = resolve_game_path(game, &settings)?;
            let root = GameLayout::new(&game_path).install_root(repository);
            std::fs::create_dir_all(&root)
                .with_context(|| format!("Failed to create {}", root.display()))?;

            let config = ApplyConfig {
                platform: platform.into(),
                ignore_missing,
                ..ApplyConfig::new(&root)
            };
            let summary = apply_patch_file(&patch_file, config, &CancelToken::new())
                .with_context(|| format!("Failed to apply {}", patch_file.display()))?;

            println!("Applied {} to {}", patch_file.display(), root.display());
            println!(
                "Chunks: {}  dirs +{} -{}  files +{} -{}  bytes {}",
                summary.chunks,
                summary.directories_created,
                summary.directories_deleted,
                summary.files_written,
                summary.files_deleted,
                HumanBytes(summary.bytes_written)
            );

            if let Some(version) = set_version {
                VersionStore::new(&game_path).write(repository, &version)?;
                println!("{} marker set to {}", repository, version);
            }
        }

        Commands::Inspect { patch_file } => {
            let file = File::open(&patch_file)
                .with_context(|| format!("Failed to open {}", patch_file.display()))?;
            let mut reader = ZiPatchReader::new(BufReader::new(file))?;

            let mut count = 0;
            while let Some((frame, chunk)) = reader.next_chunk()? {
                println!(
                    "{:>12}  {}  {:>10}  {}",
                    frame.offset,
                    frame.tag,
                    frame.payload_size,
                    chunk.describe()
                );
                count += 1;
            }
            eprintln!("\nTotal: {} chunks", count);
        }

        Commands::Verify {
            patch_file,
            block_size,
            hashes,
        } => {
            if block_size == 0 {
                bail!("--block-size must be greater than zero");
            }

            if hashes.is_empty() {
                for (i, hash) in compute_block_hashes(&patch_file, block_size)?.iter().enumerate() {
                    println!("{:>6}  {}", i, hash);
                }
            } else {
                let name = patch_file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mut patch = PatchDescriptor::new(name, "", 0, "", Repository::Game);
                patch.hash_type = Some("sha1".to_string());
                patch.hash_block_size = block_size;
                patch.hashes = hashes;

                match verify_patch(&patch_file, &patch)? {
                    VerifyOutcome::Verified { blocks } => println!("OK ({} blocks)", blocks),
                    VerifyOutcome::Skipped => println!("No hashes to check"),
                }
            }
        }
    }

    Ok(())
}

/// Set up tracing; the returned guard must live until exit so file logs are flushed
fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let directive = if verbose { "xlpatch=debug" } else { "xlpatch=info" };

    if let Some(path) = log_file {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let name = path.file_name().context("--log-file needs a file name")?;
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
            .with_writer(writer)
            .init();
        return Ok(Some(guard));
    }

    // Only log to the terminal if verbose or RUST_LOG is set
    if verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(if verbose { "xlpatch=debug".parse()? } else { "xlpatch=warn".parse()? }),
            )
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(None)
}

fn resolve_game_path(args: GameArgs, settings: &LauncherSettings) -> Result<PathBuf> {
    args.game
        .or_else(|| settings.game_path())
        .context("No game path given (use --game or set game_path in settings.json)")
}

fn build_config(
    game: GameArgs,
    source: SourceArgs,
    store: Option<PathBuf>,
    settings: &LauncherSettings,
) -> Result<InstallConfig> {
    let game_path = resolve_game_path(game, settings)?;
    let patch_store = store
        .or_else(|| settings.patch_store())
        .context("No patch store given (use --store or set patch_store in settings.json)")?;

    let mut endpoints = settings.endpoints.clone();
    if let Some(base) = source.boot_base {
        endpoints.boot_base = base;
    }
    if let Some(base) = source.game_base {
        endpoints.game_base = base;
    }

    let manifest = match (source.session_id, source.patch_list.or_else(|| endpoints.public_list.clone())) {
        (Some(session_id), _) => ManifestSource::Authenticated {
            session_id,
            boot_report: source.boot_report,
        },
        (None, Some(url)) => ManifestSource::Public { url },
        (None, None) => bail!("Need either --session-id or --patch-list"),
    };

    let mut config = InstallConfig::new(game_path, patch_store, manifest);
    config.endpoints = endpoints;
    Ok(config)
}

fn print_patch_table(patches: &[PatchDescriptor]) {
    let total: u64 = patches.iter().map(|p| p.size_bytes).sum();
    for p in patches {
        println!(
            "{:<5} {:<24} {:>10}  {}",
            p.repository.to_string(),
            p.version,
            HumanBytes(p.size_bytes).to_string(),
            p.file_name
        );
    }
    println!("\n{} patches, {}", patches.len(), HumanBytes(total));
}

async fn render_events(mut rx: mpsc::UnboundedReceiver<InstallEvent>, json: bool) {
    if json {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("Failed to encode event: {}", e),
            }
        }
        return;
    }

    let multi = MultiProgress::new();
    let mut download_pb: Option<ProgressBar> = None;
    let mut install_pb: Option<ProgressBar> = None;

    while let Some(event) = rx.recv().await {
        match event {
            InstallEvent::Started => {}
            InstallEvent::Downloading {
                downloaded,
                total,
                completed,
                in_flight,
                ..
            } => {
                let pb = download_pb.get_or_insert_with(|| {
                    let pb = multi.add(ProgressBar::new(total));
                    pb.set_style(
                        ProgressStyle::default_bar()
                            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) | {msg}")
                            .unwrap()
                            .progress_chars("=>-"),
                    );
                    pb.enable_steady_tick(Duration::from_millis(100));
                    pb
                });
                pb.set_length(total);
                pb.set_position(downloaded);
                pb.set_message(format!("{} done, {} active", completed, in_flight));
            }
            InstallEvent::Installing {
                index,
                total,
                file_name,
            } => {
                if let Some(pb) = download_pb.take() {
                    pb.finish_with_message("downloads complete");
                }
                let pb = install_pb.get_or_insert_with(|| {
                    let pb = multi.add(ProgressBar::new(total as u64));
                    pb.set_style(
                        ProgressStyle::default_bar()
                            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} | {msg}")
                            .unwrap()
                            .progress_chars("=>-"),
                    );
                    pb
                });
                pb.set_length(total as u64);
                pb.set_position(index.saturating_sub(1) as u64);
                pb.set_message(file_name);
            }
            InstallEvent::Complete { patches, .. } => {
                if let Some(pb) = install_pb.take() {
                    pb.finish_with_message("installed");
                }
                if patches == 0 {
                    println!("Up to date.");
                }
            }
            InstallEvent::Cancelled => {
                for pb in download_pb.take().into_iter().chain(install_pb.take()) {
                    pb.abandon_with_message("cancelled");
                }
            }
            InstallEvent::Error { code, message } => {
                for pb in download_pb.take().into_iter().chain(install_pb.take()) {
                    pb.abandon_with_message("failed");
                }
                eprintln!("Error [{}]: {}", code.as_str(), message);
            }
        }
    }
}
