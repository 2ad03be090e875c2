use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use schemapatch_assemble::{write_patch, Assembler};
use schemapatch_deploy::{BlockReason, DeployOutcome, Deployer, ShellExecutor};
use schemapatch_ingest::{extract, resolve, GitHistory, RangeFilter};
use schemapatch_registry::{next_identity, PatchReference, Registry};
use schemapatch_types::config::CONFIG_FILE_NAME;
use schemapatch_types::{Config, DeployResult, PatchError};

#[derive(Parser)]
#[command(name = "schemapatch", about = "Build and deploy dependency-ordered SQL patches from git history")]
struct Cli {
    /// Any path inside the repository
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default schemapatch.toml
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Assemble a patch folder from the commits matching the filters
    Create {
        code: String,
        /// Commit summary substring; defaults to the patch code
        #[arg(long = "keyword")]
        keywords: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        include: Vec<u64>,
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<u64>,
        #[arg(long)]
        depth: Option<usize>,
        #[arg(long)]
        branch: Option<String>,
        /// Folder date as YYYYMMDD; defaults to today
        #[arg(long)]
        date: Option<String>,
    },
    List {
        #[arg(long)]
        json: bool,
    },
    Show {
        /// Reference number or patch code substring
        patch: String,
    },
    Deploy {
        patch: String,
        /// Deploy even if already deployed or overlapping newer deployed patches
        #[arg(long)]
        force: bool,
    },
}

/// Repository work tree plus the configuration that applies to it.
struct Workspace {
    repo: git2::Repository,
    work_tree: PathBuf,
    config_path: PathBuf,
}

impl Workspace {
    fn discover(repo: &Path, config: Option<PathBuf>) -> Result<Self> {
        let repo = git2::Repository::discover(repo)
            .with_context(|| format!("Failed to find a git repository at {}", repo.display()))?;
        let work_tree = repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow::anyhow!("Repository has no work tree (bare repositories are not supported)"))?;
        let config_path = resolve_config_path(config, &work_tree);
        Ok(Workspace {
            repo,
            work_tree,
            config_path,
        })
    }

    fn load_config(&self) -> Result<Config> {
        Config::load(&self.config_path)
            .with_context(|| format!("Failed to load config from {}", self.config_path.display()))
    }
}

fn resolve_config_path(flag: Option<PathBuf>, work_tree: &Path) -> PathBuf {
    if let Some(p) = flag {
        return p;
    }
    if let Ok(v) = std::env::var("SCHEMAPATCH_CONFIG") {
        return PathBuf::from(v);
    }
    work_tree.join(CONFIG_FILE_NAME)
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_env("SCHEMAPATCH_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn patch_date(flag: Option<String>) -> Result<String> {
    match flag {
        Some(d) if d.len() == 8 && d.chars().all(|c| c.is_ascii_digit()) => Ok(d),
        Some(d) => anyhow::bail!("Invalid --date '{}': expected YYYYMMDD", d),
        None => Ok(chrono::Local::now().format("%Y%m%d").to_string()),
    }
}

fn format_deployed(p: &PatchReference) -> String {
    if !p.is_deployed() {
        return "never".to_string();
    }
    format!(
        "{}  {}",
        p.deployed_at.as_deref().unwrap_or_default(),
        p.result.map(|r| r.as_str()).unwrap_or("?")
    )
}

fn print_blocked(reference: usize, reason: &BlockReason) {
    match reason {
        BlockReason::AlreadyDeployed { deployed_at } => {
            eprintln!(
                "Patch {} was already deployed successfully at {}; use --force to deploy again",
                reference, deployed_at
            );
        }
        BlockReason::Conflicts {
            conflicted_files,
            with,
        } => {
            eprintln!("Patch {} overlaps newer deployed patches:", reference);
            for c in with {
                eprintln!("  {:>3}  {}  deployed {}", c.reference, c.identity.folder_name(), c.deployed_at);
            }
            eprintln!("Conflicted files:");
            for f in conflicted_files {
                eprintln!("  {}", f);
            }
            eprintln!("Use --force to deploy anyway");
        }
    }
}

/// Status 2 for mistakes the user fixes by changing arguments, 1 otherwise.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    let correctable = err
        .chain()
        .filter_map(|e| e.downcast_ref::<PatchError>())
        .any(PatchError::is_user_correctable);
    if correctable {
        2
    } else {
        1
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let ws = Workspace::discover(&cli.repo, cli.config)?;

    match cli.command {
        Commands::Init { force } => {
            if ws.config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists; use --force to overwrite",
                    ws.config_path.display()
                );
            }
            let text = Config::default().to_toml().context("Failed to render default config")?;
            std::fs::write(&ws.config_path, text)
                .with_context(|| format!("Failed to write {}", ws.config_path.display()))?;
            println!("Wrote default config to {}", ws.config_path.display());
        }

        Commands::Create {
            code,
            keywords,
            include,
            exclude,
            depth,
            branch,
            date,
        } => {
            let config = ws.load_config()?;
            let date = patch_date(date)?;
            let filter = RangeFilter {
                branch: branch.or_else(|| config.repository.branch.clone()),
                depth: depth.unwrap_or(config.repository.depth),
                include,
                exclude,
                keywords: if keywords.is_empty() { vec![code.clone()] } else { keywords },
            };

            let history = GitHistory::from_repository(ws.repo);
            let range = resolve(&history, &filter).context("Failed to resolve commit range")?;
            let changes = extract(&history, filter.branch.as_deref(), &range, &config.paths)
                .context("Failed to extract changes")?;

            let patch_root = ws.work_tree.join(&config.paths.patch_root);
            let identity = next_identity(&patch_root, &date, &code)
                .with_context(|| format!("Failed to read patch folders in {}", patch_root.display()))?;

            let patch = Assembler::new(&config, &history, &ws.work_tree)
                .build(&identity, &range, &changes)
                .with_context(|| format!("Failed to assemble patch {}", identity.folder_name()))?;
            let folder = write_patch(&patch, &patch_root)
                .with_context(|| format!("Failed to write patch {}", identity.folder_name()))?;

            println!(
                "Created {} ({} commits {}..{}, {} files, {} scripts)",
                folder.display(),
                range.relevant.len(),
                patch.commit_range.0,
                patch.commit_range.1,
                patch.relevant_files.values().map(Vec::len).sum::<usize>(),
                patch.scripts.len()
            );
            for key in patch.scripts.keys() {
                println!("  {}.sql", key);
            }
        }

        Commands::List { json } => {
            let config = ws.load_config()?;
            let patch_root = ws.work_tree.join(&config.paths.patch_root);
            let registry = Registry::scan(&patch_root)
                .with_context(|| format!("Failed to scan {}", patch_root.display()))?;

            if json {
                let patches: Vec<&PatchReference> = registry.patches().collect();
                let out = serde_json::to_string_pretty(&patches).context("Failed to serialize patches to JSON")?;
                println!("{}", out);
            } else {
                println!("{:>3}  {:<40} {:>7}  DEPLOYED", "REF", "FOLDER", "COMMITS");
                for p in registry.patches() {
                    println!(
                        "{:>3}  {:<40} {:>7}  {}",
                        p.reference,
                        p.identity.folder_name(),
                        p.commits.len(),
                        format_deployed(p)
                    );
                }
            }
        }

        Commands::Show { patch } => {
            let config = ws.load_config()?;
            let patch_root = ws.work_tree.join(&config.paths.patch_root);
            let registry = Registry::scan(&patch_root)
                .with_context(|| format!("Failed to scan {}", patch_root.display()))?;
            let selected = registry.select(&patch)?;
            let json = serde_json::to_string_pretty(selected).context("Failed to serialize patch to JSON")?;
            println!("{}", json);
        }

        Commands::Deploy { patch, force } => {
            let config = ws.load_config()?;
            let patch_root = ws.work_tree.join(&config.paths.patch_root);
            let registry = Registry::scan(&patch_root)
                .with_context(|| format!("Failed to scan {}", patch_root.display()))?;
            let executor = ShellExecutor::from_config(&config.deploy);

            match Deployer::new(&config, &executor).deploy(&registry, &patch, force)? {
                DeployOutcome::Blocked { reference, reason } => {
                    print_blocked(reference, &reason);
                    return Ok(ExitCode::from(2));
                }
                DeployOutcome::Deployed { results, patch } => {
                    println!("Deployed {}", patch.identity.folder_name());
                    for r in &results {
                        println!("  {:<20} {:<8} {}", r.schema_key, r.result, r.log_file);
                    }
                    if results.iter().any(|r| r.result == DeployResult::Error) {
                        return Ok(ExitCode::from(1));
                    }
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}
