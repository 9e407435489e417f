use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

use revfetch::git::{self, CloneOptions, Context, Credentials, GitCli, RepoError, Repository};

/// Oldest git that understands `--config-env`.
const MIN_GIT_VERSION: (u32, u32) = (2, 31);

#[derive(Parser)]
#[command(
    name = "revfetch",
    about = "Read files from a git repository at any revision"
)]
struct Cli {
    /// Give up after this many seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// git binary to run
    #[arg(long, global = true, default_value = "git")]
    git: PathBuf,

    /// Directory to create temporary clones in
    #[arg(long, global = true)]
    temp_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a file's content at a revision to stdout
    Show {
        /// Repository URL
        url: String,
        /// Branch, tag or commit id
        revision: String,
        /// Path relative to the repository root
        path: PathBuf,
    },

    /// Print the commit id a revision resolves to
    Revision {
        /// Repository URL
        url: String,
        /// Branch, tag or commit id
        revision: String,
    },

    /// Check dependencies
    Doctor,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let ctx = match cli.timeout {
        Some(secs) => Context::with_timeout(Duration::from_secs(secs)),
        None => Context::background(),
    };
    let interrupt = ctx.clone();
    if let Err(e) = ctrlc::set_handler(move || interrupt.cancel()) {
        log::warn!("failed to install Ctrl-C handler: {}", e);
    }

    let options = CloneOptions {
        temp_root: cli.temp_dir,
        git: GitCli::with_git_path(cli.git),
    };

    let result = match cli.command {
        Commands::Show {
            url,
            revision,
            path,
        } => cmd_show(&ctx, &options, &url, &revision, &path),
        Commands::Revision { url, revision } => cmd_revision(&ctx, &options, &url, &revision),
        Commands::Doctor => cmd_doctor(&options),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        if let Some(RepoError::AuthenticationRequired) = e.downcast_ref::<RepoError>() {
            eprintln!();
            eprintln!("Hint: export REVFETCH_USERNAME and REVFETCH_PASSWORD");
        }
        std::process::exit(1);
    }
}

/// Credentials come from the environment so they never show up in `ps`.
fn credentials_from_env() -> Option<Credentials> {
    let username = std::env::var("REVFETCH_USERNAME").ok()?;
    let password = std::env::var("REVFETCH_PASSWORD").ok()?;
    Some(Credentials::new(username, password))
}

/// Clone, check out `revision`, run `f`, and always release the clone.
fn with_checkout<T>(
    ctx: &Context,
    options: &CloneOptions,
    url: &str,
    revision: &str,
    f: impl FnOnce(&Repository) -> Result<T, Box<dyn std::error::Error>>,
) -> Result<T, Box<dyn std::error::Error>> {
    let (release, result) = git::clone_with(ctx, url, credentials_from_env(), options);
    let _guard = release.guard();
    let mut repo = result?;
    repo.checkout(ctx, revision)?;
    f(&repo)
}

fn cmd_show(
    ctx: &Context,
    options: &CloneOptions,
    url: &str,
    revision: &str,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let content = with_checkout(ctx, options, url, revision, |repo| {
        Ok(repo.file_content(path)?)
    })?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&content)?;
    stdout.flush()?;

    Ok(())
}

fn cmd_revision(
    ctx: &Context,
    options: &CloneOptions,
    url: &str,
    revision: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let commit = with_checkout(ctx, options, url, revision, |repo| {
        Ok(repo.current_revision(ctx)?)
    })?;

    println!("{}", commit);

    Ok(())
}

fn cmd_doctor(options: &CloneOptions) -> Result<(), Box<dyn std::error::Error>> {
    println!("revfetch System Check\n");

    // Check git
    let version = std::process::Command::new(options.git.git_path())
        .arg("--version")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());
    let git_ok = version.is_some();
    println!(
        "[{}] git: {}",
        if git_ok { "OK" } else { "FAIL" },
        version.as_deref().unwrap_or("not found")
    );

    // --config-env is how credentials reach git
    let config_env_ok = version
        .as_deref()
        .and_then(parse_git_version)
        .is_some_and(|v| v >= MIN_GIT_VERSION);
    println!(
        "[{}] --config-env: {}",
        if config_env_ok { "OK" } else { "FAIL" },
        if config_env_ok {
            "supported".to_string()
        } else {
            format!(
                "needs git {}.{} or newer",
                MIN_GIT_VERSION.0, MIN_GIT_VERSION.1
            )
        }
    );

    // Check temp directory
    let temp_root = options
        .temp_root
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let temp_ok = tempfile::tempdir_in(&temp_root).is_ok();
    println!(
        "[{}] Temp dir: {}",
        if temp_ok { "OK" } else { "FAIL" },
        temp_root.display()
    );

    if !git_ok || !config_env_ok || !temp_ok {
        std::process::exit(1);
    }

    Ok(())
}

/// Major and minor version out of `git --version` output.
fn parse_git_version(output: &str) -> Option<(u32, u32)> {
    let version = output.strip_prefix("git version ")?;
    let mut parts = version.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
