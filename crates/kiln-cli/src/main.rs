mod commands;
mod config;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{Target, EXIT_CONFIG_ERROR, EXIT_FAILURE};
use config::{default_config_path, KilnConfig};
use kiln_runtime::LaunchOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Drive LXD containers and Multipass VMs as build instances"
)]
struct Cli {
    /// Backend to drive: lxd, multipass or mock. Overrides the config file.
    #[arg(long, global = true)]
    backend: Option<String>,

    /// LXD project the instance lives in.
    #[arg(long, global = true)]
    project: Option<String>,

    /// LXD remote the instance lives on.
    #[arg(long, global = true)]
    remote: Option<String>,

    /// Path to the config file (default: ~/.config/kiln/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create and start an instance unless it already exists.
    Launch {
        name: String,
        /// Image to launch, e.g. 22.04.
        #[arg(long, default_value = "22.04")]
        image: String,
        /// Image server the image is fetched from.
        #[arg(long, default_value = "ubuntu")]
        image_remote: String,
        /// Delete the instance when it stops.
        #[arg(long, default_value_t = false)]
        ephemeral: bool,
    },
    /// Start a stopped instance.
    Start { name: String },
    /// Stop a running instance.
    Stop { name: String },
    /// Delete an instance. Deleting an absent instance succeeds.
    Delete { name: String },
    /// Show instance state and active mounts.
    Status { name: String },
    /// Run a command inside an instance and exit with its exit code.
    Exec {
        name: String,
        /// Working directory inside the instance.
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// KEY=VALUE to set, or bare KEY to unset. Repeatable.
        #[arg(long = "env", short = 'e')]
        env: Vec<String>,
        /// Command and arguments to run.
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
    /// Write a host file into an instance with the given mode and owner.
    Push {
        name: String,
        source: PathBuf,
        /// Absolute destination path inside the instance.
        destination: PathBuf,
        #[arg(long, default_value = "644")]
        mode: String,
        #[arg(long, default_value = "root")]
        user: String,
        #[arg(long, default_value = "root")]
        group: String,
    },
    /// Copy a file out of an instance.
    Pull {
        name: String,
        /// Absolute source path inside the instance.
        source: PathBuf,
        destination: PathBuf,
    },
    /// Bind a host directory into an instance.
    Mount {
        name: String,
        host_source: PathBuf,
        /// Absolute mount point inside the instance.
        target: PathBuf,
    },
    /// Remove a mount, or every mount with --all.
    Unmount {
        name: String,
        target: Option<PathBuf>,
        #[arg(long, default_value_t = false, conflicts_with = "target")]
        all: bool,
    },
    /// Check that the selected backend is usable on this host.
    Doctor,
    /// Show the effective backend, project and remote.
    Config {
        /// Write the effective settings to the config file.
        #[arg(long, default_value_t = false)]
        save: bool,
    },
    /// Generate shell completions.
    Completions { shell: Shell },
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    match &cli.config {
        Some(path) => Some(path.clone()),
        None => default_config_path().ok(),
    }
}

fn resolve_target(cli: &Cli) -> Result<Target, String> {
    let config = match config_path(cli) {
        Some(path) => KilnConfig::load_or_default(&path).map_err(|e| e.to_string())?,
        None => KilnConfig::default(),
    };
    let target = Target {
        backend: cli.backend.clone().unwrap_or(config.backend),
        project: cli.project.clone().unwrap_or(config.project),
        remote: cli.remote.clone().unwrap_or(config.remote),
    };
    debug!(
        "backend {}, project {}, remote {}",
        target.backend, target.project, target.remote
    );
    Ok(target)
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let result = resolve_target(&cli).and_then(|target| dispatch(cli, &target));

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("config error:") {
                EXIT_CONFIG_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn dispatch(cli: Cli, target: &Target) -> Result<u8, String> {
    let json_output = cli.json;
    let cfg_path = config_path(&cli);

    let needs_backend = !matches!(
        cli.command,
        Commands::Doctor | Commands::Config { .. } | Commands::Completions { .. }
    );
    if needs_backend && std::env::var("KILN_SKIP_PREREQS").as_deref() != Ok("1") {
        let missing = kiln_runtime::check_backend_prereqs(&target.backend);
        if !missing.is_empty() {
            return Err(kiln_runtime::format_missing(&missing));
        }
    }

    match cli.command {
        Commands::Launch {
            name,
            image,
            image_remote,
            ephemeral,
        } => commands::launch::run(
            target,
            &name,
            &LaunchOptions::new(image, image_remote).ephemeral(ephemeral),
            json_output,
        ),
        Commands::Start { name } => commands::lifecycle::start(target, &name),
        Commands::Stop { name } => commands::lifecycle::stop(target, &name),
        Commands::Delete { name } => commands::lifecycle::delete(target, &name),
        Commands::Status { name } => commands::status::run(target, &name, json_output),
        Commands::Exec {
            name,
            cwd,
            env,
            command,
        } => commands::exec::run(target, &name, &command, cwd, &env, json_output),
        Commands::Push {
            name,
            source,
            destination,
            mode,
            user,
            group,
        } => commands::transfer::push(
            target,
            &name,
            &commands::transfer::PushArgs {
                source: &source,
                destination: &destination,
                mode: &mode,
                user: &user,
                group: &group,
            },
        ),
        Commands::Pull {
            name,
            source,
            destination,
        } => commands::transfer::pull(target, &name, &source, &destination),
        Commands::Mount {
            name,
            host_source,
            target: guest,
        } => commands::mount::mount(target, &name, &host_source, &guest),
        Commands::Unmount {
            name,
            target: guest,
            all,
        } => commands::mount::unmount(target, &name, guest.as_deref(), all),
        Commands::Doctor => commands::doctor::run(target, json_output),
        Commands::Config { save } => {
            commands::config::run(target, cfg_path.as_deref(), save, json_output)
        }
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    }
}
