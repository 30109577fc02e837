//! keel - compose-style service orchestrator
//!
//! This is the main CLI entry point for keel.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use keel::compose::environment::DEFAULT_ENV_FILE;
use keel::compose::{
    ComposeOrchestrator, ConfigLoader, DependencyGraph, ProfileSelector, Project,
    VariableSnapshot,
};
use keel::container::ProcessRuntime;
use keel::provision::Provisioner;
use keel::supervisor::{check_port_conflicts, Supervisor, SupervisorConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// keel - compose-style service orchestrator
#[derive(Parser)]
#[command(name = "keel")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Run a compose project's services on this host", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Directory holding provisioned networks and volumes
    #[arg(long, global = true, env = "KEEL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Options selecting and loading a project
#[derive(Args)]
struct ProjectArgs {
    /// Compose file; repeat to overlay files in order
    #[arg(short, long = "file")]
    files: Vec<PathBuf>,
    /// Project name
    #[arg(short = 'p', long)]
    project_name: Option<String>,
    /// Profile to activate; repeat for several
    #[arg(long = "profile")]
    profiles: Vec<String>,
    /// Variables file, `.env` in the project directory by default
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Project directory, the first compose file's directory by default
    #[arg(long)]
    project_directory: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision and run the project's services until Ctrl-C
    Up {
        #[command(flatten)]
        project: ProjectArgs,
        /// Seconds a container has to reach running
        #[arg(long, default_value = "60")]
        start_timeout: u64,
        /// Seconds a service waits for its dependencies (unbounded if unset)
        #[arg(long)]
        dependency_timeout: Option<u64>,
        /// Milliseconds between restart attempts
        #[arg(long, default_value = "1000")]
        restart_delay: u64,
    },
    /// Remove the project's networks
    Down {
        #[command(flatten)]
        project: ProjectArgs,
        /// Remove named volumes as well
        #[arg(short, long)]
        volumes: bool,
    },
    /// Print the resolved project
    Config {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Print the start order
    Plan {
        #[command(flatten)]
        project: ProjectArgs,
    },
}

impl ProjectArgs {
    fn working_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.project_directory {
            return Ok(dir.clone());
        }
        if let Some(parent) = self
            .files
            .first()
            .and_then(|f| f.parent())
            .filter(|p| !p.as_os_str().is_empty())
        {
            return Ok(parent.to_path_buf());
        }
        Ok(std::env::current_dir()?)
    }

    fn load(&self) -> Result<(Project, ProfileSelector)> {
        let working_dir = self.working_dir()?;

        let files = if self.files.is_empty() {
            vec![ConfigLoader::find_compose_file(&working_dir).with_context(|| {
                format!("no compose file found in {}", working_dir.display())
            })?]
        } else {
            self.files.clone()
        };

        let mut vars = VariableSnapshot::from_process();
        match &self.env_file {
            Some(path) => vars = vars.with_env_file(path)?,
            None => {
                let default = working_dir.join(DEFAULT_ENV_FILE);
                if default.is_file() {
                    vars = vars.with_env_file(&default)?;
                }
            }
        }

        let mut loader = ConfigLoader::new(working_dir);
        if let Some(name) = &self.project_name {
            loader = loader.project_name(name);
        }

        let project = loader
            .load_files(&files, &vars)
            .context("failed to load compose project")?;
        let profiles = ProfileSelector::from_args(&self.profiles, &vars);
        Ok((project, profiles))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Get base path for keel data
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("keel")
    });

    match cli.command {
        Commands::Up {
            project,
            start_timeout,
            dependency_timeout,
            restart_delay,
        } => {
            let (project, profiles) = project.load()?;
            let config = SupervisorConfig {
                start_timeout: Duration::from_secs(start_timeout),
                dependency_timeout: dependency_timeout.map(Duration::from_secs),
                restart_delay: Duration::from_millis(restart_delay),
            };

            let supervisor = Supervisor::new(Arc::new(ProcessRuntime::new()), config);
            let provisioner = Provisioner::new(&data_dir)
                .with_context(|| format!("failed to open data directory {}", data_dir.display()))?;
            let orchestrator =
                ComposeOrchestrator::new(&project, &profiles, provisioner, supervisor)?;

            let mut deployment = orchestrator.up()?;
            println!("Started project {}", orchestrator.project().name);

            let interrupted = tokio::select! {
                _ = tokio::signal::ctrl_c() => true,
                _ = deployment.settled() => false,
            };
            if interrupted {
                println!("Stopping project {}...", orchestrator.project().name);
            }
            deployment.shutdown().await?;

            let mut failed = 0;
            for (name, status) in deployment.snapshot() {
                if status.is_failed() {
                    failed += 1;
                }
                println!("{:<24} {}", name, status.state);
            }
            if failed > 0 && !interrupted {
                bail!("{} service(s) failed", failed);
            }
        }

        Commands::Down { project, volumes } => {
            let (project, _) = project.load()?;
            Provisioner::new(&data_dir)?.teardown(&project, volumes)?;
            println!("Removed project {}", project.name);
        }

        Commands::Config { project } => {
            let (project, profiles) = project.load()?;
            print!("{}", serde_yaml::to_string(&profiles.select(&project))?);
        }

        Commands::Plan { project } => {
            let (project, profiles) = project.load()?;
            let selected = profiles.select(&project);
            let graph = DependencyGraph::build(&selected.services)?;
            check_port_conflicts(selected.services.values())?;

            for (index, level) in graph.levels().iter().enumerate() {
                println!("{}: {}", index + 1, level.join(", "));
            }
        }
    }

    Ok(())
}
