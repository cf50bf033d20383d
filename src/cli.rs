use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::io;
use std::path::PathBuf;

use crate::command;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "exitbox")]
#[command(about = "Run AI coding agents inside hardened, egress-filtered container sandboxes")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
pub struct TargetArgs {
    /// Project directory (defaults to the current directory)
    #[arg(value_name = "DIR")]
    pub project_dir: Option<PathBuf>,

    /// Workspace to use (overrides the resolution chain)
    #[arg(short = 'w', long)]
    pub workspace: Option<String>,

    /// Agent to run
    #[arg(long, default_value = "claude")]
    pub agent: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an agent inside a network-isolated sandbox
    Run {
        #[command(flatten)]
        target: TargetArgs,

        /// Resume the previous conversation for this project
        #[arg(long)]
        resume: bool,

        /// Extra allowlisted egress domains for this session
        #[arg(long = "allow", value_name = "DOMAIN")]
        allow: Vec<String>,
    },

    /// Rebuild the sandbox images, ignoring caches
    Rebuild {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Manage stored sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommands,
    },

    /// Manage encrypted secret vaults
    Vault {
        #[command(subcommand)]
        command: VaultCommands,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum SessionsCommands {
    /// List named sessions for the active workspace/agent/project
    List {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Remove a session by name, id, or unique id prefix
    Rm {
        #[command(flatten)]
        target: TargetArgs,

        /// Session name, id, or unique id prefix
        selector: String,
    },
}

#[derive(Subcommand)]
pub enum VaultCommands {
    /// Initialize a new vault for a workspace
    Init {
        #[arg(short = 'w', long)]
        workspace: Option<String>,
    },

    /// Set a secret (value prompted securely)
    Set {
        #[arg(short = 'w', long)]
        workspace: Option<String>,
        key: String,
    },

    /// Print a secret
    Get {
        #[arg(short = 'w', long)]
        workspace: Option<String>,
        key: String,
    },

    /// List secret keys
    #[command(alias = "ls")]
    List {
        #[arg(short = 'w', long)]
        workspace: Option<String>,
    },

    /// Delete a secret
    #[command(alias = "rm")]
    Delete {
        #[arg(short = 'w', long)]
        workspace: Option<String>,
        key: String,
    },

    /// Import secrets from a .env file
    Import {
        #[arg(short = 'w', long)]
        workspace: Option<String>,
        /// Path to the .env file
        file: PathBuf,
    },

    /// Edit all secrets in $EDITOR
    Edit {
        #[arg(short = 'w', long)]
        workspace: Option<String>,
    },

    /// Show vault status for a workspace
    Status {
        #[arg(short = 'w', long)]
        workspace: Option<String>,
    },

    /// Permanently delete a workspace's vault
    Destroy {
        #[arg(short = 'w', long)]
        workspace: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            target,
            resume,
            allow,
        } => command::run::execute(target, resume, allow),
        Commands::Rebuild { target } => command::rebuild::execute(target),
        Commands::Sessions { command: cmd } => command::sessions::execute(cmd),
        Commands::Vault { command: cmd } => command::vault::execute(cmd),
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    }
}
