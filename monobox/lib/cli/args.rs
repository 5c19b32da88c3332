use std::path::PathBuf;

use clap::Parser;

use super::styles;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Monobox CLI - warm pools of ephemeral execution sandboxes on Kubernetes
#[derive(Debug, Parser)]
#[command(name = "monobox", author, about, version, styles=styles::styles())]
pub struct MonoboxArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<MonoboxSubcommand>,

    /// Namespace to operate in; overrides config and environment
    #[arg(short = 'n', long, global = true, value_name = "NAMESPACE")]
    pub namespace: Option<String>,
}

/// Available subcommands for managing sandboxes and pools
#[derive(Debug, Parser)]
pub enum MonoboxSubcommand {
    /// Run the controller reconcile loops in the foreground
    #[command(name = "run")]
    Run {
        /// Seconds between reconcile sweeps
        #[arg(long, value_name = "SECS")]
        sync_interval: Option<u64>,
    },

    /// Create a sandbox
    #[command(name = "create")]
    Create {
        /// Sandbox name; generated when omitted
        #[arg(value_name = "NAME")]
        name: Option<String>,

        /// Container image to run
        #[arg(short, long)]
        image: Option<String>,

        /// Minutes until the sandbox is terminated
        #[arg(long, value_name = "MINUTES")]
        ttl: Option<u32>,

        /// Persistent volume claim to mount at the shared path
        #[arg(long, value_name = "CLAIM")]
        volume: Option<String>,

        /// Template to resolve at creation time
        #[arg(short, long, value_name = "TEMPLATE")]
        template: Option<String>,

        /// Block until the sandbox is running
        #[arg(short, long)]
        wait: bool,
    },

    /// Show one sandbox
    #[command(name = "get")]
    Get {
        /// Sandbox name
        #[arg(required = true, value_name = "NAME")]
        name: String,
    },

    /// List sandboxes in the namespace
    #[command(name = "list")]
    List,

    /// Delete a sandbox
    #[command(name = "delete")]
    Delete {
        /// Sandbox name
        #[arg(required = true, value_name = "NAME")]
        name: String,
    },

    /// Claim a warm sandbox from a pool
    #[command(name = "claim")]
    Claim {
        /// Pool to claim from
        #[arg(required = true, value_name = "POOL")]
        pool: String,

        /// Persistent volume claim to attach at claim time
        #[arg(long, value_name = "CLAIM")]
        volume: Option<String>,
    },

    /// Execute a command inside a running sandbox
    #[command(name = "exec")]
    Exec {
        /// Sandbox name
        #[arg(required = true, value_name = "NAME")]
        name: String,

        /// Command to run through the container's shell
        #[arg(required = true, value_name = "COMMAND")]
        command: String,

        /// Working directory inside the sandbox
        #[arg(short, long, value_name = "DIR")]
        workdir: Option<String>,
    },

    /// Upload a local file into a running sandbox
    #[command(name = "upload")]
    Upload {
        /// Sandbox name
        #[arg(required = true, value_name = "NAME")]
        name: String,

        /// Local file to read
        #[arg(required = true, value_name = "SRC")]
        source: PathBuf,

        /// Destination path inside the sandbox; defaults to the source
        /// file name under the workspace
        #[arg(value_name = "DEST")]
        dest: Option<String>,
    },

    /// Download a file from a running sandbox
    #[command(name = "download")]
    Download {
        /// Sandbox name
        #[arg(required = true, value_name = "NAME")]
        name: String,

        /// Path inside the sandbox
        #[arg(required = true, value_name = "SRC")]
        source: String,

        /// Local file to write; prints to stdout when omitted
        #[arg(value_name = "DEST")]
        dest: Option<PathBuf>,
    },

    /// Fetch container logs from a sandbox's backing pod
    #[command(name = "logs")]
    Logs {
        /// Sandbox name
        #[arg(required = true, value_name = "NAME")]
        name: String,

        /// Only return the last N lines
        #[arg(long, value_name = "LINES")]
        tail: Option<i64>,
    },
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args_parse() {
        MonoboxArgs::command().debug_assert();
    }

    #[test]
    fn test_namespace_is_global() {
        let args = MonoboxArgs::parse_from(["monobox", "list", "-n", "workloads"]);
        assert_eq!(args.namespace.as_deref(), Some("workloads"));
        assert!(matches!(args.subcommand, Some(MonoboxSubcommand::List)));
    }

    #[test]
    fn test_exec_takes_command_and_workdir() {
        let args = MonoboxArgs::parse_from([
            "monobox", "exec", "sb-1", "python -V", "--workdir", "/workspace",
        ]);
        match args.subcommand {
            Some(MonoboxSubcommand::Exec {
                name,
                command,
                workdir,
            }) => {
                assert_eq!(name, "sb-1");
                assert_eq!(command, "python -V");
                assert_eq!(workdir.as_deref(), Some("/workspace"));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }
}
