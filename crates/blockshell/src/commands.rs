use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use clap::ValueHint;
pub use clap_complete::Shell;
use std::path::PathBuf;

const AFTER_LONG_HELP: &str = r#"CONCEPTS:
    Session  - a named shell context with its own working directory and shell
    Block    - one command run inside a session, with its captured output

EXAMPLES:
    # Start the daemon in the foreground
    blockshell daemon

    # Run a command as a block and stream its output
    blockshell exec "ls -la"
    blockshell exec --session work --cwd ~/src "make test"

    # Inspect history
    blockshell sessions
    blockshell blocks --session work --json

    # Talk JSON-RPC directly
    blockshell call ping
    blockshell call session.set_config '{"session_id":"work","shell":"/bin/zsh"}'"#;

#[derive(Parser)]
#[command(name = "blockshell")]
#[command(author, version, propagate_version = true)]
#[command(about = "Block-based shell sessions served over JSON-RPC")]
#[command(after_long_help = AFTER_LONG_HELP)]
#[command(subcommand_required = true, arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Daemon socket path
    #[arg(
        long,
        global = true,
        env = "BLOCKSHELL_SOCKET",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub socket: Option<PathBuf>,

    #[arg(
        short,
        long,
        global = true,
        value_enum,
        value_name = "FORMAT",
        default_value_t = OutputFormat::Text
    )]
    pub format: OutputFormat,

    #[arg(long, global = true)]
    pub json: bool,
}

impl Cli {
    pub fn effective_format(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else {
            self.format
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground
    #[command(long_about = "\
Run the daemon in the foreground.

Listens on the socket given by --socket (or BLOCKSHELL_SOCKET) and keeps
session history under BLOCKSHELL_DATA_DIR. Stops cleanly on SIGINT or SIGTERM,
saving sessions before it exits.")]
    Daemon,

    /// Execute a command as a new block
    #[command(long_about = "\
Execute a command as a new block in a session.

Output is streamed as the daemon produces it. The process exits with the
command's exit code once the block completes.")]
    #[command(after_long_help = "\
EXAMPLES:
    blockshell exec \"echo hello\"
    blockshell exec --session build --cwd /tmp \"make\"
    blockshell exec --plain \"ls --color=always\"")]
    Exec {
        #[arg(value_name = "COMMAND", value_hint = ValueHint::CommandString)]
        command: String,

        #[arg(short, long, value_name = "ID", default_value = "default")]
        session: String,

        #[arg(short = 'd', long, value_name = "DIR", value_hint = ValueHint::DirPath)]
        cwd: Option<String>,

        #[arg(long, default_value_t = 80)]
        cols: u16,

        #[arg(long, default_value_t = 24)]
        rows: u16,

        /// Strip ANSI escape sequences from the output
        #[arg(long)]
        plain: bool,
    },

    /// List sessions
    #[command(visible_alias = "ls")]
    Sessions,

    /// List the blocks of a session
    Blocks {
        #[arg(short, long, value_name = "ID", default_value = "default")]
        session: String,
    },

    /// Send a raw JSON-RPC request and print the result
    #[command(after_long_help = "\
EXAMPLES:
    blockshell call ping
    blockshell call block.get '{\"block_id\":\"...\"}'")]
    Call {
        #[arg(value_name = "METHOD")]
        method: String,

        /// Parameters as a JSON object
        #[arg(value_name = "PARAMS")]
        params: Option<String>,
    },

    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum, value_name = "SHELL")]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
