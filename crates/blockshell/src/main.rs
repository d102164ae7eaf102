use clap::CommandFactory;
use clap::Parser;
use clap_complete::generate;

use blockshell::commands::Cli;
use blockshell::commands::Commands;
use blockshell::handlers;
use blockshell::handlers::HandlerContext;
use blockshell_daemon::DaemonConfig;
use blockshell_daemon::DaemonError;
use blockshell_daemon::start_daemon;
use blockshell_ipc::ClientError;
use blockshell_ipc::DaemonClient;
use blockshell_ipc::error_codes::ErrorCategory;
use blockshell_ipc::socket_path;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            if let Some(client_error) = e.downcast_ref::<ClientError>() {
                eprintln!("Error: {}", client_error);
                if let Some(suggestion) = client_error.suggestion() {
                    eprintln!("Suggestion: {}", suggestion);
                }
                if client_error.is_retryable() {
                    eprintln!("(This error may be transient - retry may succeed)");
                }
                std::process::exit(exit_code_for_client_error(client_error));
            } else if let Some(daemon_error) = e.downcast_ref::<DaemonError>() {
                eprintln!("Error: {}", daemon_error);
                eprintln!("Suggestion: {}", daemon_error.suggestion());
                std::process::exit(74); // EX_IOERR
            } else {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn exit_code_for_client_error(error: &ClientError) -> i32 {
    match error.category() {
        Some(ErrorCategory::InvalidInput) => 64, // EX_USAGE
        Some(ErrorCategory::NotFound) => 69,     // EX_UNAVAILABLE
        Some(ErrorCategory::External) => 74,     // EX_IOERR
        Some(ErrorCategory::Internal) => 74,     // EX_IOERR
        Some(ErrorCategory::Timeout) => 75,      // EX_TEMPFAIL
        None => 1,
    }
}

fn run() -> Result<i32, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let socket = cli.socket.clone().unwrap_or_else(socket_path);

    if matches!(cli.command, Commands::Daemon) {
        let config = DaemonConfig::from_env().with_socket_path(socket);
        start_daemon(config)?;
        return Ok(0);
    }

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        generate(*shell, &mut cmd, "blockshell", &mut std::io::stdout());
        return Ok(0);
    }

    let _telemetry = blockshell_common::init_tracing("warn");

    let mut client = match DaemonClient::connect_to(&socket) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "Error: Failed to connect to daemon at {}: {}",
                socket.display(),
                e
            );
            eprintln!();
            eprintln!("Troubleshooting:");
            eprintln!("  1. Start the daemon: blockshell daemon");
            eprintln!("  2. Check that --socket or BLOCKSHELL_SOCKET points at it");
            std::process::exit(69); // EX_UNAVAILABLE
        }
    };

    let format = cli.effective_format();
    let mut ctx = HandlerContext::new(&mut client, format);

    match cli.command {
        Commands::Daemon | Commands::Completions { .. } => unreachable!(),

        Commands::Exec {
            command,
            session,
            cwd,
            cols,
            rows,
            plain,
        } => return handlers::handle_exec(&mut ctx, command, session, cwd, cols, rows, plain),

        Commands::Sessions => handlers::handle_sessions(&mut ctx)?,
        Commands::Blocks { session } => handlers::handle_blocks(&mut ctx, session)?,
        Commands::Call { method, params } => handlers::handle_call(&mut ctx, method, params)?,
    }

    Ok(0)
}
