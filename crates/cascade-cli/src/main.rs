//! Cascade CLI — run and manage workflow graphs and interactive sessions.
//!
//! Graph commands reuse the core engine directly against a local database;
//! session commands talk to a running `cascade server` over HTTP.

mod commands;

use clap::{Parser, Subcommand};

/// Cascade CLI — Workflow DAG execution and session orchestration
#[derive(Parser)]
#[command(name = "cascade", version, about)]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "CASCADE_DB_PATH", default_value = "cascade.db")]
    db: String,

    /// Base URL of a running Cascade server (session commands)
    #[arg(long, env = "CASCADE_SERVER_URL", default_value = "http://127.0.0.1:3440")]
    server_url: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Cascade HTTP backend server
    Server {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[arg(long, default_value_t = 3440)]
        port: u16,
        /// Directory of skill scripts (`<name>.sh`)
        #[arg(long, default_value = "skills")]
        skills_dir: String,
    },

    /// Validate a graph definition file without executing it
    Validate {
        /// Path to the graph YAML/JSON file
        file: String,
    },

    /// Execute a graph definition file to completion
    Run {
        /// Path to the graph YAML/JSON file
        file: String,
        /// Trigger payload passed to the graph's trigger nodes
        #[arg(long)]
        payload: Option<String>,
        /// Directory of skill scripts (`<name>.sh`)
        #[arg(long, default_value = "skills")]
        skills_dir: String,
    },

    /// Manage interactive sessions on a running server
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List sessions
    List,
    /// Start a session
    Start {
        /// Process command to run
        command: String,
        /// Arguments for the process
        args: Vec<String>,
        /// Execution mode: direct, autonomous_loop, or team_spawn
        #[arg(long, default_value = "direct")]
        mode: String,
        /// Working directory
        #[arg(long)]
        cwd: Option<String>,
        /// Task prompt (autonomous_loop mode)
        #[arg(long)]
        task: Option<String>,
        /// Iteration cap (autonomous_loop mode)
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Show one session, including loop/team state
    Status {
        /// Session ID
        session_id: String,
    },
    /// Send an input line to a session
    Send {
        /// Session ID
        session_id: String,
        /// Input text
        text: String,
    },
    /// Pause a session
    Pause {
        /// Session ID
        session_id: String,
    },
    /// Resume a paused session
    Resume {
        /// Session ID
        session_id: String,
    },
    /// Gracefully stop a session
    Stop {
        /// Session ID
        session_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cascade_core=warn,cascade_server=warn,cascade_cli=info".into()),
        )
        .init();

    let result = if let Some(command) = cli.command {
        match command {
            Commands::Server {
                host,
                port,
                skills_dir,
            } => commands::server::run(host, port, cli.db, skills_dir).await,

            Commands::Validate { file } => commands::graph::validate(&file),

            Commands::Run {
                file,
                payload,
                skills_dir,
            } => commands::graph::run(&cli.db, &file, payload, &skills_dir).await,

            Commands::Session { action } => {
                let client = commands::session::SessionClient::new(&cli.server_url);
                match action {
                    SessionAction::List => client.list().await,
                    SessionAction::Start {
                        command,
                        args,
                        mode,
                        cwd,
                        task,
                        max_iterations,
                    } => {
                        client
                            .start(&command, args, &mode, cwd, task, max_iterations)
                            .await
                    }
                    SessionAction::Status { session_id } => client.status(&session_id).await,
                    SessionAction::Send { session_id, text } => {
                        client.send(&session_id, &text).await
                    }
                    SessionAction::Pause { session_id } => client.pause(&session_id).await,
                    SessionAction::Resume { session_id } => client.resume(&session_id).await,
                    SessionAction::Stop { session_id } => client.stop(&session_id).await,
                }
            }
        }
    } else {
        // No subcommand — show help
        use clap::CommandFactory;
        Cli::command().print_help().ok();
        println!();
        Ok(())
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
