//! snipbox CLI - talk to the daemon, or run a snippet directly

use clap::{Parser, Subcommand};
use snipbox_core::protocol::{self, Request, Response};
use snipbox_core::{ExecutionResult, SandboxConfig, Snipbox, UserId};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "snipbox")]
#[command(author, version, about = "Run untrusted Python snippets in per-user sandboxes")]
struct Cli {
    /// Socket path (defaults to SNIPBOX_SOCKET env var or /run/snipbox/snipbox.sock)
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    /// Print responses as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute Python code via the daemon
    Exec {
        /// Code to execute (or - for stdin)
        code: String,

        #[arg(short, long, env = "SNIPBOX_USER")]
        user: String,
    },

    /// Replace the user's sandbox with an empty one
    Reset {
        #[arg(short, long, env = "SNIPBOX_USER")]
        user: String,
    },

    /// End the user's session and remove the sandbox
    Logout {
        #[arg(short, long, env = "SNIPBOX_USER")]
        user: String,
    },

    /// Download a published artifact
    Fetch {
        /// Artifact name, `<user>_<uuid>.html`
        artifact: String,

        #[arg(short, long, env = "SNIPBOX_USER")]
        user: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Show the user's sandbox status
    Status {
        #[arg(short, long, env = "SNIPBOX_USER")]
        user: String,
    },

    /// Ping the daemon
    Ping,

    /// Run code directly (without daemon)
    Run {
        /// Code to execute (or - for stdin)
        code: String,

        #[arg(short, long, default_value = "local")]
        user: String,

        /// Timeout in seconds
        #[arg(short, long, default_value = "5")]
        timeout: u64,

        /// Memory limit in MB
        #[arg(short, long, default_value = "50")]
        memory: u64,

        /// Python interpreter
        #[arg(long, default_value = "/usr/bin/python3")]
        python: PathBuf,

        /// Where to keep sandboxes and artifacts
        #[arg(long, default_value = "/tmp/snipbox")]
        state_dir: PathBuf,
    },
}

/// Blocking request/response client for the daemon socket
struct Client {
    stream: UnixStream,
}

impl Client {
    fn connect(path: &Path) -> CliResult<Self> {
        let stream = UnixStream::connect(path)
            .map_err(|e| format!("cannot connect to {}: {e}", path.display()))?;
        Ok(Self { stream })
    }

    fn call(&mut self, request: &Request) -> CliResult<Response> {
        protocol::write_frame(&mut self.stream, request)?;
        let response = protocol::read_frame(&mut self.stream)?
            .ok_or("daemon closed the connection")?;
        Ok(response)
    }
}

fn main() -> ExitCode {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "snipbox=warn".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> CliResult<ExitCode> {
    let socket = cli
        .socket
        .clone()
        .unwrap_or_else(snipbox_core::config::default_socket_path);

    let request = match cli.command {
        Commands::Run {
            code,
            user,
            timeout,
            memory,
            python,
            state_dir,
        } => {
            let config = SandboxConfig::builder()
                .python_path(python)
                .sandbox_root(state_dir.join("sandboxes"))
                .artifact_dir(state_dir.join("html_outputs"))
                .timeout_secs(timeout)
                .memory_limit_mb(memory)
                .build();
            let snipbox = Snipbox::new(&config)?;
            let result = snipbox.execute(&UserId::new(user)?, &read_code(&code)?);
            snipbox.shutdown();
            return print_result(&result, cli.json);
        }
        Commands::Exec { code, user } => Request::Execute {
            user,
            code: read_code(&code)?,
        },
        Commands::Reset { user } => Request::Reset { user },
        Commands::Logout { user } => Request::Logout { user },
        Commands::Status { user } => Request::Status { user },
        Commands::Ping => Request::Ping,
        Commands::Fetch {
            artifact,
            user,
            out,
        } => {
            let request = Request::Fetch { user, artifact };
            return match Client::connect(&socket)?.call(&request)? {
                Response::Artifact { content } => {
                    match out {
                        Some(path) => std::fs::write(path, &content)?,
                        None => std::io::stdout().write_all(&content)?,
                    }
                    Ok(ExitCode::SUCCESS)
                }
                other => print_response(&other, cli.json),
            };
        }
    };

    let response = Client::connect(&socket)?.call(&request)?;
    print_response(&response, cli.json)
}

fn print_response(response: &Response, json: bool) -> CliResult<ExitCode> {
    match response {
        Response::Execute(result) => return print_result(result, json),
        Response::Status(status) if json => println!("{}", serde_json::to_string_pretty(status)?),
        Response::Status(status) if status.sandbox_created => {
            println!("{}: sandbox active for {}s", status.user, status.sandbox_age_secs);
        }
        Response::Status(status) => println!("{}: no sandbox", status.user),
        Response::Reset => println!("sandbox reset"),
        Response::Logout => println!("logged out"),
        Response::Pong => println!("pong"),
        Response::Artifact { content } => std::io::stdout().write_all(content)?,
        Response::Forbidden => {
            eprintln!("access denied");
            return Ok(ExitCode::FAILURE);
        }
        Response::NotFound => {
            eprintln!("artifact not found");
            return Ok(ExitCode::FAILURE);
        }
        Response::Error { message } => {
            eprintln!("daemon error: {message}");
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_result(result: &ExecutionResult, json: bool) -> CliResult<ExitCode> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print!("{}", result.output);
        if !result.output.ends_with('\n') {
            println!();
        }
        if let Some(artifact) = &result.artifact {
            eprintln!("artifact: {} ({})", artifact.id, artifact.url);
        }
    }

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn read_code(arg: &str) -> CliResult<String> {
    if arg != "-" {
        return Ok(arg.to_owned());
    }
    let mut code = String::new();
    std::io::stdin().read_to_string(&mut code)?;
    Ok(code)
}
