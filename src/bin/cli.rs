//! seqmux CLI Client
//!
//! Command-line interface for issuing calls and managing operation tables.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use seqmux::{CallResult, Config, Connection, MuxError, Operation, OperationTable, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// seqmux CLI
#[derive(Parser, Debug)]
#[command(name = "seqmux-cli")]
#[command(about = "CLI for the seqmux multiplexed request protocol")]
struct Args {
    /// Server address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:7400")]
    server: String,

    /// Call timeout in milliseconds
    #[arg(short, long, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a raw call
    Call {
        /// Command number
        #[arg(short, long)]
        command: u32,

        /// Operation type
        #[arg(short, long, default_value = "0")]
        operation_type: u32,

        /// Request body as a UTF-8 string
        #[arg(short, long, default_value = "")]
        body: String,
    },

    /// Call a method by name through an operation table
    Invoke {
        /// Operation table file
        #[arg(long)]
        table: PathBuf,

        service: String,

        method: String,

        /// Request body as a UTF-8 string
        #[arg(short, long, default_value = "")]
        body: String,
    },

    /// Add or replace an entry in an operation table
    TableAdd {
        /// Operation table file (created if missing)
        #[arg(long)]
        table: PathBuf,

        service: String,

        method: String,

        command: u32,

        operation_type: u32,
    },

    /// Print an operation table
    TableList {
        /// Operation table file
        #[arg(long)]
        table: PathBuf,
    },
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::builder().call_timeout_ms(args.timeout_ms).build();
    let timeout = Duration::from_millis(args.timeout_ms);

    match args.command {
        Commands::Call {
            command,
            operation_type,
            body,
        } => {
            let conn = connect(&args.server, config)?;
            let result = conn.call(command, operation_type, body.as_bytes(), timeout)?;
            print_result(&result);
        }
        Commands::Invoke {
            table,
            service,
            method,
            body,
        } => {
            let table = OperationTable::load(&table)?;
            let conn = connect(&args.server, config)?;
            let result = conn.invoke(&table, &service, &method, body.as_bytes())?;
            print_result(&result);
        }
        Commands::TableAdd {
            table: path,
            service,
            method,
            command,
            operation_type,
        } => {
            let mut table = if path.exists() {
                OperationTable::load(&path)?
            } else {
                OperationTable::new()
            };
            table.insert(
                service,
                method,
                Operation {
                    command,
                    operation_type,
                },
            );
            table.save(&path)?;
            println!("{} entries", table.len());
        }
        Commands::TableList { table } => {
            let table = OperationTable::load(&table)?;
            for (service, method, op) in table.iter() {
                println!(
                    "{}.{}\tcommand={}\toperation_type={}",
                    service, method, op.command, op.operation_type
                );
            }
        }
    }

    Ok(())
}

fn connect(server: &str, config: Config) -> Result<Connection> {
    let (host, port) = server
        .rsplit_once(':')
        .ok_or_else(|| MuxError::Config(format!("server address '{}' has no port", server)))?;
    let port: u16 = port
        .parse()
        .map_err(|e| MuxError::Config(format!("invalid port '{}': {}", port, e)))?;
    // Bracketed IPv6 literal
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Connection::connect_with(host, port, config)
}

fn print_result(result: &CallResult) {
    println!(
        "sequence={} status={} success={}",
        result.sequence, result.status_code, result.success
    );
    if !result.status_description.is_empty() {
        println!("description: {}", result.status_description);
    }
    println!("body ({} bytes): {}", result.body.len(), String::from_utf8_lossy(&result.body));
}
