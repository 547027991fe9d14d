//! WolfKvCtl - Command line client for WolfKV clusters
//!
//! Speaks the native text protocol against a leader client port or a
//! follower read-only port, following redirects for writes.
//!
//! Exit codes: 0 on a success reply, 1 on error or no reply.

use clap::{Parser, Subcommand};

use wolfkv::client::{query_cluster_status, ClientReply, DbClient};
use wolfkv::error::Error;

/// WolfKV Cluster Client
#[derive(Parser)]
#[command(name = "wolfkvctl")]
#[command(about = "Query and mutate a WolfKV cluster", long_about = None)]
struct Cli {
    /// Server host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port (leader client port or follower read port)
    #[arg(short, long, default_value_t = 7001)]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read one key
    Get { key: String },

    /// Write one key
    Set { key: String, value: String },

    /// Delete one key
    Del { key: String },

    /// Range scan from (or back from) a key
    Scan {
        key: String,

        /// Maximum number of pairs
        #[arg(short, long, default_value_t = 10)]
        count: usize,

        /// Scan descending instead of ascending
        #[arg(long)]
        backward: bool,
    },

    /// Compact the store
    Optimize,

    /// Query a node's control port for cluster status
    Status {
        /// Control port of the node to ask
        #[arg(long, default_value_t = 8001)]
        control_port: u16,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = run(cli).await;
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> i32 {
    let client = DbClient::new(cli.host.clone(), cli.port);

    let result = match cli.command {
        Commands::Get { key } => client.get(&key).await,
        Commands::Set { key, value } => client.set(&key, &value).await,
        Commands::Del { key } => client.delete(&key).await,
        Commands::Scan {
            key,
            count,
            backward,
        } => client.scan(&key, count, backward).await,
        Commands::Optimize => client.optimize().await,
        Commands::Status { control_port } => {
            return match query_cluster_status(&cli.host, control_port).await {
                Ok(lines) => {
                    for line in lines {
                        println!("{}", line);
                    }
                    0
                }
                Err(e) => {
                    eprintln!("{}", transport_error(&e));
                    1
                }
            };
        }
    };

    match result {
        Ok(reply) => print_reply(reply),
        Err(e) => {
            eprintln!("{}", transport_error(&e));
            1
        }
    }
}

fn print_reply(reply: ClientReply) -> i32 {
    match reply {
        ClientReply::Ok { lsn } => {
            println!("OK {}", lsn);
            0
        }
        ClientReply::Value(value) => {
            println!("VALUE {}", value);
            0
        }
        ClientReply::NotFound => {
            println!("NOT_FOUND");
            0
        }
        ClientReply::Pairs(pairs) => {
            for (key, value) in pairs {
                println!("KEY_VALUE {} {}", key, value);
            }
            println!("END");
            0
        }
        ClientReply::Optimized => {
            println!("OK_OPTIMIZED");
            0
        }
        ClientReply::Error(line) => {
            eprintln!("{}", line);
            1
        }
    }
}

/// Map transport failures onto the conventional error lines
fn transport_error(error: &Error) -> &'static str {
    match error {
        Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_) => "ERR_CONNECT",
        _ => "ERR_NO_REPLY",
    }
}
