use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use meshkv::cluster::Client;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "meshkv-cli")]
#[command(about = "meshkv client - talk to a node over the binary protocol")]
#[command(version)]
struct Args {
    /// Node address (host:port)
    #[arg(short, long, default_value = "localhost:3000")]
    addr: String,

    /// Shared auth secret, when the node requires one
    #[arg(long, default_value = "")]
    auth: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a value and print it (or write it to a file)
    Get {
        key: String,
        /// Write the value to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Store a value from an argument or a file
    Set {
        key: String,
        /// Literal value; mutually exclusive with --file
        value: Option<String>,
        /// Read the value from this file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Delete a key
    Del { key: String },
    /// Print the node's health snapshot
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = Client::new(args.auth.clone());

    match args.command {
        Command::Get { key, output } => {
            let value = client
                .get(&args.addr, key.as_bytes())
                .await
                .with_context(|| format!("get {}", key))?;
            match output {
                Some(path) => tokio::fs::write(&path, &value)
                    .await
                    .with_context(|| format!("write {}", path.display()))?,
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&value)?;
                }
            }
        }

        Command::Set { key, value, file } => {
            let data = match (value, file) {
                (Some(value), None) => value.into_bytes(),
                (None, Some(path)) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("read {}", path.display()))?,
                _ => bail!("provide either a literal value or --file"),
            };
            client
                .set(&args.addr, key.as_bytes(), &data)
                .await
                .with_context(|| format!("set {}", key))?;
            eprintln!("ok ({} bytes)", data.len());
        }

        Command::Del { key } => {
            client
                .delete(&args.addr, key.as_bytes())
                .await
                .with_context(|| format!("delete {}", key))?;
            eprintln!("ok");
        }

        Command::Health => {
            let payload = client.health(&args.addr).await.context("health")?;
            let json: serde_json::Value = serde_json::from_slice(&payload)?;
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }

    Ok(())
}
