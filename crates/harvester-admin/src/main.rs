use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use futures::{SinkExt, StreamExt};
use harvester_protocol::{AdminCommand, AdminResponse, StatusReport};
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Keys sent per upload request
const UPLOAD_CHUNK: usize = 16;

const PHONE_PATTERN: &str = r"^\+?[1-9][0-9]{7,14}$";

#[derive(Parser, Debug)]
#[command(name = "hv-admin")]
#[command(about = "Harvester worker admin CLI", long_about = None)]
struct Args {
    /// Admin port (read from the port file when omitted)
    #[arg(short, long)]
    port: Option<u16>,

    /// File the worker writes its admin port to
    #[arg(long, default_value = "comm/port")]
    port_file: PathBuf,

    /// Output format (table, json, yaml)
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show job counts
    Status,

    /// Queue numbers from a file, one per line
    Upload {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Export all stored results into a zip archive, AES-encrypted when a password is given
    Download {
        /// Archive path, resolved by the worker
        #[arg(short, long)]
        archive: String,

        #[arg(long)]
        password: Option<String>,
    },
}

struct AdminClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl AdminClient {
    async fn connect(port: u16) -> anyhow::Result<Self> {
        let socket = TcpStream::connect(("127.0.0.1", port))
            .await
            .with_context(|| format!("worker admin channel not reachable on port {}", port))?;

        Ok(AdminClient {
            framed: Framed::new(socket, LengthDelimitedCodec::new()),
        })
    }

    async fn send(&mut self, command: &AdminCommand) -> anyhow::Result<AdminResponse> {
        self.framed.send(Bytes::from(command.to_bytes()?)).await?;

        match self.framed.next().await {
            Some(frame) => Ok(AdminResponse::from_bytes(&frame?)?),
            None => bail!("worker closed the admin connection"),
        }
    }
}

fn resolve_port(args: &Args) -> anyhow::Result<u16> {
    if let Some(port) = args.port {
        return Ok(port);
    }

    let contents = std::fs::read_to_string(&args.port_file)
        .with_context(|| format!("cannot read port file {}", args.port_file.display()))?;
    contents
        .trim()
        .parse()
        .with_context(|| format!("invalid port in {}", args.port_file.display()))
}

/// Split file contents into valid numbers and rejected lines
fn parse_keys(contents: &str) -> anyhow::Result<(Vec<String>, Vec<String>)> {
    let pattern = Regex::new(PHONE_PATTERN)?;
    let mut keys = Vec::new();
    let mut rejected = Vec::new();

    for line in contents.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if pattern.is_match(line) {
            keys.push(line.to_string());
        } else {
            rejected.push(line.to_string());
        }
    }

    Ok((keys, rejected))
}

fn read_keys(path: &Path) -> anyhow::Result<(Vec<String>, Vec<String>)> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    parse_keys(&contents)
}

fn print_status(report: &StatusReport, format: &str) -> anyhow::Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(report)?),
        "yaml" => println!("{}", serde_yaml::to_string(report)?),
        _ => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Partition", "Jobs"]);
            table.add_row(vec!["Total", &report.total.to_string()]);
            table.add_row(vec!["Local", &report.local.to_string()]);
            table.add_row(vec!["Remote", &report.remote.to_string()]);
            table.add_row(vec!["Created", &report.created.to_string()]);
            table.add_row(vec!["In work", &report.in_work.to_string()]);
            table.add_row(vec!["Completed", &report.completed.to_string()]);
            table.add_row(vec!["Second check", &report.second_check.to_string()]);
            table.add_row(vec!["Error", &report.error.to_string()]);
            println!("{table}");
        }
    }
    Ok(())
}

fn expect_done(response: AdminResponse) -> anyhow::Result<u64> {
    match response {
        AdminResponse::Done { affected, .. } => Ok(affected),
        AdminResponse::Failed { command, message } => bail!("{} failed: {}", command, message),
        AdminResponse::Status(_) => bail!("unexpected status response"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let port = resolve_port(&args)?;

    match &args.command {
        Commands::Status => {
            let mut client = AdminClient::connect(port).await?;
            match client.send(&AdminCommand::Status).await? {
                AdminResponse::Status(report) => print_status(&report, &args.format)?,
                other => {
                    expect_done(other)?;
                }
            }
        }

        Commands::Upload { file } => {
            let (keys, rejected) = read_keys(file)?;
            for line in &rejected {
                eprintln!("Skipping invalid number: {}", line);
            }

            let mut client = AdminClient::connect(port).await?;
            let mut inserted = 0;
            for chunk in keys.chunks(UPLOAD_CHUNK) {
                let command = AdminCommand::Upload {
                    keys: chunk.to_vec(),
                };
                inserted += expect_done(client.send(&command).await?)?;
            }

            match args.format.as_str() {
                "json" => println!(
                    "{}",
                    serde_json::json!({
                        "read": keys.len(),
                        "inserted": inserted,
                        "rejected": rejected.len(),
                    })
                ),
                _ => println!(
                    "Queued {} of {} numbers ({} rejected)",
                    inserted,
                    keys.len(),
                    rejected.len()
                ),
            }
        }

        Commands::Download { archive, password } => {
            let mut client = AdminClient::connect(port).await?;
            let command = AdminCommand::Download {
                filename: archive.clone(),
                password: password.clone(),
            };
            let files = expect_done(client.send(&command).await?)?;

            match args.format.as_str() {
                "json" => println!(
                    "{}",
                    serde_json::json!({ "archive": archive, "files": files })
                ),
                _ => println!("Wrote {} files to {}", files, archive),
            }
        }
    }

    Ok(())
}
