//! replifs binary entry point.

use replifs::cli::{Cli, Commands, FsCommands};
use replifs::client::FsClient;
use replifs::config::ServerConfig;
use replifs::observability;
use std::io::Read;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Server {
            base_path,
            raft_path,
            group_id,
            peer_addr,
            initial_conf,
            election_timeout_ms,
            snapshot_interval_s,
            rpc_addr,
            rpc_port,
            log_level,
            metrics_addr,
        } => {
            let mut config = match cli.config {
                Some(path) => match ServerConfig::from_file(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        eprintln!("replifs: {}", e);
                        return ExitCode::FAILURE;
                    }
                },
                None => ServerConfig::default(),
            };

            // Command-line flags override the file.
            if let Some(v) = base_path {
                config.base_path = v;
            }
            if let Some(v) = raft_path {
                config.raft_path = v;
            }
            if let Some(v) = group_id {
                config.group_id = v;
            }
            if let Some(v) = peer_addr {
                config.peer_addr = v;
            }
            if let Some(v) = initial_conf {
                config.initial_conf = v;
            }
            if let Some(v) = election_timeout_ms {
                config.election_timeout_ms = v;
            }
            if let Some(v) = snapshot_interval_s {
                config.snapshot_interval_s = v;
            }
            if let Some(v) = rpc_addr {
                config.rpc_addr = v;
            }
            if let Some(v) = rpc_port {
                config.rpc_port = v;
            }
            if let Some(v) = log_level {
                config.log_level = v;
            }
            if let Some(v) = metrics_addr {
                config.metrics_addr = Some(v);
            }

            if let Err(e) = config.validate() {
                eprintln!("replifs: {}", e);
                return ExitCode::FAILURE;
            }
            if let Err(e) = observability::init(&config.log_level, config.json_logs) {
                eprintln!("replifs: {}", e);
                return ExitCode::FAILURE;
            }

            match replifs::run(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("replifs: {}", e);
                    ExitCode::FAILURE
                }
            }
        }

        Commands::Fs { addr, command } => match run_fs_command(&addr, command).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("replifs: {}", e);
                ExitCode::FAILURE
            }
        },

        Commands::Version => {
            println!("replifs {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}

async fn run_fs_command(addr: &str, command: FsCommands) -> anyhow::Result<()> {
    let mut client = FsClient::connect(addr).await?;

    match command {
        FsCommands::Touch { path } => client.create_file(&path).await?,
        FsCommands::Write { path, data } => {
            client.write_file(&path, payload_or_stdin(data)?).await?
        }
        FsCommands::Append { path, data } => {
            client.append_file(&path, payload_or_stdin(data)?).await?
        }
        FsCommands::Rm { path } => client.delete_file(&path).await?,
        FsCommands::Mkdir { path } => client.create_directory(&path).await?,
        FsCommands::Rmdir { path } => client.delete_directory(&path).await?,
        FsCommands::Rename { path, new_path } => client.rename(&path, &new_path).await?,
        FsCommands::Cat { path } => {
            let data = client.read_file(&path).await?;
            use std::io::Write;
            std::io::stdout().write_all(&data)?;
        }
        FsCommands::Ls { path } => {
            for entry in client.list_directory(&path).await? {
                let kind = if entry.is_directory { "d" } else { "-" };
                println!("{} {:>12} {}", kind, entry.size_bytes, entry.name);
            }
        }
        FsCommands::Stat { path } => {
            let info = client.stat(&path).await?;
            println!(
                "name: {}\nsize: {} bytes\ndirectory: {}\nmodified: {}",
                info.name, info.size_bytes, info.is_directory, info.last_modified
            );
        }
        FsCommands::Exists { path } => {
            println!("{}", client.exists(&path).await?);
        }
    }
    Ok(())
}

fn payload_or_stdin(data: Option<String>) -> anyhow::Result<Vec<u8>> {
    match data {
        Some(text) => Ok(text.into_bytes()),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}
