//! nethub CLI entry point

use std::io::Write;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use nethub::cli::{CertArgs, ClientArgs, Cli, Commands, ServeArgs};
use nethub::client::{ClientError, CommandClient};
use nethub::protocol::{CommandResponse, Status};
use nethub::tls::ensure_certificate;
use nethub::{Config, NethubError, ServiceHost};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => match run_serve(&args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                e.exit_code()
            }
        },
        Commands::Cert(args) => match run_cert(&args) {
            Ok(output) => {
                print!("{}", output);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                e.exit_code()
            }
        },
        Commands::Client(args) => match run_client(&args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}

fn init_tracing(level: &str) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("nethub={}", level)))
        .unwrap_or_else(|_| EnvFilter::new("nethub=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn runtime() -> nethub::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| NethubError::ConfigError {
        message: format!("Failed to create tokio runtime: {}", e),
    })
}

fn run_serve(args: &ServeArgs) -> nethub::Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;
    init_tracing(&config.logging.level);

    tracing::info!("Starting nethub v{}", env!("CARGO_PKG_VERSION"));
    runtime()?.block_on(serve(config))
}

async fn serve(config: Config) -> nethub::Result<()> {
    let host = ServiceHost::new(config)?;
    let running = host.start().await;

    if running.listening() == 0 {
        tracing::error!("No listener could be started");
        return running.shutdown().await;
    }

    running
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Cannot listen for Ctrl-C: {}", e);
            }
        })
        .await
}

fn run_cert(args: &CertArgs) -> nethub::Result<String> {
    init_tracing("info");
    let paths = ensure_certificate(&args.cert_dir)?;
    Ok(format!(
        "certificate: {}\nprivate key: {}\n",
        paths.cert.display(),
        paths.key.display()
    ))
}

fn run_client(args: &ClientArgs) -> anyhow::Result<()> {
    init_tracing("warn");
    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(interactive(args))
}

async fn interactive(args: &ClientArgs) -> anyhow::Result<()> {
    let addr = format!("{}:{}", args.host, args.port());
    let mut client = if args.tls {
        CommandClient::connect_tls(addr.as_str(), &args.server_name, &args.ca)
            .await
            .with_context(|| format!("Cannot connect to {} over TLS", addr))?
    } else {
        CommandClient::connect_plain(addr.as_str())
            .await
            .with_context(|| format!("Cannot connect to {}", addr))?
    };

    if let Some(tls) = client.tls_info() {
        println!("Connected to {} ({}, {})", addr, tls.protocol_version, tls.cipher);
    } else {
        println!("Connected to {}", addr);
    }
    print_response(client.welcome())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            // stdin closed, leave without a close command
            client.close().await?;
            return Ok(());
        };
        let command = line.trim();
        if command.is_empty() {
            continue;
        }

        match client.send(command).await {
            Ok(response) => {
                print_response(&response)?;
                if response.status == Status::Close {
                    return Ok(());
                }
            }
            Err(ClientError::Closed) => {
                println!("Server closed the connection");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn print_response(response: &CommandResponse) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}
