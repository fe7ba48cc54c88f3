//! `ica-mcp-proxy` CLI entry point.

use clap::Parser;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = ica_mcp_proxy::cli::Cli::parse();

    if let Err(e) = cli.execute().await {
        eprintln!("error: {}", e.sanitize());
        std::process::exit(1);
    }
}
