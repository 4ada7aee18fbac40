use anyhow::Result;
use tracing::info;

use splice_relay::{cli, server::ForwardServer};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args()?;
    let server = ForwardServer::from_config_file(&args.config_file).await?;
    if args.config_test {
        info!(
            "config OK: {} ({} forwards)",
            args.config_file,
            server.config().forwards.len()
        );
        return Ok(());
    }
    server.run().await
}
