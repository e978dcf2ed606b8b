use pimsyncd::daemon::{DaemonConfig, DaemonRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Resync,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--resync" => mode = CliMode::Resync,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: pimsyncd [--resync]");
        println!("  --resync   Purge the dedup store and push everything again");
        return Ok(());
    }
    let mut config = DaemonConfig::from_env()?;
    if mode == CliMode::Resync {
        config.force_resync = true;
    }
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
