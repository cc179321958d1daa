mod tunnelgate;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "tunnelgate",
    version,
    about = "tunnelgate - reverse tunnel gateway and encrypting TCP relay"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). Falls back to TUNNELGATE_CONFIG, then tunnelgate.toml > tunnelgate.yaml > tunnelgate.yml in the working directory, then the OS default path (Linux: /etc/tunnelgate/tunnelgate.toml; others: user config dir).
    #[arg(long, env = "TUNNELGATE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tunnelgate::run(cli.config).await
}
