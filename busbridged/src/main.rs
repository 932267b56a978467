use anyhow::Result;
use busbridge::Proxy;
use busbridge_core::{BusType, ProxyConfig};
use clap::Parser;

/// Cross-bus D-Bus proxy: republishes a service from one bus instance on
/// another, forwarding calls, signals and callback agents in both directions.
#[derive(Parser, Debug)]
#[command(name = "busbridged", version)]
struct Cli {
    /// D-Bus name of the source service
    #[arg(long, value_name = "NAME")]
    source_bus_name: String,

    /// Object path of the source to mirror
    #[arg(long, value_name = "PATH")]
    source_object_path: String,

    /// D-Bus name the proxy owns on the target bus
    #[arg(long, value_name = "NAME")]
    proxy_bus_name: String,

    /// Bus type of the source (system|session)
    #[arg(long, value_name = "TYPE", default_value = "system")]
    source_bus_type: String,

    /// Bus type of the proxy (system|session)
    #[arg(long, value_name = "TYPE", default_value = "session")]
    target_bus_type: String,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,

    /// Show additional info
    #[arg(long)]
    info: bool,

    /// Crash on library warnings (debugging aid)
    #[arg(long)]
    fatal_warnings: bool,
}

fn proxy_config(cli: &Cli) -> ProxyConfig {
    ProxyConfig {
        source_bus_name: cli.source_bus_name.clone(),
        source_object_path: cli.source_object_path.clone(),
        target_bus_name: cli.proxy_bus_name.clone(),
        source_bus_type: BusType::parse(&cli.source_bus_type),
        target_bus_type: BusType::parse(&cli.target_bus_type),
    }
}

fn init_tracing(cli: &Cli) {
    let default_filter = if cli.verbose {
        "debug"
    } else if cli.info {
        "info"
    } else {
        "warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    if cli.fatal_warnings {
        unsafe { std::env::set_var("DBUS_FATAL_WARNINGS", "1") };
    }

    let config = proxy_config(&cli);
    tracing::info!("starting cross-bus D-Bus proxy");
    tracing::info!(
        "source: {}{} on {} bus",
        config.source_bus_name,
        config.source_object_path,
        config.source_bus_type
    );
    tracing::info!(
        "target: {} on {} bus",
        config.target_bus_name,
        config.target_bus_type
    );

    let proxy = Proxy::connect(config).await?;
    proxy.probe_source().await?;
    proxy.acquire_name().await?;
    proxy.setup().await?;

    let reason = proxy.run().await?;
    tracing::info!(%reason, "exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_types_map_through_cli() {
        let cli = Cli::parse_from([
            "busbridged",
            "--source-bus-name",
            "org.example.Svc",
            "--source-object-path",
            "/org/example",
            "--proxy-bus-name",
            "org.example.Proxy",
            "--source-bus-type",
            "session",
        ]);
        let config = proxy_config(&cli);
        assert_eq!(config.source_bus_type, BusType::Session);
        // default target type
        assert_eq!(config.target_bus_type, BusType::Session);
        assert_eq!(config.target_bus_name, "org.example.Proxy");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_bus_type_falls_back_to_system() {
        let cli = Cli::parse_from([
            "busbridged",
            "--source-bus-name",
            "org.example.Svc",
            "--source-object-path",
            "/org/example",
            "--proxy-bus-name",
            "org.example.Proxy",
            "--target-bus-type",
            "starter",
        ]);
        let config = proxy_config(&cli);
        assert_eq!(config.target_bus_type, BusType::System);
    }

    #[test]
    fn required_flags_are_enforced() {
        let result = Cli::try_parse_from(["busbridged", "--source-bus-name", "org.example.Svc"]);
        assert!(result.is_err());
    }
}
