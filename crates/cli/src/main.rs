mod commands;
mod shutdown;

use clap::{Parser, Subcommand};
#[cfg(target_os = "linux")]
use commands::{device, direct};
use commands::{stack, version};

#[derive(Parser)]
#[command(name = "tunrelay")]
#[command(about = "Relay TUN/TAP frames over a Unix socket to a userspace network stack")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bridge a TUN/TAP device to a relay socket (device side of the split)
    #[cfg(target_os = "linux")]
    Device(device::DeviceArgs),

    /// Serve the userspace stack on a relay socket (stack side of the split)
    Stack(stack::StackArgs),

    /// Attach a TUN/TAP device straight to the userspace stack
    #[cfg(target_os = "linux")]
    Direct(direct::DirectArgs),

    /// Show version information
    Version(version::VersionArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        #[cfg(target_os = "linux")]
        Commands::Device(args) => device::run(args).await,
        Commands::Stack(args) => stack::run(args).await,
        #[cfg(target_os = "linux")]
        Commands::Direct(args) => direct::run(args).await,
        Commands::Version(args) => {
            version::run(args);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_stack_subcommand() {
        let cli = Cli::try_parse_from([
            "tunrelay",
            "stack",
            "--addr",
            "192.168.1.1",
            "--port",
            "8080",
            "--socket",
            "/tmp/test.sock",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Stack(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parses_device_subcommand() {
        let cli = Cli::try_parse_from(["tunrelay", "device", "--dev", "tap0", "--tap"]).unwrap();
        assert!(matches!(cli.command, Commands::Device(_)));
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn device_subcommands_need_linux() {
        assert!(Cli::try_parse_from(["tunrelay", "device", "--dev", "tap0"]).is_err());
        assert!(Cli::try_parse_from(["tunrelay", "direct", "--dev", "tun0"]).is_err());
    }

    #[test]
    fn rejects_bad_mac() {
        let result = Cli::try_parse_from(["tunrelay", "stack", "--mac", "not-a-mac"]);
        assert!(result.is_err());
    }
}
