//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "sensorbus")]
#[command(author, version, about = "Read Bluetooth LE sensors through one shared session", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Connect every configured device and print readings
    Read(ReadArgs),

    /// Validate a session configuration file
    CheckConfig {
        /// Path to the TOML configuration
        file: PathBuf,
    },
}

/// Arguments of the `read` command
#[derive(Debug, Clone, Args)]
pub struct ReadArgs {
    /// Path to the TOML configuration
    #[arg(short, long)]
    pub config: PathBuf,

    /// Readings per device (0 reads until interrupted)
    #[arg(short = 'n', long, default_value = "1")]
    pub count: u32,

    /// Seconds to wait between two reads of a poll device
    #[arg(long, default_value = "1")]
    pub pause: u64,

    /// Print one JSON object per reading
    #[arg(long)]
    pub json: bool,
}

impl ReadArgs {
    /// Whether another read should follow `done` completed ones.
    pub fn wants_more(&self, done: u32) -> bool {
        self.count == 0 || done < self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_read() {
        let cli = Cli::try_parse_from([
            "sensorbus", "-v", "read", "--config", "session.toml", "-n", "3", "--json",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Read(args) = cli.command else {
            panic!("expected read");
        };
        assert_eq!(args.config, PathBuf::from("session.toml"));
        assert_eq!(args.count, 3);
        assert_eq!(args.pause, 1);
        assert!(args.json);
    }

    #[test]
    fn test_parse_check_config() {
        let cli = Cli::try_parse_from(["sensorbus", "check-config", "session.toml", "-q"]).unwrap();
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::CheckConfig { file } if file == PathBuf::from("session.toml")));
    }

    #[test]
    fn test_read_requires_config() {
        assert!(Cli::try_parse_from(["sensorbus", "read"]).is_err());
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["sensorbus", "-v", "-q", "check-config", "a.toml"]).is_err());
    }

    #[test]
    fn test_wants_more() {
        let mut args = Cli::try_parse_from(["sensorbus", "read", "-c", "a.toml"]).map(|cli| match cli.command {
            Commands::Read(args) => args,
            Commands::CheckConfig { .. } => unreachable!(),
        })
        .unwrap();
        assert!(args.wants_more(0));
        assert!(!args.wants_more(1));

        args.count = 0;
        assert!(args.wants_more(1_000));
    }
}
