use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command, builder::PossibleValue};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_CONFIG: &str = "config.yaml";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone)]
pub struct AppArgs {
    pub config_file: String,
    pub config_test: bool,
    pub log_level: String,
}

pub fn command() -> Command {
    let levels = [
        PossibleValue::new("error").alias("erro"),
        PossibleValue::new("warn"),
        PossibleValue::new("info"),
        PossibleValue::new("debug"),
        PossibleValue::new("trace"),
    ];
    Command::new("splice-relay")
        .version(crate::VERSION)
        .about("Forwards TCP connections with a splice-first byte relay")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("YAML file listing the forwards to serve")
                .default_value(DEFAULT_CONFIG)
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("log")
                .short('l')
                .long("log")
                .value_name("LEVEL")
                .help("Default log level, RUST_LOG overrides it")
                .value_parser(levels)
                .default_value(DEFAULT_LOG_LEVEL)
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test")
                .short('t')
                .long("test")
                .help("Validate the config file and exit")
                .action(ArgAction::SetTrue),
        )
}

pub fn args_from_matches(matches: &ArgMatches) -> AppArgs {
    let string_arg = |id: &str, fallback: &str| {
        matches
            .get_one::<String>(id)
            .cloned()
            .unwrap_or_else(|| fallback.to_owned())
    };
    AppArgs {
        config_file: string_arg("config", DEFAULT_CONFIG),
        config_test: matches.get_flag("test"),
        log_level: string_arg("log", DEFAULT_LOG_LEVEL),
    }
}

pub fn parse_args() -> Result<AppArgs> {
    let args = args_from_matches(&command().get_matches());
    init_logging(&args.log_level)?;
    Ok(args)
}

pub fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.parse()?)
        .from_env()?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let matches = command().try_get_matches_from(["splice-relay"]).unwrap();
        let args = args_from_matches(&matches);
        assert_eq!(args.config_file, "config.yaml");
        assert!(!args.config_test);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn explicit_flags() {
        let matches = command()
            .try_get_matches_from(["splice-relay", "-c", "relay.yaml", "-l", "debug", "-t"])
            .unwrap();
        let args = args_from_matches(&matches);
        assert_eq!(args.config_file, "relay.yaml");
        assert!(args.config_test);
        assert_eq!(args.log_level, "debug");
    }

    #[test]
    fn short_error_level_is_an_alias() {
        let matches = command()
            .try_get_matches_from(["splice-relay", "--log", "erro"])
            .unwrap();
        assert_eq!(args_from_matches(&matches).log_level, "error");
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        assert!(
            command()
                .try_get_matches_from(["splice-relay", "-l", "loud"])
                .is_err()
        );
    }
}
