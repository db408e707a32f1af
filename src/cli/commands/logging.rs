use clap::{Arg, Command, builder::ValueParser};

pub const ARG_VERBOSITY: &str = "verbosity";

#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            if parsed <= 5 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
            .env("CUSTODIA_LOG_LEVEL")
            .global(true)
            .action(clap::ArgAction::Count)
            .value_parser(validator_log_level()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_and_named_levels_parse() {
        let parser = validator_log_level();
        let cmd = Command::new("t").arg(Arg::new("v").long("v").value_parser(parser));

        for (value, expected) in [("0", 0u8), ("4", 4), ("warn", 1), ("TRACE", 4)] {
            let matches = cmd
                .clone()
                .get_matches_from(vec!["t", "--v", value]);
            assert_eq!(matches.get_one::<u8>("v").copied(), Some(expected));
        }

        let err = cmd
            .clone()
            .try_get_matches_from(vec!["t", "--v", "loud"]);
        assert!(err.is_err());
    }
}
