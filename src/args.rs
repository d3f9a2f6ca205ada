//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Command-line argument parsing.
//!

mod cmdline {
    pub const ENABLE_LOGGING: &str = "log";
    pub const EXPOSURE: &str = "exposure";
    pub const STREAM: &str = "stream";
    pub const GUIDE: &str = "guide";
    pub const DEVICE: &str = "device";
}

#[derive(Debug, Default, PartialEq)]
pub struct Args {
    pub logging: bool,
    /// Duration (s) of a single exposure to take.
    pub exposure: Option<f64>,
    /// Duration (s) of streaming.
    pub stream: Option<f64>,
    /// Duration (ms) of a north guide pulse followed by a west one.
    pub guide: Option<f64>,
    /// Device to use; the first one found if not given.
    pub device: Option<String>
}

fn positive_number(option_values: &std::collections::HashMap<String, Vec<String>>, option: &str) -> Result<Option<f64>, ()> {
    match option_values.get(option) {
        None => Ok(None),
        Some(values) => match values.as_slice() {
            [value] => match value.parse::<f64>() {
                Ok(number) if number > 0.0 => Ok(Some(number)),
                _ => { eprintln!("Invalid value of --{}: {}.", option, value); Err(()) }
            },
            _ => { eprintln!("Option --{} requires a single value.", option); Err(()) }
        }
    }
}

pub fn parse_command_line<I: Iterator<Item=String>>(stream: I) -> Args {
    let allowed_options = vec![
        cmdline::ENABLE_LOGGING,
        cmdline::EXPOSURE,
        cmdline::STREAM,
        cmdline::GUIDE,
        cmdline::DEVICE
    ];

    // key: option name
    let mut option_values = std::collections::HashMap::<String, Vec<String>>::new();

    let mut current: Option<&mut Vec<String>> = None;

    for arg in stream.skip(1) /*skip the binary name*/ {
        if arg.starts_with("--") {
            match &arg[2..] {
                x if !allowed_options.contains(&x) => {
                    eprintln!("Unknown command-line option: {}.", x);
                    return Args::default();
                },

                opt => current = Some(option_values.entry(opt.to_string()).or_insert(vec![])),
            }
        } else {
            match current.as_mut() {
                None => {
                    eprintln!("Unexpected value: {}.", arg);
                    return Args::default();
                },
                Some(values) => values.push(arg)
            }
        }
    }

    let numbers = (
        positive_number(&option_values, cmdline::EXPOSURE),
        positive_number(&option_values, cmdline::STREAM),
        positive_number(&option_values, cmdline::GUIDE)
    );
    let (exposure, stream, guide) = match numbers {
        (Ok(exposure), Ok(stream), Ok(guide)) => (exposure, stream, guide),
        _ => return Args::default()
    };

    let device = match option_values.get(cmdline::DEVICE).map(|v| v.as_slice()) {
        None => None,
        Some([]) => { eprintln!("Option --{} requires a value.", cmdline::DEVICE); return Args::default(); },
        // device names may contain spaces
        Some(words) => Some(words.join(" "))
    };

    Args{
        logging: option_values.contains_key(cmdline::ENABLE_LOGGING),
        exposure,
        stream,
        guide,
        device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        parse_command_line(std::iter::once("ccdhost").chain(args.iter().copied()).map(|s| s.to_string()))
    }

    #[test]
    fn options_with_values_are_parsed() {
        let args = parse(&["--log", "--exposure", "2.5", "--guide", "300", "--device", "ZWO", "CCD", "ASI120MM"]);
        assert_eq!(
            Args{
                logging: true,
                exposure: Some(2.5),
                stream: None,
                guide: Some(300.0),
                device: Some("ZWO CCD ASI120MM".to_string())
            },
            args
        );
    }

    #[test]
    fn invalid_input_yields_defaults() {
        assert_eq!(Args::default(), parse(&["--verbose"]));
        assert_eq!(Args::default(), parse(&["value"]));
        assert_eq!(Args::default(), parse(&["--exposure", "-1"]));
        assert_eq!(Args::default(), parse(&["--stream"]));
        assert_eq!(Args::default(), parse(&["--log", "--device"]));
    }
}
