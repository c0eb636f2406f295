use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use rangeplay::Input;

#[derive(Parser)]
#[command(name = "rangeplay")]
#[command(author, version, about = "Progressive MP4 playback over HTTP byte ranges")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Exactly one of a URL or a local file.
#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct InputArgs {
    /// HTTP(S) URL of the MP4
    pub url: Option<String>,

    /// Local MP4 file
    #[arg(short, long)]
    pub file: Option<PathBuf>,
}

impl InputArgs {
    pub fn into_input(self) -> Option<Input> {
        match (self.url, self.file) {
            (Some(url), _) => Some(Input::Url(url)),
            (None, Some(path)) => Some(Input::File(path)),
            (None, None) => None,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load an MP4's metadata and print it with the decoder configuration
    Probe {
        #[command(flatten)]
        input: InputArgs,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Play through the loopback decoder, logging each presented frame
    Play {
        #[command(flatten)]
        input: InputArgs,

        /// Stop after this many presented frames
        #[arg(long)]
        frames: Option<u64>,

        /// Playback rate
        #[arg(long, default_value = "1.0")]
        rate: f64,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
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
    fn probe_takes_url_or_file() {
        let cli = Cli::try_parse_from(["rangeplay", "probe", "http://h/v.mp4", "--json"]).unwrap();
        let Commands::Probe { input, json } = cli.command else {
            panic!("expected probe");
        };
        assert!(json);
        assert_eq!(input.into_input(), Some(Input::Url("http://h/v.mp4".into())));

        let cli = Cli::try_parse_from(["rangeplay", "probe", "--file", "clip.mp4"]).unwrap();
        let Commands::Probe { input, .. } = cli.command else {
            panic!("expected probe");
        };
        assert_eq!(input.into_input(), Some(Input::File("clip.mp4".into())));
    }

    #[test]
    fn input_is_required_and_exclusive() {
        assert!(Cli::try_parse_from(["rangeplay", "probe"]).is_err());
        assert!(
            Cli::try_parse_from(["rangeplay", "play", "http://h/v.mp4", "--file", "a.mp4"])
                .is_err()
        );
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "rangeplay", "play", "--file", "a.mp4", "--frames", "5", "-v", "-c", "rp.json",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("rp.json")));
        let Commands::Play { frames, rate, .. } = cli.command else {
            panic!("expected play");
        };
        assert_eq!(frames, Some(5));
        assert_eq!(rate, 1.0);
    }
}
