use anyhow::Result;
use clap::{Parser, Subcommand};
use tracking::{TrackerCliArgs, TrackerConfig};
use video_ingest::list_video_devices;

#[derive(Debug, Parser)]
#[command(name = "tracker", version, about = "Real-time entity tracker")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Track entities from a video source and stream updates to consumers.
    Run(TrackerCliArgs),
    /// Probe /dev/videoN devices until the first missing index.
    ListCameras,
}

pub fn handle_command(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => {
            let config = TrackerConfig::try_from(args)?;
            tracking::run(config)
        }
        Command::ListCameras => {
            let _ = tracing_subscriber::fmt::try_init();
            let devices = list_video_devices();
            if devices.is_empty() {
                println!("No cameras found.");
            }
            for device in devices {
                tracing::debug!("probed {}", device.path.display());
                println!("Camera {} available at {}", device.index, device.path.display());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_subcommand_parses_tracker_flags() {
        let cli = Cli::try_parse_from([
            "tracker",
            "run",
            "/dev/video2",
            "--replay",
            "poses.jsonl",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        let config = TrackerConfig::try_from(args).unwrap();
        assert_eq!(config.source_uri, "/dev/video2");
    }

    #[test]
    fn list_cameras_takes_no_arguments() {
        assert!(Cli::try_parse_from(["tracker", "list-cameras"]).is_ok());
        assert!(Cli::try_parse_from(["tracker", "list-cameras", "extra"]).is_err());
    }
}
