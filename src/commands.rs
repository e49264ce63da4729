//! Line-oriented control surface for the binary. One command per line on
//! stdin, one reply per command on stdout.

use std::str::FromStr;

use anyhow::{anyhow, Result};
use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::{
    export::{share_caption, share_links},
    pipeline::PipelineController,
    recording::{RecordingPhase, RecordingStatus},
    settings::SettingsStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Switch,
    Record,
    StopRecord,
    Retry,
    Stats,
    ClearStats,
    Status,
    Share,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "switch" | "flip" => Ok(Command::Switch),
            "record" | "rec" => Ok(Command::Record),
            "stop-record" | "stop-rec" => Ok(Command::StopRecord),
            "retry" => Ok(Command::Retry),
            "stats" => Ok(Command::Stats),
            "clear-stats" => Ok(Command::ClearStats),
            "status" => Ok(Command::Status),
            "share" => Ok(Command::Share),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(anyhow!("unknown command '{other}' (try 'help')")),
        }
    }
}

const HELP: &str = "commands: start | stop | switch | record | stop-record | retry | stats | clear-stats | status | share | quit";

fn describe_recording(status: &RecordingStatus) -> String {
    match &status.phase {
        RecordingPhase::Idle => "idle".to_string(),
        RecordingPhase::Recording => format!(
            "recording {}s / {}s",
            status.elapsed_seconds, status.max_duration_seconds
        ),
        RecordingPhase::Finalizing => "finalizing".to_string(),
        RecordingPhase::Ready(clip) => {
            format!("ready: {} ({} bytes)", clip.filename, clip.size_bytes())
        }
    }
}

/// Runs one command and returns the reply to print.
pub async fn execute(
    pipeline: &PipelineController,
    settings: &SettingsStore,
    command: Command,
) -> Result<String> {
    let reply = match command {
        Command::Start => format!("{:?}", pipeline.start_camera().await?),
        Command::Stop => {
            pipeline.stop_camera().await?;
            "camera off".to_string()
        }
        Command::Switch => {
            let status = pipeline.switch_facing().await?;
            let facing = pipeline.camera_config().await.facing;
            if status.is_monitoring() {
                settings.set_facing(facing)?;
            }
            format!("{status:?} ({} facing)", facing.as_constraint())
        }
        Command::Record => {
            let handle = pipeline.start_recording().await?;
            format!("recording {}", handle.id())
        }
        Command::StopRecord => {
            let clip = pipeline.stop_recording().await?;
            format!(
                "clip {} ({} bytes, {}s, {})",
                clip.filename,
                clip.size_bytes(),
                clip.duration_seconds,
                clip.mime_type
            )
        }
        Command::Retry => format!("{:?}", pipeline.retry().await?),
        Command::Stats => serde_json::to_string_pretty(&pipeline.stats().await?)?,
        Command::ClearStats => {
            pipeline.clear_stats().await?;
            "stats cleared".to_string()
        }
        Command::Status => {
            let alarm = pipeline.alarm_snapshot();
            let metrics = pipeline.metrics().await;
            format!(
                "{}\nalarm: {:?} (detections: {})\nrecording: {}\npolls: {} ({} skipped, {} failed, avg {:.1} ms)",
                serde_json::to_string(&pipeline.status())?,
                alarm.phase,
                alarm.detection_count,
                describe_recording(&pipeline.recording_status()),
                metrics.poll_count,
                metrics.skipped_ticks,
                metrics.failed_polls,
                metrics.average_inference_ms().unwrap_or(0.0),
            )
        }
        Command::Share => {
            let links = share_links()?;
            format!(
                "{}\ntwitter: {}\nlinkedin: {}",
                share_caption(),
                links.twitter,
                links.linkedin
            )
        }
        Command::Help => HELP.to_string(),
        Command::Quit => "bye".to_string(),
    };
    Ok(reply)
}

/// Reads commands from stdin until `quit` or end of input, then stops the
/// camera so any open recording is finalized.
pub async fn run_repl(pipeline: PipelineController, settings: &SettingsStore) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };

        match execute(&pipeline, settings, command).await {
            Ok(reply) => println!("{reply}"),
            Err(err) => {
                error!("Command {command:?} failed: {err:#}");
                println!("error: {err}");
            }
        }

        if command == Command::Quit {
            break;
        }
    }

    info!("Shutting down");
    pipeline.stop_camera().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases_case_insensitively() {
        assert_eq!("START".parse::<Command>().unwrap(), Command::Start);
        assert_eq!(" flip ".parse::<Command>().unwrap(), Command::Switch);
        assert_eq!("stop-rec".parse::<Command>().unwrap(), Command::StopRecord);
        assert_eq!("exit".parse::<Command>().unwrap(), Command::Quit);
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!("dance".parse::<Command>().is_err());
    }

    #[test]
    fn recording_description_counts_up_to_limit() {
        let status = RecordingStatus {
            phase: RecordingPhase::Recording,
            elapsed_seconds: 12,
            max_duration_seconds: 30,
        };
        assert_eq!(describe_recording(&status), "recording 12s / 30s");
        assert_eq!(describe_recording(&RecordingStatus::idle(30)), "idle");
    }
}
