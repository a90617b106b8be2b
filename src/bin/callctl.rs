use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use std::io::Read;
use std::path::{Path, PathBuf};
use video_call::sdp::munge;
use video_call::stats::{StatsDelta, StatsSnapshot, delta_compress};

#[derive(Parser)]
#[command(name = "callctl")]
#[command(about = "Session description and stats inspection tool")]
#[command(
    long_about = "Applies the session description transforms used during negotiation to SDP files, and computes or replays stats deltas"
)]
struct Cli {
    /// Write the result here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Session description transforms. Input is read from FILE, or stdin with `-`.
    Sdp {
        #[command(subcommand)]
        command: SdpCommand,
    },
    /// Stats delta encoding.
    Stats {
        #[command(subcommand)]
        command: StatsCommand,
    },
}

#[derive(Subcommand)]
enum SdpCommand {
    /// Keeps only the given codec, e.g. `video/vp9`
    RemoveCodecs {
        file: PathBuf,
        mime_type: String,
        #[arg(long)]
        fmtp: Option<String>,
    },
    /// Sets the encoder start bitrate of a video section
    StartBitrate {
        file: PathBuf,
        max_kbps: u32,
        #[arg(long, default_value_t = 0.7)]
        factor: f64,
        #[arg(long, default_value = "1")]
        mid: String,
    },
    /// Copies stereo=1 from the offer into the answer
    Stereo { offer: PathBuf, answer: PathBuf },
    /// Turns Opus discontinuous transmission on or off
    Dtx {
        file: PathBuf,
        #[arg(long)]
        disable: bool,
    },
    /// Moves a codec to the front of a media section
    PreferredCodec {
        file: PathBuf,
        kind: String,
        codec: String,
    },
    /// Stereo and maximum bitrate for the Opus codec of a section
    HighQualityAudio { file: PathBuf, mid: String },
}

#[derive(Subcommand)]
enum StatsCommand {
    /// Prints the delta between two snapshots
    Delta {
        current: PathBuf,
        #[arg(long)]
        previous: Option<PathBuf>,
    },
    /// Rebuilds a snapshot from a delta and its baseline
    Apply {
        delta: PathBuf,
        #[arg(long)]
        baseline: Option<PathBuf>,
    },
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = read_input(path)?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn run_sdp(command: SdpCommand) -> anyhow::Result<String> {
    let output = match command {
        SdpCommand::RemoveCodecs {
            file,
            mime_type,
            fmtp,
        } => munge::remove_codecs_except(&read_input(&file)?, &mime_type, fmtp.as_deref())?,
        SdpCommand::StartBitrate {
            file,
            max_kbps,
            factor,
            mid,
        } => munge::set_start_bitrate(&read_input(&file)?, max_kbps, factor, &mid)?,
        SdpCommand::Stereo { offer, answer } => munge::enable_stereo(&read_input(&offer)?, &read_input(&answer)?)?,
        SdpCommand::Dtx { file, disable } => munge::toggle_dtx(&read_input(&file)?, !disable)?,
        SdpCommand::PreferredCodec { file, kind, codec } => {
            munge::set_preferred_codec(&read_input(&file)?, &kind, &codec)?
        }
        SdpCommand::HighQualityAudio { file, mid } => munge::enable_high_quality_audio(&read_input(&file)?, &mid)?,
    };
    Ok(output)
}

fn run_stats(command: StatsCommand) -> anyhow::Result<String> {
    let value = match command {
        StatsCommand::Delta { current, previous } => {
            let current: StatsSnapshot = read_json(&current)?;
            let previous: Option<StatsSnapshot> = previous.as_deref().map(read_json::<StatsSnapshot>).transpose()?;
            let delta = delta_compress(previous.as_ref(), &current);
            info!("{} entries, timestamp {}", delta.entries.len(), delta.timestamp);
            serde_json::to_value(delta)?
        }
        StatsCommand::Apply { delta, baseline } => {
            let delta: StatsDelta = read_json(&delta)?;
            let baseline: Option<StatsSnapshot> = baseline.as_deref().map(read_json::<StatsSnapshot>).transpose()?;
            serde_json::to_value(delta.apply(baseline.as_ref()))?
        }
    };
    Ok(serde_json::to_string_pretty(&value)?)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let output = match cli.command {
        Commands::Sdp { command } => run_sdp(command)?,
        Commands::Stats { command } => run_stats(command)?,
    };

    match cli.output {
        Some(path) => {
            std::fs::write(&path, output).with_context(|| format!("writing {}", path.display()))?;
            info!("Wrote {}", path.display());
        }
        None => print!("{output}"),
    }
    Ok(())
}
