use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing::Level;

use rtspdump::pull::{self, Output};

mod log;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Verbose mode [default: "warn", -v "info", -vv "debug", -vvv "trace"]
    #[arg(short = 'v', action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,
    /// rtsp://[ip]:[port]/[stream] of the source
    #[arg(short, long)]
    input: String,
    /// Append the raw Annex-B stream to this file
    #[arg(short, long, default_value = "output.h264")]
    output: PathBuf,
    /// Remux through ffmpeg into this MP4 instead of writing raw H.264
    #[arg(long)]
    mp4: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    log::set(format!(
        "rtspdump={0},rtsp={0}",
        match args.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    ));

    let output = match args.mp4 {
        Some(path) => Output::Mp4(path),
        None => Output::File(args.output),
    };

    pull::run(&args.input, output).await
}
