//! hrt-player - 高精度定时 PCM 播放器
//!
//! 从网络、管道或 stdin 读取裸 PCM 流，以固定频率的循环直接写入
//! 硬件缓冲区。上游负责解码与重采样，这里只做一件事：把字节按时送达 DAC。

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};

use hrt_player::audio::{
    open_device, InputStream, MonotonicClock, OutputDevice, PcmFormat, SampleEncoding, StatsReport,
};
use hrt_player::engine::realtime::set_realtime_priority;
use hrt_player::engine::{PlayError, PlaybackConfig, PlaybackRequest, Scheduler, StartupDelay};

/// 未指定 `--device` 时使用的设备
#[cfg(all(feature = "alsa", target_os = "linux"))]
const DEFAULT_DEVICE: &str = "default";
#[cfg(not(all(feature = "alsa", target_os = "linux")))]
const DEFAULT_DEVICE: &str = "null";

/// hrt-player - play raw PCM with high resolution timing
#[derive(Parser, Debug)]
#[command(name = "hrt-player")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Host to connect to (requires --port)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to connect to on --host
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Read audio data from stdin
    #[arg(short = 'S', long)]
    stdin: bool,

    /// Read audio data from a file or named pipe
    #[arg(short = 'i', long, value_name = "PATH")]
    input: Option<PathBuf>,

    /// Output device (`null` for the in-memory device)
    #[arg(short, long)]
    device: Option<String>,

    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 44_100)]
    rate: u32,

    /// Sample format (S16_LE, S24_LE, S24_3LE, S32_LE)
    #[arg(short, long, default_value_t = SampleEncoding::S16Le)]
    format: SampleEncoding,

    /// Number of channels
    #[arg(short, long, default_value_t = 2)]
    channels: u16,

    /// Loops per second; each loop writes rate / loops frames
    #[arg(short = 'n', long, default_value_t = 1000)]
    loops_per_second: u32,

    /// Hardware buffer size in frames (rounded down to whole loops)
    #[arg(short = 'B', long, default_value_t = 4096)]
    hw_buffer_size: usize,

    /// Open the device in non-blocking mode
    #[arg(short = 'N', long)]
    non_blocking_write: bool,

    /// Initial sleep in microseconds; 0 waits for the pipeline to fill
    #[arg(short = 'D', long = "sleep", default_value_t = 0)]
    sleep_us: u64,

    /// Receive buffer size for the network socket in bytes (0: OS default, minimum 128)
    #[arg(short = 'I', long)]
    in_net_buffer_size: Option<usize>,

    /// Run with SCHED_FIFO at the given priority
    #[arg(short = 'R', long)]
    realtime_priority: Option<i32>,

    /// Increase verbosity (-v: info, -vv: debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match play(&cli) {
        Ok(report) => {
            log::info!("{}", report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn play(cli: &Cli) -> Result<StatsReport, PlayError> {
    let request = PlaybackRequest {
        format: PcmFormat::new(cli.format, cli.channels, cli.rate),
        loops_per_second: cli.loops_per_second,
        hw_buffer_frames: cli.hw_buffer_size,
        nonblocking: cli.non_blocking_write,
        startup: StartupDelay::from_micros(cli.sleep_us),
        ..PlaybackRequest::default()
    };
    let config = PlaybackConfig::new(request)?;

    let source = open_source(cli)?;
    log::info!("Reading {} input", source.kind());

    let name = cli.device.as_deref().unwrap_or(DEFAULT_DEVICE);
    let device = open_device(name)?;
    log::info!("Opened output device {}", device.name());

    if let Some(priority) = cli.realtime_priority {
        set_realtime_priority(priority);
    }

    let mut scheduler = Scheduler::new(&config, source, device, MonotonicClock)?;
    scheduler.run()
}

fn open_source(cli: &Cli) -> Result<InputStream, PlayError> {
    let setup = |what: &'static str| move |source: std::io::Error| PlayError::Source { what, source };

    if let (Some(host), Some(port)) = (cli.host.as_deref(), cli.port) {
        let stream = InputStream::connect(host, port).map_err(setup("connect"))?;
        if let Some(bytes) = cli.in_net_buffer_size.filter(|&b| b > 0) {
            stream.set_receive_buffer(bytes).map_err(setup("receive buffer"))?;
        }
        return Ok(stream);
    }
    if let Some(path) = cli.input.as_ref() {
        return InputStream::open(path).map_err(setup("open"));
    }
    if cli.stdin {
        return InputStream::stdin().map_err(setup("stdin"));
    }
    Err(PlayError::MissingSource)
}
