use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use crossbeam_channel::RecvTimeoutError;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use floppyforge_core::floppy::{AMIGA_ADF_880K, FLOPPY_720K, FLOPPY_1440K, FLOPPY_2880K};
use floppyforge_core::{
    ByteSource, Device, FloppyFormat, FormatSize, JobEvent, JobId, JobResult, LogLevel, Phase,
    Session, TransferConfig, platform,
};
use indicatif::{HumanBytes, HumanDuration, ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "floppyforge")]
#[command(about = "Write raw floppy images and zero-fill wipe floppy disks", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Bytes per read/write cycle
    #[arg(long, global = true, env = "FLOPPYFORGE_CHUNK_SIZE", default_value_t = 64 * 1024)]
    chunk_size: usize,

    /// Short writes tolerated per chunk before giving up
    #[arg(long, global = true, env = "FLOPPYFORGE_RETRIES", default_value_t = 8)]
    retries: u32,

    /// Increase log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image (.img, .adf, optionally .gz/.xz/.zst) to a floppy
    Write {
        /// Image file to write
        #[arg(required = true)]
        image: PathBuf,

        #[command(flatten)]
        target: TargetArgs,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Overwrite a floppy with zeros (a deep wipe, not a filesystem format)
    Format {
        #[command(flatten)]
        target: TargetArgs,

        /// How much of the disk to wipe
        #[arg(long, value_enum, default_value_t = WipeSize::Auto)]
        size: WipeSize,

        /// Read the disk back afterwards to check every byte is zero
        #[arg(long)]
        verify: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Compare a floppy against an image without writing
    Verify {
        /// Image file to compare against
        #[arg(required = true)]
        image: PathBuf,

        #[command(flatten)]
        target: TargetArgs,
    },
    /// List floppy drives
    List,
}

#[derive(Args)]
struct TargetArgs {
    /// Target device path (e.g. /dev/fd0)
    #[arg(short, long, conflicts_with = "drive")]
    device: Option<PathBuf>,

    /// Target drive letter (A or B)
    #[arg(long)]
    drive: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum WipeSize {
    /// The full capacity the drive reports
    Auto,
    #[value(name = "720k")]
    Dd720,
    #[value(name = "1.44m")]
    Hd1440,
    #[value(name = "2.88m")]
    Ed2880,
    #[value(name = "880k")]
    Amiga880,
}

impl WipeSize {
    fn to_format_size(self) -> FormatSize {
        match self {
            WipeSize::Auto => FormatSize::DeviceCapacity,
            WipeSize::Dd720 => FormatSize::Fixed(FLOPPY_720K),
            WipeSize::Hd1440 => FormatSize::Fixed(FLOPPY_1440K),
            WipeSize::Ed2880 => FormatSize::Fixed(FLOPPY_2880K),
            WipeSize::Amiga880 => FormatSize::Fixed(AMIGA_ADF_880K),
        }
    }
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal so that
/// Ctrl+C does not print `^C` over the progress bars. The original terminal
/// state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            let original_termios = stdout()
                .is_terminal()
                .then(|| Termios::from_fd(fd).ok())
                .flatten()
                .filter(|original| {
                    let mut quiet = *original;
                    quiet.c_lflag &= !ECHOCTL;
                    tcsetattr(fd, TCSANOW, &quiet).is_ok()
                });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "error",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Presents an interactive menu for the user to select a drive.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No floppy drives found. Use --device to name one explicitly."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn resolve_target(target: &TargetArgs, prompt: &str) -> Result<PathBuf> {
    if let Some(device) = &target.device {
        info!(device = %device.display(), "using device from --device");
        return Ok(device.clone());
    }
    if let Some(letter) = &target.drive {
        let device = platform::resolve_drive(letter)?;
        info!(drive = %letter, device = %device.display(), "resolved drive letter");
        return Ok(device);
    }
    let devices = platform::get_floppy_devices()?;
    let device = select_device(&devices, prompt)?.path;
    info!(device = %device.display(), found = devices.len(), "device selected interactively");
    Ok(device)
}

/// Sizes are judged on the image as it will be written, so a compressed
/// image is measured after unpacking.
fn needs_size_confirmation(source: &ByteSource) -> bool {
    FloppyFormat::from_size(source.size()).is_none()
}

fn bar_style(color: &str) -> Result<ProgressStyle> {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{msg}})"
    );
    Ok(ProgressStyle::default_bar()
        .template(&template)?
        .progress_chars("■ "))
}

fn print_log_line(bar: &ProgressBar, level: LogLevel, text: &str) {
    let line = match level {
        LogLevel::Info => style(text).cyan().to_string(),
        LogLevel::Ok => style(text).green().to_string(),
        LogLevel::Warn => style(text).yellow().to_string(),
        LogLevel::Error => style(text).red().bold().to_string(),
    };
    bar.println(line);
}

/// Renders one job's events until it finishes. Ctrl+C turns into a
/// cancellation request; the job itself decides when it stops.
fn follow_job(session: &Session, job: JobId, running: &AtomicBool) -> Result<JobResult> {
    let events = session.events();
    let write_pb = ProgressBar::new(0);
    let verify_pb = ProgressBar::hidden();
    let mut cancel_sent = false;

    loop {
        if !running.load(Ordering::SeqCst) && !cancel_sent {
            warn!(%job, "interrupted, requesting cancellation");
            write_pb.println(style("Stop requested, finishing the current chunk…").yellow().to_string());
            session.cancel(job);
            cancel_sent = true;
        }

        let event = match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) if event.job() == job => event,
            Ok(_) | Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => bail!("event channel closed unexpectedly"),
        };

        match event {
            JobEvent::Started { phase: Phase::Write, total, .. } => {
                write_pb.set_length(total);
                write_pb.set_prefix("Writing");
                write_pb.set_style(bar_style("green")?);
            }
            JobEvent::Started { phase: Phase::Verify, total, .. } => {
                if write_pb.length() == Some(0) {
                    write_pb.finish_and_clear();
                } else {
                    write_pb.finish_with_message("done");
                }
                verify_pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                verify_pb.set_length(total);
                verify_pb.set_prefix("Verifying");
                verify_pb.set_style(bar_style("magenta")?);
            }
            JobEvent::Progress {
                phase,
                done,
                rate_bps,
                eta_seconds,
                ..
            } => {
                let bar = if phase == Phase::Write { &write_pb } else { &verify_pb };
                let eta = eta_seconds
                    .map(|s| HumanDuration(Duration::from_secs_f64(s)).to_string())
                    .unwrap_or_else(|| "—".to_string());
                bar.set_position(done);
                bar.set_message(format!("{}/s, {eta} left", HumanBytes(rate_bps as u64)));
            }
            JobEvent::LogLine { level, text, .. } => print_log_line(&write_pb, level, &text),
            JobEvent::Finished { result, .. } => {
                match result {
                    JobResult::Success => {
                        write_pb.finish();
                        verify_pb.finish();
                    }
                    _ => {
                        write_pb.abandon();
                        verify_pb.abandon();
                    }
                }
                session.wait(job);
                return Ok(result);
            }
        }
    }
}

fn report(result: JobResult, success: String) -> Result<()> {
    match result {
        JobResult::Success => {
            println!("\n✨ {success}");
            Ok(())
        }
        JobResult::Cancelled => Err(anyhow!("Operation cancelled by user")),
        JobResult::Failed(failure) => {
            let location = failure
                .offset
                .map(|o| format!(" at byte {o} ({})", HumanBytes(o)))
                .unwrap_or_default();
            Err(anyhow!("{} failed{location}: {}", failure.kind, failure.message))
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // Cleared by Ctrl+C; the job loop turns that into a cancellation.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut config = TransferConfig {
        chunk_size: cli.chunk_size,
        max_short_write_retries: cli.retries,
        ..Default::default()
    };

    match cli.command {
        Commands::Write {
            image,
            target,
            no_verify,
            yes,
        } => {
            let source = ByteSource::from_image_path(&image)
                .with_context(|| format!("cannot read image {}", image.display()))?;
            let size = source.size();
            let device = resolve_target(&target, "Select the floppy drive to WRITE to")?;

            println!(
                "{} This will overwrite the entire disk in '{}'.",
                style("WARNING:").red().bold(),
                device.display()
            );
            println!("  Device: {}", style(device.display()).cyan());
            println!("  Image:  {} ({})", style(image.display()).cyan(), HumanBytes(size));
            println!();

            if needs_size_confirmation(&source)
                && !confirm_operation(
                    &format!("The image is {size} bytes, not a typical floppy size. Proceed anyway?"),
                    yes,
                )?
            {
                println!("Write operation cancelled.");
                return Ok(());
            }
            if !confirm_operation("Are you sure you want to proceed?", yes)? {
                println!("Write operation cancelled.");
                return Ok(());
            }
            println!();

            config.verify_after_write = !no_verify;
            let session = Session::new(config);
            let job = session.start_write_source(source, &device)?;
            info!(%job, image = %image.display(), "write job running");
            let result = follow_job(&session, job, &running)?;
            report(
                result,
                format!(
                    "Successfully wrote {} to {}.",
                    style(image.display()).cyan(),
                    style(device.display()).cyan()
                ),
            )?;
        }
        Commands::Format {
            target,
            size,
            verify,
            yes,
        } => {
            let device = resolve_target(&target, "Select the floppy drive to WIPE")?;
            let amount = match size.to_format_size() {
                FormatSize::DeviceCapacity => "the full disk".to_string(),
                FormatSize::Fixed(bytes) => HumanBytes(bytes).to_string(),
            };

            println!(
                "{} This overwrites {amount} of '{}' with 0x00.",
                style("WARNING:").red().bold(),
                device.display()
            );
            println!("  It is a deep wipe, NOT a filesystem format.");
            println!();

            if !confirm_operation("Are you sure you want to proceed?", yes)? {
                println!("Format operation cancelled.");
                return Ok(());
            }
            println!();

            config.format_size = size.to_format_size();
            config.verify_after_write = verify;
            let session = Session::new(config);
            let job = session.start_format(&device)?;
            info!(%job, "wipe job running");
            let result = follow_job(&session, job, &running)?;
            report(
                result,
                format!("Successfully wiped {}.", style(device.display()).cyan()),
            )?;
        }
        Commands::Verify { image, target } => {
            let device = resolve_target(&target, "Select the floppy drive to VERIFY")?;
            let session = Session::new(config);
            let job = session.start_verify(&image, &device)?;
            info!(%job, image = %image.display(), "verify job running");
            let result = follow_job(&session, job, &running)?;
            report(
                result,
                format!(
                    "{} matches {}.",
                    style(device.display()).cyan(),
                    style(image.display()).cyan()
                ),
            )?;
        }
        Commands::List => {
            let devices = platform::get_floppy_devices()?;
            if devices.is_empty() {
                println!("No floppy drives found.");
                return Ok(());
            }

            println!("Found {} floppy drives:", devices.len());
            println!("\n  {:<12} {:<8} {:<20} {}", "DEVICE", "NAME", "FORMAT", "LOCATION");
            println!("  {:-<12} {:-<8} {:-<20} {:-<20}", "", "", "", "");
            for device in devices {
                let format = device
                    .format()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| HumanBytes(device.size_bytes).to_string());
                let location = if device.mount_point.is_empty() {
                    "(Not mounted)".to_string()
                } else {
                    device.mount_point.clone()
                };
                println!(
                    "  {:<12} {:<8} {:<20} {}",
                    device.path.display(),
                    device.name,
                    format,
                    location
                );
            }
        }
    }

    Ok(())
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
    fn wipe_sizes_map_to_floppy_geometries() {
        assert_eq!(WipeSize::Auto.to_format_size(), FormatSize::DeviceCapacity);
        assert_eq!(WipeSize::Hd1440.to_format_size(), FormatSize::Fixed(1_474_560));
        let cli = Cli::try_parse_from(["floppyforge", "format", "--device", "/dev/fd0", "--size", "720k"])
            .unwrap();
        match cli.command {
            Commands::Format { size, .. } => {
                assert_eq!(size.to_format_size(), FormatSize::Fixed(737_280))
            }
            _ => panic!("expected format"),
        }
    }

    #[test]
    fn device_and_drive_are_mutually_exclusive() {
        let parsed = Cli::try_parse_from([
            "floppyforge",
            "verify",
            "disk.img",
            "--device",
            "/dev/fd0",
            "--drive",
            "A",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn compressed_images_are_sized_after_unpacking() {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dos622.img.gz");
        let mut encoder = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::fast());
        encoder.write_all(&vec![0xF6; FLOPPY_1440K as usize]).unwrap();
        encoder.finish().unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() < FLOPPY_1440K);

        let source = ByteSource::from_image_path(&path).unwrap();
        assert_eq!(source.size(), FLOPPY_1440K);
        assert!(!needs_size_confirmation(&source));

        let odd = dir.path().join("odd.img");
        std::fs::write(&odd, vec![0u8; 1000]).unwrap();
        assert!(needs_size_confirmation(&ByteSource::from_image_path(&odd).unwrap()));
    }

    #[test]
    fn resolve_target_prefers_explicit_device() {
        let target = TargetArgs {
            device: Some(PathBuf::from("/dev/fd1")),
            drive: Some("A".to_string()),
        };
        assert_eq!(resolve_target(&target, "").unwrap(), std::path::Path::new("/dev/fd1"));
    }
}
