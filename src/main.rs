//! tui-preview - run a WASI terminal program inside a wasm VT engine
//!
//! The guest gets a preview1 syscall surface (args, env, clocks, random,
//! stdout/stderr, a stdin queue); its output is interpreted by the VT engine
//! and the resulting cell grid is painted.
//!
//! # Modes
//!
//! - **Live**: shown in this terminal; keys are forwarded to the guest
//! - **Snapshot**: headless; runs to exit and writes the last frame as PPM
//!
//! # Quick Start
//!
//! ```text
//! tui-preview app.wasm                       # live, sized to this terminal
//! tui-preview --cols 100 app.wasm -- --fancy # fixed grid, guest args
//! tui-preview -s out.ppm app.wasm            # headless snapshot
//! ```

use std::env;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tui_preview::config::{
    ArgvBuilder, Config, FitMode, ModernSpec, PreviewSpec, RenderMode, ResolvedOptions, Size,
    DEFAULT_COLS, DEFAULT_ROWS,
};
use tui_preview::core::runtime::Runtime;
use tui_preview::core::session::{HostArea, Session, SessionStatus};
use tui_preview::core::vt::WasmEngine;
use tui_preview::ui::keys::encode_key;
use tui_preview::ui::{Framebuffer, Presenter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upper bound on a headless run
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(30);

type PreviewSession = Session<WasmEngine, Framebuffer>;

/// Command line arguments
#[derive(Debug, Default)]
struct Args {
    guest: String,
    guest_args: Vec<String>,
    engine: Option<String>,
    cols: Option<u32>,
    rows: Option<u32>,
    theme: Option<String>,
    no_eol: bool,
    static_mode: bool,
    snapshot: Option<PathBuf>,
    config: Option<PathBuf>,
}

fn print_version() {
    eprintln!("tui-preview {}", VERSION);
}

fn print_help() {
    print_version();
    eprintln!("Run a WASI terminal program inside a wasm VT engine");
    eprintln!();
    eprintln!("Usage: tui-preview [OPTIONS] <GUEST.wasm> [-- GUEST_ARGS...]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -e, --engine <PATH>   VT engine artifact (default from config)");
    eprintln!("  --cols <N>            Grid columns (default: host terminal width)");
    eprintln!("  --rows <N>            Grid rows (default: host terminal height)");
    eprintln!("  -t, --theme <NAME>    Color scheme");
    eprintln!("  --no-eol              Pass LF through without adding CR");
    eprintln!("  --static              Read-only: no input, cursor hidden");
    eprintln!("  -s, --snapshot <OUT>  Run headless to exit and write a PPM image");
    eprintln!("  -c, --config <PATH>   Config file (default: ~/.tui-preview/config.toml)");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Guest arguments may use {{cols}} and {{rows}}.");
    eprintln!();
    eprintln!("Live mode: Ctrl+] quits the preview.");
    eprintln!();
    eprintln!("Color schemes: {}", tui_preview::Theme::list().join(", "));
    eprintln!();
    eprintln!("Logging: ~/.tui-preview/tui-preview.log, level from TUI_PREVIEW_LOG");
}

fn parse_number(flag: &str, value: Option<&String>) -> Result<u32, String> {
    let value = value.ok_or_else(|| format!("Missing value for {}", flag))?;
    value
        .parse::<u32>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| format!("Invalid value for {}: {}", flag, value))
}

fn parse_args_from(argv: &[String]) -> Result<Args, String> {
    let mut args = Args::default();
    let mut guest = None;
    let mut i = 0;

    while i < argv.len() {
        let arg = argv[i].as_str();
        match arg {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "--" => {
                args.guest_args.extend(argv[i + 1..].iter().cloned());
                break;
            }
            "-e" | "--engine" => {
                i += 1;
                args.engine = Some(argv.get(i).ok_or("Missing engine path")?.clone());
            }
            "--cols" => {
                i += 1;
                args.cols = Some(parse_number(arg, argv.get(i))?);
            }
            "--rows" => {
                i += 1;
                args.rows = Some(parse_number(arg, argv.get(i))?);
            }
            "-t" | "--theme" => {
                i += 1;
                args.theme = Some(argv.get(i).ok_or("Missing theme name")?.clone());
            }
            "--no-eol" => args.no_eol = true,
            "--static" => args.static_mode = true,
            "-s" | "--snapshot" => {
                i += 1;
                args.snapshot = Some(PathBuf::from(argv.get(i).ok_or("Missing snapshot path")?));
            }
            "-c" | "--config" => {
                i += 1;
                args.config = Some(PathBuf::from(argv.get(i).ok_or("Missing config path")?));
            }
            _ if arg.starts_with('-') && arg.len() > 1 => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            _ if guest.is_none() => guest = Some(arg.to_string()),
            _ => args.guest_args.push(arg.to_string()),
        }
        i += 1;
    }

    args.guest = guest.ok_or("Missing guest module")?;
    Ok(args)
}

fn parse_args() -> Result<Args, String> {
    let argv: Vec<String> = env::args().skip(1).collect();
    parse_args_from(&argv)
}

/// Turn the command line into preview options
fn preview_spec(args: &Args, host_size: Option<(u16, u16)>) -> PreviewSpec {
    let mut spec = ModernSpec::new(args.guest.clone());
    let templated = args
        .guest_args
        .iter()
        .any(|a| a.contains("{cols}") || a.contains("{rows}"));
    spec.argv = if templated {
        ArgvBuilder::Template(args.guest_args.clone())
    } else {
        ArgvBuilder::Static(args.guest_args.clone())
    };

    if args.cols.is_some() || args.rows.is_some() {
        spec.size = Some(Size::new(
            args.cols.unwrap_or(DEFAULT_COLS),
            args.rows.unwrap_or(DEFAULT_ROWS),
        ));
        spec.fit = Some(FitMode::None);
    } else if let Some((cols, rows)) = host_size {
        spec.size = Some(Size::new(cols as u32, rows as u32));
        spec.fit = Some(FitMode::Container);
    }

    if args.static_mode {
        spec.mode = RenderMode::Static;
    }
    spec.terminal.engine = args.engine.clone();
    spec.terminal.color_scheme = args.theme.clone();
    if args.no_eol {
        spec.terminal.convert_eol = Some(false);
    }
    PreviewSpec::Modern(spec)
}

fn init_logging() {
    let log_path = Config::config_dir()
        .map(|dir| dir.join("tui-preview.log"))
        .unwrap_or_else(|| PathBuf::from("tui-preview.log"));

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_env("TUI_PREVIEW_LOG")
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn exit_code(status: &SessionStatus) -> i32 {
    match status {
        SessionStatus::Exited(code) => *code,
        _ => 1,
    }
}

fn report(status: &SessionStatus) {
    match status {
        SessionStatus::Exited(code) => info!("Guest exited with {}", code),
        SessionStatus::Error(message) => eprintln!("Error: {}", message),
        other => warn!("Stopped while {:?}", other),
    }
}

/// Run headless to exit and write the last frame
fn run_snapshot(
    runtime: &Runtime,
    options: &ResolvedOptions,
    input_limit: usize,
    out: &Path,
) -> anyhow::Result<i32> {
    let mut session = PreviewSession::new(false, input_limit);
    let host = HostArea {
        frame_interval: Duration::ZERO,
        ..HostArea::default()
    };
    session.start(runtime, options, Framebuffer::new(), host)?;
    session.wait(SNAPSHOT_TIMEOUT)?;
    if !session.status().is_finished() {
        warn!("Guest still running after {:?}, writing current frame", SNAPSHOT_TIMEOUT);
    }

    if let Some(surface) = session.surface() {
        let file = File::create(out).with_context(|| format!("Failed to create {}", out.display()))?;
        let mut writer = BufWriter::new(file);
        surface
            .renderer()
            .canvas()
            .write_ppm(&mut writer)
            .with_context(|| format!("Failed to write {}", out.display()))?;
        info!("Wrote snapshot to {}", out.display());
    }

    let status = session.status().clone();
    report(&status);
    session.dispose();
    Ok(exit_code(&status))
}

/// Show the guest in this terminal until it exits or the user quits
fn run_live(runtime: &Runtime, options: &ResolvedOptions, input_limit: usize) -> anyhow::Result<i32> {
    let mut session = PreviewSession::new(options.interactive, input_limit);
    session.start(runtime, options, Framebuffer::new(), HostArea::default())?;

    let mut presenter = Presenter::new();
    presenter.init()?;
    let result = run_main_loop(&mut session, &mut presenter, options);
    let _ = presenter.cleanup();

    let status = session.status().clone();
    session.dispose();
    result?;
    report(&status);
    Ok(exit_code(&status))
}

fn run_main_loop(
    session: &mut PreviewSession,
    presenter: &mut Presenter,
    options: &ResolvedOptions,
) -> anyhow::Result<()> {
    let poll_timeout = Duration::from_millis(10);
    let theme = &options.terminal.theme;
    let input = session.input_handle();

    loop {
        if let Some(snapshot) = session.pump()?.painted() {
            presenter.present(snapshot, theme)?;
        }
        if session.status().is_finished() {
            info!("Session ended");
            break;
        }

        if !event::poll(poll_timeout)? {
            continue;
        }
        match event::read()? {
            Event::Key(key) => {
                if key.kind == KeyEventKind::Press
                    && key.code == KeyCode::Char(']')
                    && key.modifiers.contains(KeyModifiers::CONTROL)
                {
                    info!("Quit requested");
                    break;
                }
                if let (Some(input), Some(bytes)) = (&input, encode_key(&key)) {
                    // overflow is logged by the queue
                    let _ = input.push(&bytes);
                }
            }
            Event::Paste(text) => {
                if let Some(input) = &input {
                    let _ = input.push(text.as_bytes());
                }
            }
            Event::Resize(cols, rows) if options.fit == FitMode::Container => {
                presenter.clear()?;
                session.resize(Size::new(cols as u32, rows as u32))?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(2);
        }
    };

    init_logging();
    info!("tui-preview {} starting...", VERSION);

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    let host_size = if args.snapshot.is_none() {
        Some(Presenter::size()?)
    } else {
        None
    };
    let options = preview_spec(&args, host_size).resolve(&config);
    info!(
        "Guest: {} | engine: {} | {}x{}",
        options.wasm, options.terminal.engine, options.size.cols, options.size.rows
    );

    let runtime = Runtime::new(config.cache_capacity);
    let result = match &args.snapshot {
        Some(out) => run_snapshot(&runtime, &options, config.input_limit, out),
        None => run_live(&runtime, &options, config.input_limit),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
