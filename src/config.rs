//! Configuration, themes and preview option resolution.
//!
//! This module provides:
//! - TOML configuration file loading from `~/.tui-preview/config.toml`
//! - Built-in color schemes (tokyo-night, solarized-dark, dracula, nord, gruvbox-dark)
//! - The tagged [`PreviewSpec`] (modern or legacy shape), resolved once into
//!   [`ResolvedOptions`]
//!
//! # Configuration File
//!
//! ```toml
//! # Color scheme: tokyo-night, solarized-dark, dracula, nord, gruvbox-dark
//! color_scheme = "tokyo-night"
//!
//! font_size = 14
//! font_family = "monospace"
//! engine = "ghostty-vt.wasm"
//! convert_eol = true
//!
//! [theme]
//! background = "#101010"
//! bright_black = "rgb(80, 80, 80)"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_COLS: u32 = 80;
pub const DEFAULT_ROWS: u32 = 24;
pub const DEFAULT_FONT_SIZE: f32 = 14.0;
pub const DEFAULT_FONT_FAMILY: &str = "monospace";
pub const DEFAULT_ENGINE: &str = "ghostty-vt.wasm";
pub const DEFAULT_CACHE_CAPACITY: usize = 16;
pub const DEFAULT_INPUT_LIMIT: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Color scheme name
    pub color_scheme: String,
    /// Per-color overrides applied on top of the scheme
    pub theme: ThemeOverrides,
    /// Font size in pixels
    pub font_size: f32,
    pub font_family: String,
    /// Path or `file://` URL of the VT engine artifact
    pub engine: String,
    /// Write LF as CR LF
    pub convert_eol: bool,
    /// Entries kept per module cache
    pub cache_capacity: usize,
    /// Upper bound on queued guest input, in bytes
    pub input_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            color_scheme: "tokyo-night".to_string(),
            theme: ThemeOverrides::default(),
            font_size: DEFAULT_FONT_SIZE,
            font_family: DEFAULT_FONT_FAMILY.to_string(),
            engine: DEFAULT_ENGINE.to_string(),
            convert_eol: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            input_limit: DEFAULT_INPUT_LIMIT,
        }
    }
}

impl Config {
    /// Load configuration from the default location, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// `~/.tui-preview`, created on demand
    pub fn config_dir() -> Option<PathBuf> {
        let dir = home_dir()?.join(".tui-preview");
        if !dir.exists() {
            let _ = fs::create_dir_all(&dir);
        }
        Some(dir)
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Scheme selected by name with the file's overrides applied
    pub fn theme(&self) -> Theme {
        self.theme.apply(Theme::by_name(&self.color_scheme))
    }

    pub fn terminal_options(&self) -> TerminalOptions {
        TerminalOptions {
            font_size: self.font_size,
            font_family: self.font_family.clone(),
            convert_eol: self.convert_eol,
            theme: self.theme(),
            engine: self.engine.clone(),
        }
    }
}

/// Color definition (RGB)
///
/// Deserializes from `#rgb`, `#rrggbb` or `rgb(r, g, b)`. Anything else is black.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// From a packed `0xRRGGBB` value
    pub const fn from_hex(hex: u32) -> Self {
        Self {
            r: ((hex >> 16) & 0xff) as u8,
            g: ((hex >> 8) & 0xff) as u8,
            b: (hex & 0xff) as u8,
        }
    }

    /// Packed `0xRRGGBB`
    pub const fn to_hex(self) -> u32 {
        ((self.r as u32) << 16) | ((self.g as u32) << 8) | self.b as u32
    }

    pub fn parse(text: &str) -> Self {
        Self::from_hex(parse_color_hex(text.trim()))
    }

    /// Convert to crossterm Color
    pub fn to_crossterm(&self) -> crossterm::style::Color {
        crossterm::style::Color::Rgb {
            r: self.r,
            g: self.g,
            b: self.b,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl From<String> for Color {
    fn from(text: String) -> Self {
        Self::parse(&text)
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_string()
    }
}

fn parse_color_hex(text: &str) -> u32 {
    if let Some(hex) = text.strip_prefix('#') {
        let expanded: String = if hex.len() == 3 {
            hex.chars().flat_map(|c| [c, c]).collect()
        } else {
            hex.to_string()
        };
        return u32::from_str_radix(&expanded, 16).map_or(0, |v| v & 0x00ff_ffff);
    }

    let Some(inner) = text
        .strip_prefix("rgb(")
        .and_then(|rest| rest.strip_suffix(')'))
    else {
        return 0;
    };
    let parts: Option<Vec<u32>> = inner
        .split(',')
        .map(|part| part.trim().parse::<u32>().ok().map(|v| v.min(255)))
        .collect();
    match parts.as_deref() {
        Some(&[r, g, b]) => (r << 16) | (g << 8) | b,
        _ => 0,
    }
}

/// Terminal color theme: default colors plus the 16-color ANSI palette
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theme {
    pub name: String,
    pub foreground: Color,
    pub background: Color,
    pub cursor: Color,
    pub selection_background: Color,
    pub selection_foreground: Color,
    /// black, red, green, yellow, blue, magenta, cyan, white, then the bright variants
    pub ansi: [Color; 16],
}

impl Default for Theme {
    fn default() -> Self {
        Self::tokyo_night()
    }
}

fn palette(hex: [u32; 16]) -> [Color; 16] {
    hex.map(Color::from_hex)
}

impl Theme {
    /// Tokyo Night scheme (default)
    pub fn tokyo_night() -> Self {
        Self {
            name: "tokyo-night".to_string(),
            foreground: Color::from_hex(0xa9b1d6),
            background: Color::from_hex(0x1a1b26),
            cursor: Color::from_hex(0xc0caf5),
            selection_background: Color::from_hex(0x33467c),
            selection_foreground: Color::from_hex(0xc0caf5),
            ansi: palette([
                0x15161e, 0xf7768e, 0x9ece6a, 0xe0af68, 0x7aa2f7, 0xbb9af7, 0x7dcfff, 0xa9b1d6,
                0x414868, 0xf7768e, 0x9ece6a, 0xe0af68, 0x7aa2f7, 0xbb9af7, 0x7dcfff, 0xc0caf5,
            ]),
        }
    }

    /// Solarized Dark scheme
    pub fn solarized_dark() -> Self {
        Self {
            name: "solarized-dark".to_string(),
            foreground: Color::from_hex(0x839496),
            background: Color::from_hex(0x002b36),
            cursor: Color::from_hex(0x93a1a1),
            selection_background: Color::from_hex(0x073642),
            selection_foreground: Color::from_hex(0x93a1a1),
            ansi: palette([
                0x073642, 0xdc322f, 0x859900, 0xb58900, 0x268bd2, 0xd33682, 0x2aa198, 0xeee8d5,
                0x002b36, 0xcb4b16, 0x586e75, 0x657b83, 0x839496, 0x6c71c4, 0x93a1a1, 0xfdf6e3,
            ]),
        }
    }

    /// Dracula scheme
    pub fn dracula() -> Self {
        Self {
            name: "dracula".to_string(),
            foreground: Color::from_hex(0xf8f8f2),
            background: Color::from_hex(0x282a36),
            cursor: Color::from_hex(0xf8f8f2),
            selection_background: Color::from_hex(0x44475a),
            selection_foreground: Color::from_hex(0xf8f8f2),
            ansi: palette([
                0x21222c, 0xff5555, 0x50fa7b, 0xf1fa8c, 0xbd93f9, 0xff79c6, 0x8be9fd, 0xf8f8f2,
                0x6272a4, 0xff6e6e, 0x69ff94, 0xffffa5, 0xd6acff, 0xff92df, 0xa4ffff, 0xffffff,
            ]),
        }
    }

    /// Nord scheme
    pub fn nord() -> Self {
        Self {
            name: "nord".to_string(),
            foreground: Color::from_hex(0xd8dee9),
            background: Color::from_hex(0x2e3440),
            cursor: Color::from_hex(0xd8dee9),
            selection_background: Color::from_hex(0x4c566a),
            selection_foreground: Color::from_hex(0xeceff4),
            ansi: palette([
                0x3b4252, 0xbf616a, 0xa3be8c, 0xebcb8b, 0x81a1c1, 0xb48ead, 0x88c0d0, 0xe5e9f0,
                0x4c566a, 0xbf616a, 0xa3be8c, 0xebcb8b, 0x81a1c1, 0xb48ead, 0x8fbcbb, 0xeceff4,
            ]),
        }
    }

    /// Gruvbox Dark scheme
    pub fn gruvbox_dark() -> Self {
        Self {
            name: "gruvbox-dark".to_string(),
            foreground: Color::from_hex(0xebdbb2),
            background: Color::from_hex(0x282828),
            cursor: Color::from_hex(0xebdbb2),
            selection_background: Color::from_hex(0x665c54),
            selection_foreground: Color::from_hex(0xebdbb2),
            ansi: palette([
                0x282828, 0xcc241d, 0x98971a, 0xd79921, 0x458588, 0xb16286, 0x689d6a, 0xa89984,
                0x928374, 0xfb4934, 0xb8bb26, 0xfabd2f, 0x83a598, 0xd3869b, 0x8ec07c, 0xebdbb2,
            ]),
        }
    }

    /// Get scheme by name
    pub fn by_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "solarized-dark" | "solarized_dark" | "solarized" => Self::solarized_dark(),
            "dracula" => Self::dracula(),
            "nord" => Self::nord(),
            "gruvbox-dark" | "gruvbox_dark" | "gruvbox" => Self::gruvbox_dark(),
            _ => Self::tokyo_night(),
        }
    }

    /// List available schemes
    pub fn list() -> Vec<&'static str> {
        vec![
            "tokyo-night",
            "solarized-dark",
            "dracula",
            "nord",
            "gruvbox-dark",
        ]
    }
}

/// Partial theme; unset entries keep the base scheme's color
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemeOverrides {
    pub foreground: Option<Color>,
    pub background: Option<Color>,
    pub cursor: Option<Color>,
    pub selection_background: Option<Color>,
    pub selection_foreground: Option<Color>,
    pub black: Option<Color>,
    pub red: Option<Color>,
    pub green: Option<Color>,
    pub yellow: Option<Color>,
    pub blue: Option<Color>,
    pub magenta: Option<Color>,
    pub cyan: Option<Color>,
    pub white: Option<Color>,
    pub bright_black: Option<Color>,
    pub bright_red: Option<Color>,
    pub bright_green: Option<Color>,
    pub bright_yellow: Option<Color>,
    pub bright_blue: Option<Color>,
    pub bright_magenta: Option<Color>,
    pub bright_cyan: Option<Color>,
    pub bright_white: Option<Color>,
}

impl ThemeOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, mut theme: Theme) -> Theme {
        let pick = |slot: &mut Color, value: Option<Color>| {
            if let Some(color) = value {
                *slot = color;
            }
        };
        pick(&mut theme.foreground, self.foreground);
        pick(&mut theme.background, self.background);
        pick(&mut theme.cursor, self.cursor);
        pick(&mut theme.selection_background, self.selection_background);
        pick(&mut theme.selection_foreground, self.selection_foreground);

        let ansi = [
            self.black,
            self.red,
            self.green,
            self.yellow,
            self.blue,
            self.magenta,
            self.cyan,
            self.white,
            self.bright_black,
            self.bright_red,
            self.bright_green,
            self.bright_yellow,
            self.bright_blue,
            self.bright_magenta,
            self.bright_cyan,
            self.bright_white,
        ];
        for (slot, value) in theme.ansi.iter_mut().zip(ansi) {
            pick(slot, value);
        }
        theme
    }
}

/// Terminal grid size in cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub cols: u32,
    pub rows: u32,
}

impl Size {
    /// Clamped to at least 1x1
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            cols: cols.max(1),
            rows: rows.max(1),
        }
    }
}

impl Default for Size {
    fn default() -> Self {
        Self::new(DEFAULT_COLS, DEFAULT_ROWS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FitMode {
    /// Derive the grid from the host's available space
    Container,
    /// Fixed grid
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderMode {
    #[default]
    Terminal,
    /// Read-only rendering with the cursor hidden
    Static,
}

/// Guest arguments (without argv[0]), static or size-aware
#[derive(Clone)]
pub enum ArgvBuilder {
    Static(Vec<String>),
    /// `{cols}` and `{rows}` are substituted with the grid size
    Template(Vec<String>),
    Custom(Arc<dyn Fn(Size) -> Vec<String> + Send + Sync>),
}

impl ArgvBuilder {
    pub fn build(&self, size: Size) -> Vec<String> {
        match self {
            Self::Static(args) => args.clone(),
            Self::Template(args) => args
                .iter()
                .map(|arg| {
                    arg.replace("{cols}", &size.cols.to_string())
                        .replace("{rows}", &size.rows.to_string())
                })
                .collect(),
            Self::Custom(f) => f(size),
        }
    }
}

impl Default for ArgvBuilder {
    fn default() -> Self {
        Self::Static(Vec::new())
    }
}

impl fmt::Debug for ArgvBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(args) => f.debug_tuple("Static").field(args).finish(),
            Self::Template(args) => f.debug_tuple("Template").field(args).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

// Config files carry argv as a list of strings; placeholders are always honored.
impl<'de> Deserialize<'de> for ArgvBuilder {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let args = Vec::<String>::deserialize(deserializer)?;
        if args.iter().any(|a| a.contains("{cols}") || a.contains("{rows}")) {
            Ok(Self::Template(args))
        } else {
            Ok(Self::Static(args))
        }
    }
}

/// Renderer and engine options for one terminal surface
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalOptions {
    pub font_size: f32,
    pub font_family: String,
    pub convert_eol: bool,
    pub theme: Theme,
    pub engine: String,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Config::default().terminal_options()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TerminalSpec {
    pub font_size: Option<f32>,
    pub font_family: Option<String>,
    pub convert_eol: Option<bool>,
    pub color_scheme: Option<String>,
    pub theme: ThemeOverrides,
    pub engine: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModernSpec {
    pub wasm: String,
    #[serde(default)]
    pub argv: ArgvBuilder,
    pub fit: Option<FitMode>,
    pub size: Option<Size>,
    #[serde(default)]
    pub mode: RenderMode,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub interactive: Option<bool>,
    #[serde(default)]
    pub terminal: TerminalSpec,
}

impl ModernSpec {
    pub fn new(wasm: impl Into<String>) -> Self {
        Self {
            wasm: wasm.into(),
            argv: ArgvBuilder::default(),
            fit: None,
            size: None,
            mode: RenderMode::Terminal,
            env: BTreeMap::new(),
            interactive: None,
            terminal: TerminalSpec::default(),
        }
    }
}

/// Deprecated flat shape
#[derive(Debug, Clone, Deserialize)]
pub struct LegacySpec {
    pub app: String,
    #[serde(default)]
    pub args: ArgvBuilder,
    pub cols: Option<u32>,
    pub rows: Option<u32>,
    pub font_size: Option<f32>,
    pub font_family: Option<String>,
    #[serde(default)]
    pub theme: ThemeOverrides,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub interactive: Option<bool>,
}

/// Preview options as supplied by a host, in either shape
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "api", rename_all = "kebab-case")]
pub enum PreviewSpec {
    Modern(ModernSpec),
    Legacy(LegacySpec),
}

/// Options after shape resolution; nothing downstream looks at the source shape
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub wasm: String,
    pub env: BTreeMap<String, String>,
    pub interactive: bool,
    pub mode: RenderMode,
    pub fit: FitMode,
    pub size: Size,
    pub terminal: TerminalOptions,
    pub argv: ArgvBuilder,
    pub used_legacy: bool,
}

impl ResolvedOptions {
    pub fn show_cursor(&self) -> bool {
        self.mode != RenderMode::Static
    }
}

static WARNED_LEGACY: AtomicBool = AtomicBool::new(false);

fn warn_legacy_once() {
    if !WARNED_LEGACY.swap(true, Ordering::Relaxed) {
        warn!(
            "Legacy preview options (app, args, cols, rows, font_size, font_family, theme) are \
             deprecated; use wasm, argv, fit, size and terminal"
        );
    }
}

impl PreviewSpec {
    /// Resolve against the file config's defaults
    pub fn resolve(self, base: &Config) -> ResolvedOptions {
        match self {
            Self::Modern(spec) => {
                let fit = spec
                    .fit
                    .unwrap_or(if spec.size.is_some() { FitMode::None } else { FitMode::Container });
                let size = spec.size.map_or_else(Size::default, |s| Size::new(s.cols, s.rows));
                let interactive = match spec.mode {
                    RenderMode::Static => false,
                    RenderMode::Terminal => spec.interactive.unwrap_or(true),
                };
                let scheme = spec
                    .terminal
                    .color_scheme
                    .as_deref()
                    .map_or_else(|| base.theme(), Theme::by_name);
                ResolvedOptions {
                    wasm: spec.wasm,
                    env: spec.env,
                    interactive,
                    mode: spec.mode,
                    fit,
                    size,
                    terminal: TerminalOptions {
                        font_size: spec.terminal.font_size.unwrap_or(base.font_size),
                        font_family: spec
                            .terminal
                            .font_family
                            .unwrap_or_else(|| base.font_family.clone()),
                        convert_eol: spec.terminal.convert_eol.unwrap_or(base.convert_eol),
                        theme: spec.terminal.theme.apply(scheme),
                        engine: spec.terminal.engine.unwrap_or_else(|| base.engine.clone()),
                    },
                    argv: spec.argv,
                    used_legacy: false,
                }
            }
            Self::Legacy(spec) => {
                warn_legacy_once();
                let explicit = spec.cols.is_some() || spec.rows.is_some();
                let size = Size::new(
                    spec.cols.unwrap_or(DEFAULT_COLS),
                    spec.rows.unwrap_or(DEFAULT_ROWS),
                );
                ResolvedOptions {
                    wasm: spec.app,
                    env: spec.env,
                    interactive: spec.interactive.unwrap_or(true),
                    mode: RenderMode::Terminal,
                    fit: if explicit { FitMode::None } else { FitMode::Container },
                    size,
                    terminal: TerminalOptions {
                        font_size: spec.font_size.unwrap_or(base.font_size),
                        font_family: spec.font_family.unwrap_or_else(|| base.font_family.clone()),
                        convert_eol: true,
                        theme: spec.theme.apply(base.theme()),
                        engine: base.engine.clone(),
                    },
                    argv: spec.args,
                    used_legacy: true,
                }
            }
        }
    }
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
