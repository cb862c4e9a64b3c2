//! Runtime knobs for diagnostics output.
//!
//! Everything here is read once from the environment by
//! [`Config::from_env()`]; programs embedding a [`Tracker`](crate::Tracker)
//! directly can build a [`Config`] by hand instead.
//!
//! | variable              | effect                                        |
//! |-----------------------|-----------------------------------------------|
//! | `HEAPGUARD_PREFIX`    | prefix for every top-level diagnostic line    |
//! | `HEAPGUARD_COLOR`     | `always`, `never` or `auto` (default)         |
//! | `NO_COLOR`            | any value disables color under `auto`         |
//! | `HEAPGUARD_EXIT_CODE` | exit status used when misuse is fatal         |

use std::{
    borrow::Cow,
    env,
    io::{self, IsTerminal},
};

pub const DEFAULT_PREFIX: &str = "heapguard: ";
pub const DEFAULT_EXIT_CODE: i32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorChoice {
    Always,
    Never,
    /// Color only when stdout is a terminal and `NO_COLOR` is unset.
    Auto,
}

impl ColorChoice {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "always" | "1" | "true" => Some(Self::Always),
            "never" | "0" | "false" => Some(Self::Never),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub prefix: Cow<'static, str>,
    pub color: ColorChoice,
    pub exit_code: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: Cow::Borrowed(DEFAULT_PREFIX),
            color: ColorChoice::Auto,
            exit_code: DEFAULT_EXIT_CODE,
        }
    }
}

impl Config {
    /// Plain output with no escape codes, handy for tests and log files.
    pub fn plain() -> Self {
        Self {
            color: ColorChoice::Never,
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to
    /// defaults with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(prefix) = lookup("HEAPGUARD_PREFIX") {
            config.prefix = Cow::Owned(prefix);
        }
        if let Some(color) = lookup("HEAPGUARD_COLOR") {
            match ColorChoice::parse(&color) {
                Some(choice) => config.color = choice,
                None => log::warn!("ignoring HEAPGUARD_COLOR={color:?}"),
            }
        }
        if config.color == ColorChoice::Auto && lookup("NO_COLOR").is_some() {
            config.color = ColorChoice::Never;
        }
        if let Some(code) = lookup("HEAPGUARD_EXIT_CODE") {
            match code.trim().parse() {
                Ok(code) => config.exit_code = code,
                Err(_) => log::warn!("ignoring HEAPGUARD_EXIT_CODE={code:?}"),
            }
        }
        config
    }

    /// Whether output to a destination should carry ANSI highlighting.
    /// `terminal` says whether that destination is a terminal; only
    /// [`ColorChoice::Auto`] looks at it.
    pub fn color_for(&self, terminal: bool) -> bool {
        match self.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => terminal,
        }
    }

    /// [`color_for()`](Self::color_for) applied to the process's stdout.
    pub fn color_for_stdout(&self) -> bool {
        self.color_for(io::stdout().is_terminal())
    }
}

/// Install `env_logger` with a `warn` default filter (override with
/// `RUST_LOG`). Safe to call more than once.
pub fn init_logger() {
    let env = env_logger::Env::default().default_filter_or("warn");
    // A second call finds the logger already set, which is fine.
    let _ = env_logger::Builder::from_env(env).try_init();
}
