//! Configuration system for Oguri
//!
//! Loads output configuration from `~/.config/oguri/config`. The same
//! line-oriented grammar is used for payloads arriving on the control socket:
//!
//! ```text
//! # comment
//! [output DP-1]
//! image=~/wallpapers/rain.gif
//! scaling-mode=fill
//! anchor=top-left
//! filter=best
//! ```
//!
//! A section named `*` applies to every output without an exact match.

use bitflags::bitflags;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

/// Section name matching any output
pub const WILDCARD: &str = "*";

/// How an image is fitted onto an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalingMode {
    /// Cover the output, clipping the image on one axis
    #[default]
    Fill,
    /// Scale each axis independently to the output size
    Stretch,
    /// Repeat the image at its native size
    Tile,
}

impl FromStr for ScalingMode {
    type Err = ErrorKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "fill" => Ok(Self::Fill),
            "stretch" => Ok(Self::Stretch),
            "tile" => Ok(Self::Tile),
            _ => Err(ErrorKind::UnknownScalingMode(value.to_string())),
        }
    }
}

bitflags! {
    /// Sides the image sticks to when it is clipped. Empty means centred.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Anchor: u8 {
        const TOP = 1 << 0;
        const BOTTOM = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
    }
}

impl FromStr for Anchor {
    type Err = ErrorKind;

    /// Parse dash-joined anchor points, e.g. `top-left` or `center`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut anchor = Anchor::empty();
        for point in value.split('-').filter(|p| !p.is_empty()) {
            let (flag, opposite, conflict) = match point {
                "top" => (Anchor::TOP, Anchor::BOTTOM, "Top and bottom"),
                "bottom" => (Anchor::BOTTOM, Anchor::TOP, "Top and bottom"),
                "left" => (Anchor::LEFT, Anchor::RIGHT, "Left and right"),
                "right" => (Anchor::RIGHT, Anchor::LEFT, "Left and right"),
                "center" => continue,
                _ => return Err(ErrorKind::InvalidAnchor(point.to_string())),
            };
            if anchor.contains(opposite) {
                return Err(ErrorKind::ConflictingAnchor(conflict));
            }
            anchor |= flag;
        }
        Ok(anchor)
    }
}

/// Sampling quality used when scaling the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter {
    Fast,
    Good,
    #[default]
    Best,
    Nearest,
    Bilinear,
}

impl FromStr for Filter {
    type Err = ErrorKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "fast" => Ok(Self::Fast),
            "good" => Ok(Self::Good),
            "best" => Ok(Self::Best),
            "nearest" => Ok(Self::Nearest),
            "bilinear" => Ok(Self::Bilinear),
            _ => Err(ErrorKind::UnknownFilter(value.to_string())),
        }
    }
}

/// Configuration for one output name (or the wildcard)
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    pub name: String,
    pub image: Option<PathBuf>,
    pub scaling_mode: ScalingMode,
    pub anchor: Anchor,
    pub filter: Filter,
}

impl OutputConfig {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            image: None,
            scaling_mode: ScalingMode::default(),
            anchor: Anchor::default(),
            filter: Filter::default(),
        }
    }

    /// Set a single `key=value` property
    fn set(&mut self, key: &str, value: &str) -> Result<(), ErrorKind> {
        match key {
            "image" => self.image = Some(resolve_image(value)?),
            "scaling-mode" => self.scaling_mode = value.parse()?,
            "anchor" => self.anchor = value.parse()?,
            "filter" => self.filter = value.parse()?,
            _ => return Err(ErrorKind::UnknownProperty(key.to_string())),
        }
        Ok(())
    }
}

/// Output configurations in the order they were first declared.
/// Holds at most one entry per name.
#[derive(Debug, Clone, Default)]
pub struct OutputConfigs {
    entries: Vec<OutputConfig>,
}

impl OutputConfigs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut configs = Self::new();
        configs.apply_file(path)?;
        Ok(configs)
    }

    /// Apply the contents of a file on top of the current configuration
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let source_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        self.apply(&content, &source_name)?;
        info!("Configuration loaded from {:?}", path);
        Ok(())
    }

    /// Apply configuration text line by line.
    ///
    /// Stops at the first invalid line; lines before it remain applied.
    pub fn apply(&mut self, text: &str, source: &str) -> Result<(), ConfigError> {
        let mut section: Option<String> = None;

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            let fail = |kind| ConfigError::Parse {
                origin: source.to_string(),
                line: index + 1,
                kind,
            };

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(header) = line.strip_prefix('[') {
                section = Some(parse_section(header).map_err(fail)?);
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(fail(ErrorKind::ExpectedKeyValue));
            };
            let key = key.trim();

            let Some(name) = section.as_deref() else {
                return Err(fail(ErrorKind::OutsideSection(key.to_string())));
            };

            self.entry(name).set(key, value.trim()).map_err(fail)?;
            debug!("{}: [{}] {}={}", source, name, key, value.trim());
        }

        Ok(())
    }

    /// Get the entry for a name, creating it with defaults if missing
    fn entry(&mut self, name: &str) -> &mut OutputConfig {
        match self.entries.iter().position(|c| c.name == name) {
            Some(index) => &mut self.entries[index],
            None => {
                self.entries.push(OutputConfig::new(name));
                let last = self.entries.len() - 1;
                &mut self.entries[last]
            }
        }
    }

    /// Find the configuration for an output: exact name first, then wildcard
    pub fn resolve(&self, output_name: &str) -> Option<&OutputConfig> {
        self.entries
            .iter()
            .find(|c| c.name == output_name)
            .or_else(|| self.entries.iter().find(|c| c.name == WILDCARD))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse the inside of a `[output NAME]` header (after the opening bracket)
fn parse_section(header: &str) -> Result<String, ErrorKind> {
    let Some(inner) = header.strip_suffix(']') else {
        return Err(ErrorKind::MissingBracket);
    };

    let inner = inner.trim();
    let (kind, name) = match inner.split_once(char::is_whitespace) {
        Some((kind, name)) => (kind, name.trim()),
        None => (inner, ""),
    };

    if kind != "output" {
        return Err(ErrorKind::InvalidSection(kind.to_string()));
    }
    if name.is_empty() {
        return Err(ErrorKind::MissingName(kind.to_string()));
    }
    Ok(name.to_string())
}

/// Turn an `image=` value into a path, expanding a leading `~/`
fn resolve_image(value: &str) -> Result<PathBuf, ErrorKind> {
    if value.is_empty() {
        return Err(ErrorKind::UnresolvableImage(value.to_string()));
    }
    expand_home(value).ok_or_else(|| ErrorKind::UnresolvableImage(value.to_string()))
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &str) -> Option<PathBuf> {
    match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            let home = dirs::home_dir()?;
            Some(home.join(rest.trim_start_matches('/')))
        }
        _ => Some(PathBuf::from(path)),
    }
}

/// Get the default path of the config file
pub fn default_path() -> Option<PathBuf> {
    Some(dirs::config_dir()?.join("oguri").join("config"))
}

/// Reasons a single configuration line is rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("Invalid section type: '{0}'")]
    InvalidSection(String),

    #[error("Must specify name for {0}")]
    MissingName(String),

    #[error("No closing bracket found")]
    MissingBracket,

    #[error("Expected key=value")]
    ExpectedKeyValue,

    #[error("Property '{0}' is not inside a section")]
    OutsideSection(String),

    #[error("Invalid output property: '{0}'")]
    UnknownProperty(String),

    #[error("Unknown scaling mode: '{0}'")]
    UnknownScalingMode(String),

    #[error("Unknown filter: '{0}'")]
    UnknownFilter(String),

    #[error("Invalid anchor point: '{0}'")]
    InvalidAnchor(String),

    #[error("{0} anchors are mutually exclusive")]
    ConflictingAnchor(&'static str),

    #[error("Unresolvable image reference: '{0}'")]
    UnresolvableImage(String),
}

/// Errors from loading or applying configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[{origin}:{line}] {kind}")]
    Parse {
        origin: String,
        line: usize,
        kind: ErrorKind,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_section() {
        let mut configs = OutputConfigs::new();
        configs
            .apply(
                "# wallpapers\n\n[output *]\nimage=a.png\nscaling-mode=fill\nanchor=top-left\nfilter=nearest\n",
                "config",
            )
            .unwrap();

        let config = configs.resolve("HDMI-A-1").unwrap();
        assert_eq!(config.name, "*");
        assert_eq!(config.image, Some(PathBuf::from("a.png")));
        assert_eq!(config.scaling_mode, ScalingMode::Fill);
        assert_eq!(config.anchor, Anchor::TOP | Anchor::LEFT);
        assert_eq!(config.filter, Filter::Nearest);
    }

    #[test]
    fn test_resolution_prefers_exact_name() {
        let mut configs = OutputConfigs::new();
        configs
            .apply("[output *]\nimage=any.png\n[output DP-1]\nimage=dp.png\n", "config")
            .unwrap();

        assert_eq!(configs.resolve("DP-1").unwrap().name, "DP-1");
        assert_eq!(configs.resolve("HDMI-1").unwrap().name, "*");

        let mut exact_only = OutputConfigs::new();
        exact_only.apply("[output DP-1]\nimage=dp.png\n", "config").unwrap();
        assert!(exact_only.resolve("HDMI-1").is_none());
    }

    #[test]
    fn test_repeated_section_updates_entry() {
        let mut configs = OutputConfigs::new();
        configs.apply("[output DP-1]\nimage=a.png\n", "config").unwrap();
        configs.apply("[output DP-1]\nscaling-mode=tile\n", "ipc").unwrap();

        assert_eq!(configs.len(), 1);
        let config = configs.resolve("DP-1").unwrap();
        assert_eq!(config.image, Some(PathBuf::from("a.png")));
        assert_eq!(config.scaling_mode, ScalingMode::Tile);
    }

    #[test]
    fn test_anchor_parsing() {
        assert_eq!("center".parse::<Anchor>(), Ok(Anchor::empty()));
        assert_eq!("bottom-right".parse::<Anchor>(), Ok(Anchor::BOTTOM | Anchor::RIGHT));
        assert_eq!("left-center".parse::<Anchor>(), Ok(Anchor::LEFT));
        assert_eq!(
            "top-bottom".parse::<Anchor>(),
            Err(ErrorKind::ConflictingAnchor("Top and bottom"))
        );
        assert_eq!(
            "right-left".parse::<Anchor>(),
            Err(ErrorKind::ConflictingAnchor("Left and right"))
        );
        assert_eq!(
            "middle".parse::<Anchor>(),
            Err(ErrorKind::InvalidAnchor("middle".into()))
        );
    }

    #[test]
    fn test_error_stops_at_line_and_keeps_earlier_lines() {
        let mut configs = OutputConfigs::new();
        let err = configs
            .apply("[output DP-1]\nimage=a.png\nscaling-mode=zoom\nanchor=top\n", "ipc")
            .unwrap_err();

        assert_eq!(err.to_string(), "[ipc:3] Unknown scaling mode: 'zoom'");
        let config = configs.resolve("DP-1").unwrap();
        assert_eq!(config.image, Some(PathBuf::from("a.png")));
        assert_eq!(config.anchor, Anchor::empty());
    }

    #[test]
    fn test_syntax_errors() {
        let cases = [
            ("image=a.png\n", "[t:1] Property 'image' is not inside a section"),
            ("[image a]\n", "[t:1] Invalid section type: 'image'"),
            ("[output]\n", "[t:1] Must specify name for output"),
            ("[output DP-1\n", "[t:1] No closing bracket found"),
            ("[output DP-1]\njunk\n", "[t:2] Expected key=value"),
            ("[output DP-1]\ncolour=red\n", "[t:2] Invalid output property: 'colour'"),
            ("[output DP-1]\nimage=\n", "[t:2] Unresolvable image reference: ''"),
            ("[output DP-1]\nfilter=sharp\n", "[t:2] Unknown filter: 'sharp'"),
        ];

        for (text, expected) in cases {
            let err = OutputConfigs::new().apply(text, "t").unwrap_err();
            assert_eq!(err.to_string(), expected, "input: {text:?}");
        }
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/a.png"), Some(PathBuf::from("/abs/a.png")));
        assert_eq!(expand_home("~user/a.png"), Some(PathBuf::from("~user/a.png")));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/a.png"), Some(home.join("a.png")));
        }
    }
}
