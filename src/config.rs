use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use tracing::warn;

use crate::error::Error;
use crate::index::{IndexOptions, IndexOrder};
use crate::source::SourceLocation;

pub use crate::processing::layout::GridShape;

/// How each photo is fitted into its grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleMode {
    CropStart,
    #[default]
    CropCenter,
    CropEnd,
    FitStart,
    FitCenter,
    FitEnd,
    FitFill,
}

impl ScaleMode {
    const ALL: &'static [Self] = &[
        Self::CropStart,
        Self::CropCenter,
        Self::CropEnd,
        Self::FitStart,
        Self::FitCenter,
        Self::FitEnd,
        Self::FitFill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CropStart => "crop-start",
            Self::CropCenter => "crop-center",
            Self::CropEnd => "crop-end",
            Self::FitStart => "fit-start",
            Self::FitCenter => "fit-center",
            Self::FitEnd => "fit-end",
            Self::FitFill => "fit-fill",
        }
    }

    /// Parses `raw`, falling back to the default mode with a warning.
    pub fn resolve(raw: Option<&str>) -> Self {
        match raw.map(str::parse::<Self>) {
            None => Self::default(),
            Some(Ok(mode)) => mode,
            Some(Err(err)) => {
                warn!("{err}; using {}", Self::default());
                Self::default()
            }
        }
    }
}

impl fmt::Display for ScaleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScaleMode {
    type Err = Error;

    /// Accepts kebab-case names as well as the legacy `CROP_CENTER` /
    /// `MATRIX_FILL` spellings.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        let normalized = match normalized.strip_prefix("matrix-") {
            Some(rest) => format!("fit-{rest}"),
            None => normalized,
        };
        Self::ALL
            .iter()
            .copied()
            .find(|mode| mode.as_str() == normalized)
            .ok_or_else(|| Error::ConfigParseFailure {
                field: "scale-mode",
                reason: format!("unknown mode `{raw}`"),
            })
    }
}

/// Colors, font and messages used by the compositor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Appearance {
    pub background: [u8; 3],
    pub text_color: [u8; 3],
    /// Preferred font family; the first usable system font otherwise.
    pub font: Option<String>,
    pub text_size: f32,
    pub placeholder_text: String,
    pub empty_state_text: String,
}

impl Default for Appearance {
    fn default() -> Self {
        Self {
            background: [255, 255, 255],
            text_color: [0, 0, 0],
            font: None,
            text_size: 22.0,
            placeholder_text: "Missing Image".into(),
            empty_state_text: "No images: Set source folder".into(),
        }
    }
}

/// On-disk configuration, as written by the settings editor.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Configuration {
    /// Folder holding the photos: a directory path or `file://` URI.
    pub source_location: Option<String>,
    /// Cells across and down.
    pub grid: GridShape,
    /// Time each batch stays on screen.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// One of `crop-start`, `crop-center`, `crop-end`, `fit-start`,
    /// `fit-center`, `fit-end`, `fit-fill`.
    pub scale_mode: Option<String>,
    pub index_order: IndexOrder,
    /// Optional deterministic seed for `index-order: shuffled`.
    pub shuffle_seed: Option<u64>,
    /// Descend into subfolders when listing the source.
    pub recursive: bool,
    /// Rotate photos according to their EXIF orientation tag.
    pub exif_orientation: bool,
    /// Maximum number of concurrent image decodes within one batch.
    pub max_concurrent_decodes: usize,
    pub appearance: Appearance,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            source_location: None,
            grid: GridShape::default(),
            delay: Self::default_delay(),
            scale_mode: None,
            index_order: IndexOrder::default(),
            shuffle_seed: None,
            recursive: false,
            exif_orientation: true,
            max_concurrent_decodes: Self::default_max_concurrent_decodes(),
            appearance: Appearance::default(),
        }
    }
}

impl Configuration {
    const fn default_delay() -> Duration {
        Duration::from_secs(10)
    }

    const fn default_max_concurrent_decodes() -> usize {
        4
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            self.max_concurrent_decodes > 0,
            "max-concurrent-decodes must be greater than zero"
        );
        ensure!(!self.delay.is_zero(), "delay must be greater than zero");
        ensure!(
            self.appearance.text_size.is_finite() && self.appearance.text_size > 0.0,
            "appearance.text-size must be positive"
        );
        Ok(self)
    }

    /// Resolves the lenient fields into an immutable snapshot.
    ///
    /// Malformed values fall back to defaults and are logged; this never
    /// fails.
    pub fn snapshot(&self) -> GridConfig {
        let source = self
            .source_location
            .as_deref()
            .and_then(|raw| match SourceLocation::parse(raw) {
                Ok(location) => Some(location),
                Err(err) => {
                    warn!("{err}; treating source as unset");
                    None
                }
            });

        let mut shape = self.grid;
        if shape.width == 0 || shape.height == 0 {
            warn!(
                width = shape.width,
                height = shape.height,
                "grid dimensions must be positive; clamping to 1"
            );
            shape = GridShape::new(shape.width.max(1), shape.height.max(1));
        }

        let delay = if self.delay.is_zero() {
            warn!("delay must be positive; using default");
            Self::default_delay()
        } else {
            self.delay
        };

        let mut appearance = self.appearance.clone();
        if !(appearance.text_size.is_finite() && appearance.text_size > 0.0) {
            warn!("appearance.text-size must be positive; using default");
            appearance.text_size = Appearance::default().text_size;
        }

        GridConfig {
            shape,
            scale_mode: ScaleMode::resolve(self.scale_mode.as_deref()),
            delay,
            source,
            index: IndexOptions {
                order: self.index_order,
                shuffle_seed: self.shuffle_seed,
            },
            recursive: self.recursive,
            exif_orientation: self.exif_orientation,
            max_concurrent_decodes: self.max_concurrent_decodes.max(1),
            appearance,
        }
    }
}

/// Immutable configuration for one scheduling cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct GridConfig {
    pub shape: GridShape,
    pub scale_mode: ScaleMode,
    pub delay: Duration,
    pub source: Option<SourceLocation>,
    pub index: IndexOptions,
    pub recursive: bool,
    pub exif_orientation: bool,
    pub max_concurrent_decodes: usize,
    pub appearance: Appearance,
}

impl Default for GridConfig {
    fn default() -> Self {
        Configuration::default().snapshot()
    }
}

/// Structural work needed to move from one snapshot to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadKind {
    None,
    Grow(usize),
    Shrink(usize),
    Full,
}

impl GridConfig {
    pub fn cell_count(&self) -> usize {
        self.shape.cell_count()
    }

    /// Anything that changes which photos the index holds.
    fn requires_rebuild(&self, next: &GridConfig) -> bool {
        self.source != next.source
            || self.recursive != next.recursive
            || self.index != next.index
            || self.exif_orientation != next.exif_orientation
    }

    pub fn reload_kind(&self, next: &GridConfig) -> ReloadKind {
        if self.requires_rebuild(next) {
            return ReloadKind::Full;
        }
        let old = self.cell_count();
        let new = next.cell_count();
        if new > old {
            ReloadKind::Grow(new - old)
        } else if new < old {
            ReloadKind::Shrink(old - new)
        } else {
            ReloadKind::None
        }
    }
}

/// Hands out a fresh configuration snapshot on demand.
pub trait ConfigSource: Send + Sync {
    fn snapshot(&self) -> GridConfig;
}

/// Re-reads a YAML file on every snapshot.
///
/// Unchanged file contents reuse the last resolved snapshot, so fallback
/// warnings are logged once per edit rather than once per cycle.
#[derive(Debug)]
pub struct YamlConfigSource {
    path: PathBuf,
    last_good: Mutex<Option<(String, GridConfig)>>,
}

impl YamlConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_good: Mutex::new(None),
        }
    }

    fn cached(&self, raw: Option<&str>) -> Option<GridConfig> {
        let last_good = self.last_good.lock().unwrap_or_else(PoisonError::into_inner);
        match (last_good.as_ref(), raw) {
            (Some((text, cfg)), Some(raw)) if text == raw => Some(cfg.clone()),
            (Some((_, cfg)), None) => Some(cfg.clone()),
            _ => None,
        }
    }

    fn fallback(&self, err: anyhow::Error) -> GridConfig {
        let failure = Error::ConfigParseFailure {
            field: "configuration",
            reason: format!("{err:#}"),
        };
        warn!("{failure}; keeping previous settings");
        self.cached(None).unwrap_or_default()
    }
}

impl ConfigSource for YamlConfigSource {
    fn snapshot(&self) -> GridConfig {
        let raw = match std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))
        {
            Ok(raw) => raw,
            Err(err) => return self.fallback(err),
        };
        if let Some(cfg) = self.cached(Some(&raw)) {
            return cfg;
        }
        let parsed = serde_yaml::from_str::<Configuration>(&raw)
            .with_context(|| format!("failed to parse {}", self.path.display()));
        match parsed {
            Ok(parsed) => {
                let cfg = parsed.snapshot();
                *self.last_good.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some((raw, cfg.clone()));
                cfg
            }
            Err(err) => self.fallback(err),
        }
    }
}

/// In-process configuration that the embedding host updates directly.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<GridConfig>>,
}

impl SharedConfig {
    pub fn new(cfg: GridConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(cfg)),
        }
    }

    pub fn update(&self, apply: impl FnOnce(&mut GridConfig)) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut guard);
    }
}

impl ConfigSource for SharedConfig {
    fn snapshot(&self) -> GridConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
