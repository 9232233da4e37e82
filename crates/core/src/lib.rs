//! Core domain types for Folio.

mod document;
mod error;
mod progress;

pub use document::{
    Anchor, AnchorPosition, BookFile, ContentUnit, Cover, DocumentFormat, HrefMatch, Location,
    Metadata, OutlineEntry, UnitContent, sniff_image_type,
};
pub use error::DocumentError;
pub use progress::{BookId, MemoryProgressStore, ProgressStore, ReadingProgress};

use serde::{Deserialize, Serialize};

pub const MIN_SCROLL_DEBOUNCE_MS: u64 = 150;
pub const MAX_SCROLL_DEBOUNCE_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub reading_mode: ReadingMode,
    pub manager_mode: ManagerMode,
    pub scroll_debounce_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingMode {
    Paginated,
    Scrolled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerMode {
    Default,
    Continuous,
}

/// The single mode picker exposed to readers; each value selects a
/// `(ReadingMode, ManagerMode)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    Paginated,
    Scrolled,
    Simulation,
    Successive,
}

impl ReadingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingMode::Paginated => "paginated",
            ReadingMode::Scrolled => "scrolled",
        }
    }
}

impl std::fmt::Display for ReadingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReadingMode {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "paginated" => Ok(ReadingMode::Paginated),
            "scrolled" => Ok(ReadingMode::Scrolled),
            _ => Err("unknown reading mode"),
        }
    }
}

impl ManagerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerMode::Default => "default",
            ManagerMode::Continuous => "continuous",
        }
    }
}

impl std::fmt::Display for ManagerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ManagerMode {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(ManagerMode::Default),
            "continuous" => Ok(ManagerMode::Continuous),
            _ => Err("unknown manager mode"),
        }
    }
}

impl ViewMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewMode::Paginated => "paginated",
            ViewMode::Scrolled => "scrolled",
            ViewMode::Simulation => "simulation",
            ViewMode::Successive => "successive",
        }
    }

    pub fn modes(&self) -> (ReadingMode, ManagerMode) {
        match self {
            ViewMode::Paginated => (ReadingMode::Paginated, ManagerMode::Default),
            ViewMode::Scrolled => (ReadingMode::Scrolled, ManagerMode::Default),
            ViewMode::Simulation => (ReadingMode::Paginated, ManagerMode::Continuous),
            ViewMode::Successive => (ReadingMode::Scrolled, ManagerMode::Continuous),
        }
    }

    pub fn from_modes(reading: ReadingMode, manager: ManagerMode) -> Self {
        match (reading, manager) {
            (ReadingMode::Paginated, ManagerMode::Default) => ViewMode::Paginated,
            (ReadingMode::Scrolled, ManagerMode::Default) => ViewMode::Scrolled,
            (ReadingMode::Paginated, ManagerMode::Continuous) => ViewMode::Simulation,
            (ReadingMode::Scrolled, ManagerMode::Continuous) => ViewMode::Successive,
        }
    }
}

impl std::fmt::Display for ViewMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ViewMode {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "paginated" => Ok(ViewMode::Paginated),
            "scrolled" => Ok(ViewMode::Scrolled),
            "simulation" => Ok(ViewMode::Simulation),
            "successive" => Ok(ViewMode::Successive),
            _ => Err("unknown view mode"),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reading_mode: ReadingMode::Paginated,
            manager_mode: ManagerMode::Default,
            scroll_debounce_ms: 200,
        }
    }
}

impl Settings {
    pub fn normalize(&mut self) {
        self.scroll_debounce_ms = self
            .scroll_debounce_ms
            .clamp(MIN_SCROLL_DEBOUNCE_MS, MAX_SCROLL_DEBOUNCE_MS);
    }

    pub fn view_mode(&self) -> ViewMode {
        ViewMode::from_modes(self.reading_mode, self.manager_mode)
    }

    pub fn set_view_mode(&mut self, mode: ViewMode) {
        let (reading, manager) = mode.modes();
        self.reading_mode = reading;
        self.manager_mode = manager;
    }

    pub fn cycle_view_mode(&mut self) {
        let next = match self.view_mode() {
            ViewMode::Paginated => ViewMode::Scrolled,
            ViewMode::Scrolled => ViewMode::Simulation,
            ViewMode::Simulation => ViewMode::Successive,
            ViewMode::Successive => ViewMode::Paginated,
        };
        self.set_view_mode(next);
    }

    pub fn scroll_debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.scroll_debounce_ms
                .clamp(MIN_SCROLL_DEBOUNCE_MS, MAX_SCROLL_DEBOUNCE_MS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_paginated() {
        let settings = Settings::default();
        assert_eq!(settings.reading_mode, ReadingMode::Paginated);
        assert_eq!(settings.manager_mode, ManagerMode::Default);
    }

    #[test]
    fn cycle_view_mode_rotates() {
        let mut settings = Settings::default();
        assert_eq!(settings.view_mode(), ViewMode::Paginated);
        settings.cycle_view_mode();
        assert_eq!(settings.view_mode(), ViewMode::Scrolled);
        settings.cycle_view_mode();
        assert_eq!(settings.view_mode(), ViewMode::Simulation);
        assert_eq!(settings.reading_mode, ReadingMode::Paginated);
        assert_eq!(settings.manager_mode, ManagerMode::Continuous);
        settings.cycle_view_mode();
        assert_eq!(settings.view_mode(), ViewMode::Successive);
        settings.cycle_view_mode();
        assert_eq!(settings.view_mode(), ViewMode::Paginated);
    }

    #[test]
    fn view_mode_parses_strings() {
        assert_eq!(
            "successive".parse::<ViewMode>().unwrap().modes(),
            (ReadingMode::Scrolled, ManagerMode::Continuous)
        );
        assert_eq!(
            " Simulation ".parse::<ViewMode>().unwrap().modes(),
            (ReadingMode::Paginated, ManagerMode::Continuous)
        );
        assert!("flip".parse::<ViewMode>().is_err());
    }

    #[test]
    fn reading_and_manager_modes_parse() {
        assert_eq!(
            "SCROLLED".parse::<ReadingMode>().unwrap(),
            ReadingMode::Scrolled
        );
        assert_eq!(
            "continuous".parse::<ManagerMode>().unwrap(),
            ManagerMode::Continuous
        );
        assert!("nope".parse::<ManagerMode>().is_err());
    }

    #[test]
    fn settings_normalizes_debounce() {
        let mut settings = Settings {
            scroll_debounce_ms: 10,
            ..Settings::default()
        };
        settings.normalize();
        assert_eq!(settings.scroll_debounce_ms, MIN_SCROLL_DEBOUNCE_MS);

        settings.scroll_debounce_ms = 60_000;
        settings.normalize();
        assert_eq!(settings.scroll_debounce_ms, MAX_SCROLL_DEBOUNCE_MS);
    }
}
