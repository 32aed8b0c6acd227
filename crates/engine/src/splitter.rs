//! Walk-forward window generation.
//!
//! Splits a series of `n` bars into consecutive (train, test) index ranges.
//! Rolling mode slides both ranges by `step`; anchored mode keeps the train
//! range pinned at bar 0 and grows it by `step` each window. A trailing pair
//! that would not fit is dropped, never truncated.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::OptimizerError;

/// Configuration for walk-forward windows, in bars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// In-sample (train) length
    pub train_len: usize,
    /// Out-of-sample (test) length
    pub test_len: usize,
    /// Distance between the starts of consecutive windows
    pub step: usize,
    /// Expanding train window starting at bar 0
    pub anchored: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            train_len: 200,
            test_len: 50,
            step: 50,
            anchored: false,
        }
    }
}

impl WindowConfig {
    /// Bars needed for one full train/test pair. Saturates on lengths
    /// `WindowSplitter::new` would reject.
    pub fn required_bars(&self) -> usize {
        self.train_len.saturating_add(self.test_len)
    }
}

/// A single in-sample/out-of-sample split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPair {
    /// Window number (0-indexed)
    pub index: usize,
    pub train: Range<usize>,
    pub test: Range<usize>,
}

impl WindowPair {
    pub fn train_len(&self) -> usize {
        self.train.len()
    }

    pub fn test_len(&self) -> usize {
        self.test.len()
    }
}

/// Generator for walk-forward windows.
#[derive(Debug, Clone)]
pub struct WindowSplitter {
    config: WindowConfig,
}

impl WindowSplitter {
    pub fn new(config: WindowConfig) -> Result<Self, OptimizerError> {
        if config.train_len == 0 || config.test_len == 0 {
            return Err(OptimizerError::InvalidConfig(
                "train_len and test_len must be positive".to_string(),
            ));
        }
        if config.step == 0 {
            return Err(OptimizerError::InvalidConfig(
                "step must be positive".to_string(),
            ));
        }
        if config.train_len.checked_add(config.test_len).is_none() {
            return Err(OptimizerError::InvalidConfig(format!(
                "train_len {} + test_len {} overflows",
                config.train_len, config.test_len
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Number of full window pairs a series of `series_len` bars yields.
    pub fn count(&self, series_len: usize) -> usize {
        let required = self.config.required_bars();
        if series_len < required {
            return 0;
        }
        (series_len - required) / self.config.step + 1
    }

    /// Lazily iterate every full window pair of a series.
    pub fn split(&self, series_len: usize) -> Result<WindowIter, OptimizerError> {
        let required = self.config.required_bars();
        if series_len < required {
            return Err(OptimizerError::InsufficientData {
                required,
                available: series_len,
            });
        }
        Ok(WindowIter {
            config: self.config.clone(),
            next_index: 0,
            total: self.count(series_len),
        })
    }
}

/// Iterator over window pairs. Cloning it restarts from the clone point.
#[derive(Debug, Clone)]
pub struct WindowIter {
    config: WindowConfig,
    next_index: usize,
    total: usize,
}

impl WindowIter {
    fn window_at(&self, index: usize) -> WindowPair {
        let offset = index * self.config.step;
        let train = if self.config.anchored {
            0..self.config.train_len + offset
        } else {
            offset..offset + self.config.train_len
        };
        let test = train.end..train.end + self.config.test_len;
        WindowPair { index, train, test }
    }
}

impl Iterator for WindowIter {
    type Item = WindowPair;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.total {
            return None;
        }
        let window = self.window_at(self.next_index);
        self.next_index += 1;
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next_index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for WindowIter {}

impl std::iter::FusedIterator for WindowIter {}
