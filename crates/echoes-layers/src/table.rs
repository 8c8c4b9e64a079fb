//! Layer definitions and the validated layer table.

use crate::placement::{LayerIndex, RoomIndex};
use thiserror::Error;

/// Errors from building a [`LayerTable`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerError {
    /// No layers were supplied.
    #[error("layer table is empty")]
    Empty,

    /// The first layer must start at message 0.
    #[error("first layer starts at {0}, expected 0")]
    NonZeroStart(u64),

    /// Layer indices must run 1, 2, 3, ... in order.
    #[error("layer at position {position} has index {found}, expected {expected}")]
    IndexOutOfOrder {
        position: usize,
        expected: u32,
        found: u32,
    },

    /// A layer's range does not start where the previous one ended.
    #[error("layer {index} starts at {found}, expected {expected}")]
    Gap {
        index: u32,
        expected: u64,
        found: u64,
    },

    /// A bounded layer with `max <= min`.
    #[error("layer {index} has an empty range [{min}, {max})")]
    EmptyRange { index: u32, min: u64, max: u64 },

    /// Only the final layer may be unbounded, and it must be.
    #[error("layer {index}: only the final layer may be unbounded")]
    Unbounded { index: u32 },

    /// The final layer has a finite upper bound.
    #[error("final layer {index} must be unbounded")]
    BoundedTail { index: u32 },

    /// `room_count` or `room_capacity` is zero.
    #[error("layer {index} needs at least one room of capacity at least one")]
    NoRooms { index: u32 },
}

/// One band of the layer table.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct LayerDefinition {
    /// 1-based layer index
    pub index: LayerIndex,

    /// Display name
    pub name: String,

    /// First epoch message count that falls in this layer (inclusive)
    pub min_count: u64,

    /// End of the range (exclusive); `None` for the final, unbounded layer
    pub max_count: Option<u64>,

    /// Number of rooms in this layer
    pub room_count: u32,

    /// Messages per room before moving on to the next room
    pub room_capacity: u32,
}

impl LayerDefinition {
    /// Create a layer definition.
    pub fn new(
        index: u32,
        name: impl Into<String>,
        min_count: u64,
        max_count: Option<u64>,
        room_count: u32,
        room_capacity: u32,
    ) -> Self {
        Self {
            index: LayerIndex(index),
            name: name.into(),
            min_count,
            max_count,
            room_count,
            room_capacity,
        }
    }

    /// Whether `total` falls inside `[min_count, max_count)`.
    #[inline]
    pub fn contains(&self, total: u64) -> bool {
        total >= self.min_count && self.max_count.map_or(true, |max| total < max)
    }

    /// Room for the next message, given how many messages the layer already holds.
    #[inline]
    pub fn room_for(&self, messages_in_layer: u64) -> RoomIndex {
        let slot = messages_in_layer / u64::from(self.room_capacity.max(1));
        RoomIndex((slot % u64::from(self.room_count.max(1))) as u32)
    }

    /// Messages that fit before room indices wrap back to 0.
    #[inline]
    pub fn cycle_len(&self) -> u64 {
        u64::from(self.room_capacity) * u64::from(self.room_count)
    }

    /// Progress through this layer's range as a percentage in `[0, 100]`.
    ///
    /// The unbounded layer always reports 0.
    pub fn progress_percent(&self, total: u64) -> f64 {
        match self.max_count {
            Some(max) => {
                let span = (max - self.min_count) as f64;
                let done = total.saturating_sub(self.min_count) as f64;
                (done / span * 100.0).clamp(0.0, 100.0)
            }
            None => 0.0,
        }
    }
}

/// Validated, ordered layer table covering `[0, ∞)`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(try_from = "Vec<LayerDefinition>", into = "Vec<LayerDefinition>")
)]
pub struct LayerTable {
    layers: Vec<LayerDefinition>,
}

impl LayerTable {
    /// Build a table, checking that ranges are contiguous and cover `[0, ∞)`.
    pub fn new(layers: Vec<LayerDefinition>) -> Result<Self, LayerError> {
        let first = layers.first().ok_or(LayerError::Empty)?;
        if first.min_count != 0 {
            return Err(LayerError::NonZeroStart(first.min_count));
        }

        let last_pos = layers.len() - 1;
        let mut expected_min = 0u64;
        for (position, layer) in layers.iter().enumerate() {
            let expected_index = position as u32 + 1;
            if layer.index.0 != expected_index {
                return Err(LayerError::IndexOutOfOrder {
                    position,
                    expected: expected_index,
                    found: layer.index.0,
                });
            }
            if layer.min_count != expected_min {
                return Err(LayerError::Gap {
                    index: layer.index.0,
                    expected: expected_min,
                    found: layer.min_count,
                });
            }
            if layer.room_count == 0 || layer.room_capacity == 0 {
                return Err(LayerError::NoRooms { index: layer.index.0 });
            }
            match (layer.max_count, position == last_pos) {
                (Some(max), false) => {
                    if max <= layer.min_count {
                        return Err(LayerError::EmptyRange {
                            index: layer.index.0,
                            min: layer.min_count,
                            max,
                        });
                    }
                    expected_min = max;
                }
                (None, false) => return Err(LayerError::Unbounded { index: layer.index.0 }),
                (Some(_), true) => return Err(LayerError::BoundedTail { index: layer.index.0 }),
                (None, true) => {}
            }
        }

        Ok(Self { layers })
    }

    /// The nine-layer table the library ships with.
    pub fn standard() -> Self {
        Self {
            layers: vec![
                LayerDefinition::new(1, "Void", 0, Some(100), 10, 10),
                LayerDefinition::new(2, "Whisper", 100, Some(500), 10, 40),
                LayerDefinition::new(3, "Glitch", 500, Some(1_000), 10, 50),
                LayerDefinition::new(4, "Wave", 1_000, Some(2_000), 20, 50),
                LayerDefinition::new(5, "Neon", 2_000, Some(4_000), 25, 80),
                LayerDefinition::new(6, "Ambient", 4_000, Some(8_000), 40, 100),
                LayerDefinition::new(7, "Chaos", 8_000, Some(50_000), 100, 420),
                LayerDefinition::new(8, "Burst", 50_000, Some(100_000), 200, 250),
                LayerDefinition::new(9, "Babel", 100_000, None, 1_024, 1_000),
            ],
        }
    }

    /// All layers in ascending order.
    pub fn layers(&self) -> &[LayerDefinition] {
        &self.layers
    }

    /// Look up a layer by index.
    pub fn get(&self, index: LayerIndex) -> Option<&LayerDefinition> {
        // Indices are validated to be 1..=len in order.
        index
            .0
            .checked_sub(1)
            .and_then(|pos| self.layers.get(pos as usize))
    }

    /// The first layer.
    pub fn first(&self) -> &LayerDefinition {
        &self.layers[0]
    }

    /// The final, unbounded layer.
    pub fn last(&self) -> &LayerDefinition {
        &self.layers[self.layers.len() - 1]
    }

    /// Layer whose range contains `total`; the final layer if none does.
    pub fn layer_for(&self, total: u64) -> &LayerDefinition {
        self.layers
            .iter()
            .find(|layer| layer.contains(total))
            .unwrap_or_else(|| self.last())
    }

    /// Room for the next message in `layer`, or `None` for an unknown layer.
    pub fn room_for(&self, messages_in_layer: u64, layer: LayerIndex) -> Option<RoomIndex> {
        self.get(layer).map(|def| def.room_for(messages_in_layer))
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Always false for a validated table.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Default for LayerTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl TryFrom<Vec<LayerDefinition>> for LayerTable {
    type Error = LayerError;

    fn try_from(layers: Vec<LayerDefinition>) -> Result<Self, Self::Error> {
        Self::new(layers)
    }
}

impl From<LayerTable> for Vec<LayerDefinition> {
    fn from(table: LayerTable) -> Self {
        table.layers
    }
}
