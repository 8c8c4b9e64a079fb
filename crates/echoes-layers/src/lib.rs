//! Echoes Layers
//!
//! The static layer table and the count-based placement engine.
//!
//! # Placement
//!
//! Every message in an epoch lands at a `(layer, room)` position that is a
//! pure function of two counters observed at insertion time:
//!
//! - the epoch's total message count selects the **layer** whose
//!   `[min, max)` range contains it (the last layer is unbounded)
//! - the layer's own message count selects the **room**:
//!   `floor(in_layer / room_capacity) mod room_count`
//!
//! Placement is non-retroactive. Later insertions never move earlier
//! messages, and rooms wrap back to 0 once `room_capacity × room_count`
//! messages have landed in a layer.
//!
//! ```
//! use echoes_layers::{LayerIndex, LayerTable, RoomIndex};
//!
//! let table = LayerTable::standard();
//! assert_eq!(table.layer_for(0).index, LayerIndex(1));
//! assert_eq!(table.layer_for(100).index, LayerIndex(2));
//! assert_eq!(table.room_for(100, LayerIndex(1)), Some(RoomIndex(0)));
//! ```

mod placement;
mod table;

pub use placement::{LayerIndex, Placement, RoomIndex};
pub use table::{LayerDefinition, LayerError, LayerTable};

/// Epoch closure threshold used when nothing else is configured.
pub const DEFAULT_BABEL_THRESHOLD: u64 = 1_024_808;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_lands_in_final_layer() {
        let table = LayerTable::standard();
        let last = table.last();
        assert_eq!(table.layer_for(DEFAULT_BABEL_THRESHOLD).index, last.index);
        assert!(last.max_count.is_none());
    }
}
