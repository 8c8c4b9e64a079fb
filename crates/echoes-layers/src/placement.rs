//! Count-based placement of messages into layers and rooms.

use crate::table::LayerTable;
use std::fmt;

/// 1-based layer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct LayerIndex(pub u32);

/// 0-based room index within a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct RoomIndex(pub u32);

impl fmt::Display for LayerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RoomIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a message lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Placement {
    pub layer: LayerIndex,
    pub room: RoomIndex,
}

impl LayerTable {
    /// Place the next message of an epoch.
    ///
    /// `total` is the epoch's message count before this message and
    /// `in_layer` reports how many messages the chosen layer already holds.
    /// Both must be read from the same consistent snapshot for placement to
    /// be exact.
    pub fn place<F>(&self, total: u64, in_layer: F) -> Placement
    where
        F: FnOnce(LayerIndex) -> u64,
    {
        let layer = self.layer_for(total);
        let room = layer.room_for(in_layer(layer.index));
        Placement {
            layer: layer.index,
            room,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LayerDefinition;
    use proptest::prelude::*;
    use std::collections::HashMap;

    /// Replay `n` sequential insertions, tracking per-layer counts.
    fn replay(table: &LayerTable, n: u64) -> Vec<Placement> {
        let mut per_layer: HashMap<LayerIndex, u64> = HashMap::new();
        (0..n)
            .map(|total| {
                let placement =
                    table.place(total, |layer| per_layer.get(&layer).copied().unwrap_or(0));
                *per_layer.entry(placement.layer).or_default() += 1;
                placement
            })
            .collect()
    }

    #[test]
    fn first_message_is_layer_one_room_zero() {
        let table = LayerTable::standard();
        let placement = table.place(0, |_| 0);
        assert_eq!(placement.layer, LayerIndex(1));
        assert_eq!(placement.room, RoomIndex(0));
    }

    #[test]
    fn sequential_fill_of_first_layer() {
        let table = LayerTable::standard();
        let placements = replay(&table, 120);

        // 10 rooms × 10 messages in layer 1
        for (i, p) in placements.iter().take(100).enumerate() {
            assert_eq!(p.layer, LayerIndex(1));
            assert_eq!(p.room, RoomIndex((i / 10) as u32));
        }
        // layer 2 starts over at room 0
        assert_eq!(placements[100].layer, LayerIndex(2));
        assert_eq!(placements[100].room, RoomIndex(0));
    }

    #[test]
    fn small_table_wraps_rooms() {
        let table = LayerTable::new(vec![
            LayerDefinition::new(1, "a", 0, Some(3), 1, 1),
            LayerDefinition::new(2, "b", 3, None, 2, 2),
        ])
        .unwrap();
        let rooms: Vec<u32> = replay(&table, 12).iter().skip(3).map(|p| p.room.0).collect();
        assert_eq!(rooms, vec![0, 0, 1, 1, 0, 0, 1, 1, 0]);
    }

    proptest! {
        #[test]
        fn layers_never_decrease(n in 1u64..3_000) {
            let table = LayerTable::standard();
            let placements = replay(&table, n);
            for pair in placements.windows(2) {
                prop_assert!(pair[0].layer <= pair[1].layer);
            }
        }

        #[test]
        fn layer_for_is_monotonic(a in any::<u64>(), b in any::<u64>()) {
            let table = LayerTable::standard();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(table.layer_for(lo).index <= table.layer_for(hi).index);
        }

        #[test]
        fn rooms_are_periodic(k in 0u64..1_000_000, layer in 1u32..=9) {
            let table = LayerTable::standard();
            let def = table.get(LayerIndex(layer)).unwrap();
            prop_assert_eq!(def.room_for(k), def.room_for(k + def.cycle_len()));
            prop_assert!(def.room_for(k).0 < def.room_count);
        }
    }
}
