// ========================================================================================
//                           Nearest-neighbour lookup on a sorted axis
// ========================================================================================

/// Coordinates paired with values, sorted by coordinate, answering "what is the last
/// item at or before this position" and "what is the first item at or after it".
#[derive(Debug, Clone)]
pub struct BisectFinder<T> {
    items: Vec<(u32, T)>,
}

impl<T> BisectFinder<T> {
    /// Sorts `items` by coordinate. Items sharing a coordinate keep their input order.
    pub fn new(mut items: Vec<(u32, T)>) -> Self {
        items.sort_by_key(|(coord, _)| *coord);
        Self { items }
    }

    /// The item with the largest coordinate `<= pos`. Among equal coordinates the one
    /// inserted last wins.
    pub fn item_before(&self, pos: u32) -> Option<&(u32, T)> {
        let idx = self.items.partition_point(|(coord, _)| *coord <= pos);
        idx.checked_sub(1).map(|i| &self.items[i])
    }

    /// The item with the smallest coordinate `>= pos`. Among equal coordinates the one
    /// inserted first wins.
    pub fn item_after(&self, pos: u32) -> Option<&(u32, T)> {
        let idx = self.items.partition_point(|(coord, _)| *coord < pos);
        self.items.get(idx)
    }
}
