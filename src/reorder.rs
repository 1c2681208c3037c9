/// Moves `items[from]` to just before `items[to]`. `to == items.len()` moves it
/// to the end. Returns `None` when the order would not change or an index is
/// out of range, so callers can skip the request entirely.
pub fn reorder_list<T: Clone>(items: &[T], from: usize, to: usize) -> Option<Vec<T>> {
    if from == to || from + 1 == to || from >= items.len() || to > items.len() {
        return None;
    }
    let mut reordered = items.to_vec();
    let moved = reordered.remove(from);
    let insert_at = if to < from { to } else { to - 1 };
    reordered.insert(insert_at, moved);
    Some(reordered)
}

/// Drag-and-drop bookkeeping for a reorderable list, for UIs embedding this
/// crate; the CLI moves items by position instead. Slot `len` is the drop
/// target after the last item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DragReorder {
    dragging: Option<usize>,
    drop_target: Option<usize>,
}

impl DragReorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, index: usize) {
        self.dragging = Some(index);
    }

    pub fn end(&mut self, index: usize) {
        if self.dragging == Some(index) {
            self.dragging = None;
        }
    }

    pub fn enter(&mut self, slot: usize) {
        self.drop_target = Some(slot);
    }

    pub fn leave(&mut self, slot: usize) {
        if self.drop_target == Some(slot) {
            self.drop_target = None;
        }
    }

    /// True while an item is being dragged.
    pub fn accepts(&self) -> bool {
        self.dragging.is_some()
    }

    pub fn is_drop_target(&self, slot: usize) -> bool {
        self.dragging.is_some() && self.drop_target == Some(slot)
    }

    /// Completes a drop on `slot`, returning `(from, to)` for
    /// [`reorder_list`]. Drops outside the active target are ignored.
    pub fn drop_on(&mut self, slot: usize) -> Option<(usize, usize)> {
        let from = self.dragging?;
        if self.drop_target != Some(slot) {
            return None;
        }
        self.dragging = None;
        self.drop_target = None;
        Some((from, slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_item_before_target() {
        let items = ["a", "b", "c", "d"];
        assert_eq!(reorder_list(&items, 3, 1), Some(vec!["a", "d", "b", "c"]));
        assert_eq!(reorder_list(&items, 0, 2), Some(vec!["b", "a", "c", "d"]));
        assert_eq!(reorder_list(&items, 0, 4), Some(vec!["b", "c", "d", "a"]));
    }

    #[test]
    fn no_op_moves_return_none() {
        let items = ["a", "b", "c"];
        assert_eq!(reorder_list(&items, 1, 1), None);
        assert_eq!(reorder_list(&items, 1, 2), None);
        assert_eq!(reorder_list(&items, 2, 3), None);
        assert_eq!(reorder_list(&items, 5, 0), None);
        assert_eq!(reorder_list(&items, 0, 9), None);
    }

    #[test]
    fn drop_requires_active_target() {
        let mut drag = DragReorder::new();
        assert_eq!(drag.drop_on(1), None);

        drag.start(2);
        drag.enter(1);
        drag.leave(1);
        assert!(!drag.is_drop_target(1));
        assert_eq!(drag.drop_on(1), None);

        drag.enter(0);
        assert!(drag.is_drop_target(0));
        assert_eq!(drag.drop_on(0), Some((2, 0)));
        assert!(!drag.accepts());
    }

    #[test]
    fn end_only_clears_matching_drag() {
        let mut drag = DragReorder::new();
        drag.start(1);
        drag.end(0);
        assert!(drag.accepts());
        drag.end(1);
        assert!(!drag.accepts());
    }
}
