use std::collections::HashMap;

use crate::api::WeekPage;
use crate::types::{ShiftRow, WeekIndex};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursors {
    pub next: Option<WeekIndex>,
    pub prev: Option<WeekIndex>,
}

impl Cursors {
    pub fn toward(self, forward: bool) -> Option<WeekIndex> {
        if forward { self.next } else { self.prev }
    }
}

/// Pages fetched during this session, keyed by week. Cursors are recorded the
/// first time a week is fetched and are not replaced afterwards. Rows are
/// replaced whenever the week is fetched again, and a stale page keeps its
/// cursors but must be refetched before its rows are shown.
#[derive(Debug, Default)]
pub struct PageCache {
    pages: HashMap<WeekIndex, CachedPage>,
}

#[derive(Debug, Clone)]
struct CachedPage {
    rows: Vec<ShiftRow>,
    cursors: Cursors,
    stale: bool,
}

impl PageCache {
    pub fn cursors(&self, index: WeekIndex) -> Option<Cursors> {
        self.pages.get(&index).map(|page| page.cursors)
    }

    pub fn rows(&self, index: WeekIndex) -> Option<&[ShiftRow]> {
        self.pages.get(&index).map(|page| page.rows.as_slice())
    }

    /// Rows for `index` unless the page is missing or stale.
    pub fn fresh_rows(&self, index: WeekIndex) -> Option<&[ShiftRow]> {
        self.pages
            .get(&index)
            .filter(|page| !page.stale)
            .map(|page| page.rows.as_slice())
    }

    pub fn mark_stale(&mut self, index: WeekIndex) {
        if let Some(page) = self.pages.get_mut(&index) {
            page.stale = true;
        }
    }

    pub fn rows_mut(&mut self, index: WeekIndex) -> Option<&mut Vec<ShiftRow>> {
        self.pages.get_mut(&index).map(|page| &mut page.rows)
    }

    pub fn record(&mut self, index: WeekIndex, page: &WeekPage) {
        let fetched = Cursors {
            next: page.next,
            prev: page.prev,
        };
        self.pages
            .entry(index)
            .and_modify(|cached| {
                cached.rows = page.rows.clone();
                cached.stale = false;
            })
            .or_insert_with(|| CachedPage {
                rows: page.rows.clone(),
                cursors: fetched,
                stale: false,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn week(raw: &str) -> WeekIndex {
        raw.parse().expect("valid week")
    }

    #[test]
    fn refetch_replaces_rows_but_keeps_cursors() {
        let mut cache = PageCache::default();
        let first = WeekPage {
            rows: Vec::new(),
            next: Some(week("2022w6")),
            prev: Some(week("2022w4")),
        };
        cache.record(week("2022w5"), &first);

        let row = ShiftRow {
            id: None,
            date: "2022-02-01".to_string(),
            slug: "dv".to_string(),
            name: "DV".to_string(),
            order: 1,
            workers: Vec::new(),
            settings: Default::default(),
        };
        let second = WeekPage {
            rows: vec![row],
            next: Some(week("2022w9")),
            prev: None,
        };
        cache.record(week("2022w5"), &second);

        let cursors = cache.cursors(week("2022w5")).expect("cached");
        assert_eq!(cursors.next, Some(week("2022w6")));
        assert_eq!(cursors.prev, Some(week("2022w4")));
        assert_eq!(cache.rows(week("2022w5")).map(<[_]>::len), Some(1));
    }

    #[test]
    fn stale_page_hides_rows_until_refetched() {
        let mut cache = PageCache::default();
        let page = WeekPage {
            rows: Vec::new(),
            next: None,
            prev: None,
        };
        cache.record(week("2022w5"), &page);
        cache.mark_stale(week("2022w5"));

        assert!(cache.fresh_rows(week("2022w5")).is_none());
        assert!(cache.cursors(week("2022w5")).is_some());

        cache.record(week("2022w5"), &page);
        assert!(cache.fresh_rows(week("2022w5")).is_some());
    }
}
