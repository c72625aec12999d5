//! Item selection: filters, sort order and pagination.

use crate::timestamp::Timestamp;
use crate::wbo::Wbo;
use serde::{Deserialize, Serialize};

/// Sort order for item listings and limited deletes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sort {
    /// `modified` ascending.
    Oldest,
    /// `modified` descending.
    Newest,
    /// `sortindex` descending.
    Index,
}

impl Sort {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "oldest" => Some(Sort::Oldest),
            "newest" => Some(Sort::Newest),
            "index" => Some(Sort::Index),
            _ => None,
        }
    }

    pub fn order_by(self) -> &'static str {
        match self {
            Sort::Oldest => "modified ASC",
            Sort::Newest => "modified DESC",
            Sort::Index => "sortindex DESC",
        }
    }
}

/// Predicates over items. Unset fields do not constrain.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemFilters {
    /// `modified < older`
    pub older: Option<Timestamp>,
    /// `modified > newer`
    pub newer: Option<Timestamp>,
    /// `sortindex > index_above`
    pub index_above: Option<f64>,
    /// `sortindex < index_below`
    pub index_below: Option<f64>,
    pub ids: Option<Vec<String>>,
    pub parentid: Option<String>,
    pub predecessorid: Option<String>,
    /// Return items whose ttl has elapsed as well.
    pub include_expired: bool,
}

impl ItemFilters {
    pub fn is_empty(&self) -> bool {
        *self == ItemFilters::default()
    }

    /// Evaluate the filters against an item held in memory.
    pub fn matches(&self, wbo: &Wbo, now_secs: i64) -> bool {
        if !self.include_expired && wbo.ttl.is_some_and(|ttl| ttl <= now_secs) {
            return false;
        }
        if let Some(older) = self.older
            && !wbo.modified.is_some_and(|m| m < older)
        {
            return false;
        }
        if let Some(newer) = self.newer
            && !wbo.modified.is_some_and(|m| m > newer)
        {
            return false;
        }
        let sortindex = wbo.sortindex.map(|s| s as f64);
        if let Some(above) = self.index_above
            && !sortindex.is_some_and(|s| s > above)
        {
            return false;
        }
        if let Some(below) = self.index_below
            && !sortindex.is_some_and(|s| s < below)
        {
            return false;
        }
        if let Some(ids) = &self.ids
            && !ids.iter().any(|id| *id == wbo.id)
        {
            return false;
        }
        if let Some(parentid) = &self.parentid
            && wbo.parentid.as_ref() != Some(parentid)
        {
            return false;
        }
        if let Some(predecessorid) = &self.predecessorid
            && wbo.predecessorid.as_ref() != Some(predecessorid)
        {
            return false;
        }
        true
    }
}

/// Full selection for listings and bulk deletes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemQuery {
    pub filters: ItemFilters,
    pub limit: Option<u64>,
    /// Only honored together with `limit`.
    pub offset: Option<u64>,
    pub sort: Option<Sort>,
}

impl ItemQuery {
    pub fn filtered(filters: ItemFilters) -> Self {
        Self {
            filters,
            ..Self::default()
        }
    }

    /// The offset to apply, if any.
    pub fn effective_offset(&self) -> Option<u64> {
        match (self.limit, self.offset) {
            (Some(_), Some(offset)) if offset > 0 => Some(offset),
            _ => None,
        }
    }

    pub fn effective_limit(&self) -> Option<u64> {
        self.limit.filter(|l| *l > 0)
    }

    /// Apply the whole query to items held in memory.
    pub fn apply(&self, items: impl IntoIterator<Item = Wbo>, now_secs: i64) -> Vec<Wbo> {
        let mut selected: Vec<Wbo> = items
            .into_iter()
            .filter(|wbo| self.filters.matches(wbo, now_secs))
            .collect();
        match self.sort {
            Some(Sort::Oldest) => selected.sort_by_key(|w| w.modified),
            Some(Sort::Newest) => selected.sort_by_key(|w| std::cmp::Reverse(w.modified)),
            Some(Sort::Index) => selected.sort_by_key(|w| std::cmp::Reverse(w.sortindex)),
            None => {}
        }
        let offset = self.effective_offset().unwrap_or(0) as usize;
        let limit = self.effective_limit().map(|l| l as usize).unwrap_or(usize::MAX);
        selected.into_iter().skip(offset).take(limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wbo(id: &str, modified: i64, sortindex: i64) -> Wbo {
        Wbo {
            id: id.to_string(),
            modified: Some(Timestamp::from_centis(modified)),
            sortindex: Some(sortindex),
            ttl: Some(2_000),
            ..Wbo::default()
        }
    }

    #[test]
    fn time_and_index_bounds_are_strict() {
        let item = wbo("a", 500, 10);
        let mut filters = ItemFilters {
            older: Some(Timestamp::from_centis(500)),
            ..ItemFilters::default()
        };
        assert!(!filters.matches(&item, 0));
        filters.older = Some(Timestamp::from_centis(501));
        assert!(filters.matches(&item, 0));

        let filters = ItemFilters {
            index_above: Some(9.5),
            index_below: Some(10.0),
            ..ItemFilters::default()
        };
        assert!(!filters.matches(&item, 0));
    }

    #[test]
    fn expired_items_are_hidden_unless_requested() {
        let item = wbo("a", 1, 1);
        let mut filters = ItemFilters::default();
        assert!(filters.matches(&item, 1_999));
        assert!(!filters.matches(&item, 2_000));
        filters.include_expired = true;
        assert!(filters.matches(&item, 2_000));
    }

    #[test]
    fn apply_sorts_then_pages() {
        let items = vec![wbo("a", 3, 1), wbo("b", 1, 3), wbo("c", 2, 2)];
        let query = ItemQuery {
            sort: Some(Sort::Oldest),
            limit: Some(2),
            offset: Some(1),
            ..ItemQuery::default()
        };
        let ids: Vec<_> = query.apply(items.clone(), 0).into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec!["c", "a"]);

        let query = ItemQuery {
            sort: Some(Sort::Index),
            offset: Some(1),
            ..ItemQuery::default()
        };
        let ids: Vec<_> = query.apply(items, 0).into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec!["b", "c", "a"], "offset without limit is ignored");
    }
}
