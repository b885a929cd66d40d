//! Sort and filter over a fetched media list.

use std::cmp::Ordering;

use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::model::MediaItem;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortOrder {
    /// Newest first
    #[default]
    CapturedDesc,
    CapturedAsc,
    /// Longest first
    DurationDesc,
    DurationAsc,
}

impl SortOrder {
    pub fn all() -> [SortOrder; 4] {
        [
            SortOrder::CapturedDesc,
            SortOrder::CapturedAsc,
            SortOrder::DurationDesc,
            SortOrder::DurationAsc,
        ]
    }

    pub fn reversed(&self) -> SortOrder {
        match self {
            SortOrder::CapturedDesc => SortOrder::CapturedAsc,
            SortOrder::CapturedAsc => SortOrder::CapturedDesc,
            SortOrder::DurationDesc => SortOrder::DurationAsc,
            SortOrder::DurationAsc => SortOrder::DurationDesc,
        }
    }
}

fn ascending(order: SortOrder, a: &MediaItem, b: &MediaItem) -> Ordering {
    let key = match order {
        SortOrder::CapturedDesc | SortOrder::CapturedAsc => a.sort_date().cmp(&b.sort_date()),
        SortOrder::DurationDesc | SortOrder::DurationAsc => {
            a.duration_seconds.total_cmp(&b.duration_seconds)
        }
    };
    key.then_with(|| a.id.cmp(&b.id))
}

/// Returns `items` filtered on filename (case-insensitive substring, empty
/// keeps everything) and sorted by `order`.
///
/// Ties break on id, so a descending order is the exact reverse of the
/// ascending one.
pub fn project(items: &[MediaItem], order: SortOrder, filter: &str) -> Vec<MediaItem> {
    let needle = filter.trim().to_lowercase();
    let mut projected: Vec<MediaItem> = items
        .iter()
        .filter(|item| needle.is_empty() || item.filename.to_lowercase().contains(&needle))
        .cloned()
        .collect();

    projected.sort_by(|a, b| match order {
        SortOrder::CapturedAsc | SortOrder::DurationAsc => ascending(order, a, b),
        SortOrder::CapturedDesc | SortOrder::DurationDesc => ascending(order, b, a),
    });
    projected
}

/// Photo sequence of a projected list, for the photo viewer.
pub fn photos_only(projected: &[MediaItem]) -> Vec<MediaItem> {
    projected.iter().filter(|item| item.is_photo()).cloned().collect()
}

/// Picks a random video of a projected list.
pub fn random_video<'a, R: Rng + ?Sized>(
    projected: &'a [MediaItem],
    rng: &mut R,
) -> Option<&'a MediaItem> {
    let videos: Vec<&MediaItem> = projected.iter().filter(|item| !item.is_photo()).collect();
    videos.choose(rng).copied()
}
