//! Content rating normalization and the rating -> age-limit ceiling used by
//! the download match filter.
//!
//! yt-dlp reports an `age_limit` per video but no normalized rating; the
//! tables here bridge between the ratings an operator configures (MPAA / TV
//! Parental Guidance) and that numeric field.

/// Map a yt-dlp age_limit to the display rating it implies.
pub fn rating_for_age_limit(age_limit: u32) -> &'static str {
    match age_limit {
        18.. => "R",
        16..=17 => "PG-13",
        13..=15 => "TV-14",
        7..=12 => "TV-PG",
        _ => "TV-G",
    }
}

/// The age-limit ceiling implied by a configured maximum content rating.
/// Videos whose age_limit exceeds this are filtered out; unknown ratings
/// yield None (no filtering).
pub fn age_limit_for_rating(rating: &str) -> Option<u32> {
    match rating.trim().to_uppercase().as_str() {
        "G" | "TV-G" | "TV-Y" | "TV-Y7" => Some(0),
        "PG" | "TV-PG" => Some(7),
        "TV-14" => Some(13),
        "PG-13" => Some(16),
        "R" | "NC-17" | "TV-MA" => Some(18),
        _ => None,
    }
}
