//! Paging of list responses

use serde::{Deserialize, Serialize};

pub const DEFAULT_SIZE: usize = 10;
const MAX_PAGE: usize = 99_999;
const MAX_SIZE: usize = 9_999;

/// Page metadata flattened next to `content`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub last: bool,
    pub total_elements: usize,
    pub total_pages: usize,
    pub first: bool,
    pub number_of_elements: usize,
    pub size: usize,
    pub number: usize,
}

/// Page number; unparsable or negative values are 0
pub fn parse_page(raw: Option<&str>) -> usize {
    match raw.map(str::parse::<i64>) {
        Some(Ok(page)) if page > 0 => usize::try_from(page).map_or(MAX_PAGE, |p| p.min(MAX_PAGE)),
        _ => 0,
    }
}

/// Page size; unparsable or non-positive values are [`DEFAULT_SIZE`]
pub fn parse_size(raw: Option<&str>) -> usize {
    match raw.map(str::parse::<i64>) {
        Some(Ok(size)) if size > 0 => usize::try_from(size).map_or(MAX_SIZE, |s| s.min(MAX_SIZE)),
        _ => DEFAULT_SIZE,
    }
}

/// Bounds of page `page` of `size` over `len` items, with the page metadata.
///
/// A page past the end is empty but still reports the requested number.
pub fn paginate(page: usize, size: usize, len: usize) -> (usize, usize, Page) {
    let size = size.max(1);
    let start = page.saturating_mul(size).min(len);
    let end = (start + size).min(len);
    let meta = Page {
        last: end >= len,
        total_elements: len,
        total_pages: len.div_ceil(size),
        first: page == 0,
        number_of_elements: end - start,
        size,
        number: page,
    };
    (start, end, meta)
}
