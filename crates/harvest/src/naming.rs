//! URL normalization and output naming derived from an episode URL.

use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;
use url::Url;

use crate::error::HarvestError;

const MAX_NAME_LEN: usize = 80;
const FALLBACK_NAME: &str = "episode";

/// Path tokens that never identify a series.
const STOP_WORDS: &[&str] = &[
    "viewer", "read", "reader", "manga", "comic", "webtoon", "webtoons", "series", "title",
    "chapters", "chapter", "episode", "ep", "view", "fr", "en", "es", "ko",
];

/// Query keys that may carry a numeric episode number.
const EPISODE_QUERY_KEYS: &[&str] = &["episode_no", "ep", "episode", "chapter", "ch"];

static EPISODE_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(ep|episode)[\s\-_]*([0-9]+)$").unwrap());
static CHAPTER_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(ch|chap|chapter)[\s\-_]*([0-9]+)$").unwrap());
static NUMERIC_SEGMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([0-9]+)$").unwrap());
static VIEWER_SHORTCUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^/?viewer\?").unwrap());

/// Turns user input into an absolute URL.
///
/// Absolute URLs pass through, bare `viewer?...` queries and `/`-rooted
/// paths are resolved against `default_site`, anything else gets `https://`.
pub fn normalize_url(input: &str, default_site: &str) -> Result<String, HarvestError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(HarvestError::Input("missing URL".to_string()));
    }

    if let Ok(url) = Url::parse(input) {
        return Ok(url.to_string());
    }

    let site = default_site.trim_end_matches('/');
    let normalized = if VIEWER_SHORTCUT.is_match(input) {
        format!("{site}/en/viewer?{}", VIEWER_SHORTCUT.replace(input, ""))
    } else if input.starts_with('/') {
        format!("{site}{input}")
    } else {
        format!("https://{input}")
    };

    Url::parse(&normalized)
        .map(|url| url.to_string())
        .map_err(|e| HarvestError::Input(format!("{input}: {e}")))
}

/// Episode marker found in a URL, e.g. `ep12` or `ch3`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EpisodeToken {
    chapter: bool,
    number: String,
}

impl EpisodeToken {
    fn label(&self) -> String {
        let prefix = if self.chapter { "ch" } else { "ep" };
        format!("{prefix}{}", self.number)
    }

    /// Whether a path segment carries this token.
    fn found_in(&self, segment: &str) -> bool {
        let pattern = if self.chapter {
            &*CHAPTER_SEGMENT
        } else {
            &*EPISODE_SEGMENT
        };
        pattern
            .captures(segment)
            .map(|caps| caps[2] == self.number)
            .unwrap_or(false)
            || (segment == self.number && NUMERIC_SEGMENT.is_match(segment))
    }
}

fn token_from_segment(segment: &str) -> Option<EpisodeToken> {
    if let Some(caps) = EPISODE_SEGMENT.captures(segment) {
        return Some(EpisodeToken {
            chapter: false,
            number: caps[2].to_string(),
        });
    }
    if let Some(caps) = CHAPTER_SEGMENT.captures(segment) {
        return Some(EpisodeToken {
            chapter: true,
            number: caps[2].to_string(),
        });
    }
    NUMERIC_SEGMENT.captures(segment).map(|caps| EpisodeToken {
        chapter: false,
        number: caps[1].to_string(),
    })
}

fn is_meaningful(segment: &str) -> bool {
    !segment.is_empty() && !STOP_WORDS.contains(&segment.to_lowercase().as_str())
}

/// Lowercase, dash-separated ASCII slug of at most 80 characters.
pub fn sanitize(text: &str) -> String {
    let folded: String = text
        .nfkd()
        .filter(|c| !('\u{300}'..='\u{36f}').contains(c))
        .collect();

    let mut slug = String::with_capacity(folded.len());
    for c in folded.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }

    let trimmed = slug.trim_matches('-');
    trimmed.chars().take(MAX_NAME_LEN).collect()
}

/// Derives a `series-epN` style directory name from an episode URL.
///
/// Falls back to `episode` when nothing meaningful can be extracted.
pub fn series_dir_from_url(href: &str) -> String {
    let Ok(url) = Url::parse(href) else {
        return FALLBACK_NAME.to_string();
    };

    let parts: Vec<String> = url
        .path_segments()
        .map(|segments| {
            segments
                .filter(|s| !s.is_empty())
                .map(|s| {
                    url::form_urlencoded::parse(format!("x={s}").as_bytes())
                        .next()
                        .map(|(_, v)| v.into_owned())
                        .unwrap_or_else(|| s.to_string())
                })
                .collect()
        })
        .unwrap_or_default();

    let mut token = parts.iter().rev().find_map(|p| token_from_segment(p));
    if token.is_none() {
        token = EPISODE_QUERY_KEYS.iter().find_map(|key| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
                .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()))
                .map(|number| EpisodeToken {
                    chapter: false,
                    number,
                })
        });
    }

    let series_parts: Vec<&str> = match &token {
        Some(token) => {
            let episode_index = parts.iter().rposition(|p| token.found_in(p));
            let head = match episode_index {
                Some(i) if i > 0 => &parts[..i],
                _ => &parts[..],
            };
            head.iter().map(String::as_str).filter(|p| is_meaningful(p)).collect()
        }
        None => parts.iter().map(String::as_str).filter(|p| is_meaningful(p)).collect(),
    };

    let tail = &series_parts[series_parts.len().saturating_sub(2)..];
    let mut base = sanitize(&tail.join("-"));
    if base.is_empty() {
        base = FALLBACK_NAME.to_string();
    }

    if let Some(token) = token {
        let label = sanitize(&token.label());
        if !base.split('-').any(|component| component == label) {
            base = format!("{base}-{label}");
        }
    }

    base
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE: &str = "https://www.webtoons.com";

    #[test]
    fn test_normalize_absolute_url_is_kept() {
        let url = normalize_url("https://example.com/a/b?x=1", SITE).unwrap();
        assert_eq!(url, "https://example.com/a/b?x=1");
    }

    #[test]
    fn test_normalize_rooted_path_uses_default_site() {
        let url = normalize_url("/en/drama/foo/list?title_no=1", SITE).unwrap();
        assert_eq!(url, "https://www.webtoons.com/en/drama/foo/list?title_no=1");
    }

    #[test]
    fn test_normalize_viewer_shortcut() {
        let url = normalize_url("viewer?title_no=95&episode_no=3", SITE).unwrap();
        assert_eq!(url, "https://www.webtoons.com/en/viewer?title_no=95&episode_no=3");
    }

    #[test]
    fn test_normalize_bare_host_gets_https() {
        let url = normalize_url("example.com/comic/1", SITE).unwrap();
        assert_eq!(url, "https://example.com/comic/1");
    }

    #[test]
    fn test_normalize_rejects_blank_input() {
        assert!(matches!(normalize_url("   ", SITE), Err(HarvestError::Input(_))));
        assert!(matches!(normalize_url("", SITE), Err(HarvestError::Input(_))));
    }

    #[test]
    fn test_sanitize_folds_accents_and_punctuation() {
        assert_eq!(sanitize("Héros  du__Réveil!"), "heros-du-reveil");
        assert_eq!(sanitize("--a--"), "a");
    }

    #[test]
    fn test_sanitize_truncates() {
        let long = "a".repeat(200);
        assert_eq!(sanitize(&long).len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_series_name_from_episode_segment() {
        let name = series_dir_from_url(
            "https://www.webtoons.com/en/fantasy/tower-of-god/season-3-ep-180/viewer?title_no=95&episode_no=600",
        );
        assert_eq!(name, "fantasy-tower-of-god-ep180");
    }

    #[test]
    fn test_series_name_from_chapter_segment() {
        let name = series_dir_from_url("https://reader.example.com/manga/solo-leveling/chapter-12");
        assert_eq!(name, "solo-leveling-ch12");
    }

    #[test]
    fn test_series_name_from_numeric_segment() {
        let name = series_dir_from_url("https://example.com/series/my-comic/42");
        assert_eq!(name, "my-comic-ep42");
    }

    #[test]
    fn test_series_name_from_query() {
        let name = series_dir_from_url("https://example.com/en/drama/lore/viewer?episode_no=7");
        assert_eq!(name, "drama-lore-ep7");
    }

    #[test]
    fn test_series_name_without_episode() {
        let name = series_dir_from_url("https://example.com/webtoon/the-comic/list");
        assert_eq!(name, "the-comic-list");
    }

    #[test]
    fn test_series_name_does_not_duplicate_token() {
        let name = series_dir_from_url("https://example.com/ep5/ep5");
        assert_eq!(name, "ep5");
    }

    #[test]
    fn test_series_name_decodes_segments() {
        let name = series_dir_from_url("https://example.com/comic/h%C3%A9ros/ep-2");
        assert_eq!(name, "heros-ep2");
    }

    #[test]
    fn test_series_name_fallbacks() {
        assert_eq!(series_dir_from_url("not a url"), "episode");
        assert_eq!(series_dir_from_url("https://example.com/"), "episode");
    }
}
