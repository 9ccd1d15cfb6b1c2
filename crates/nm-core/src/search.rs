//! Search query parsing and execution. Parsing is pure and total; execution
//! issues a single lookup against the post repository and aggregates hashtag
//! occurrences over the matched set only.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::repository::{Post, PostRepository, RepositoryError};

/// A raw query split into free-text terms and hashtag filters. Both groups
/// are lowercased and deduplicated, insertion order preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub terms: Vec<String>,
    pub hashtags: Vec<String>,
}

impl SearchQuery {
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.hashtags.is_empty()
    }

    pub fn to_filter(&self) -> PostFilter {
        PostFilter {
            terms: self.terms.clone(),
            hashtags: self.hashtags.clone(),
        }
    }
}

/// The filter handed to the post repository. Hashtags combine with AND,
/// terms with OR, and the two groups with AND when both are present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostFilter {
    pub terms: Vec<String>,
    pub hashtags: Vec<String>,
}

impl PostFilter {
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.hashtags.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashtagCount {
    pub tag: String,
    pub count: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct SearchResults {
    pub posts: Vec<Post>,
    pub hashtags: Vec<HashtagCount>,
}

/// Splits a raw query on whitespace. A `#`-prefixed token contributes its
/// lowercased body to the hashtag group; everything else is a lowercased
/// free-text term. Blank input parses to two empty groups.
pub fn parse_search_query(raw: &str) -> SearchQuery {
    let mut query = SearchQuery::default();
    let mut seen_terms = HashSet::new();
    let mut seen_tags = HashSet::new();

    for token in raw.split_whitespace() {
        if let Some(body) = token.strip_prefix('#') {
            if body.is_empty() {
                continue;
            }
            let tag = format!("#{}", body.to_lowercase());
            if seen_tags.insert(tag.clone()) {
                query.hashtags.push(tag);
            }
        } else {
            let term = token.to_lowercase();
            if seen_terms.insert(term.clone()) {
                query.terms.push(term);
            }
        }
    }

    query
}

/// Every hashtag occurrence in `content`: a `#` followed by a run of
/// `[A-Za-z0-9_]`, normalized to lowercase with the `#` retained. Duplicates
/// are kept so callers can count occurrences.
pub fn extract_hashtags(content: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '#' {
            continue;
        }
        let mut body = String::new();
        while let Some(next) = chars.peek() {
            if next.is_ascii_alphanumeric() || *next == '_' {
                body.push(next.to_ascii_lowercase());
                chars.next();
            } else {
                break;
            }
        }
        if !body.is_empty() {
            tags.push(format!("#{body}"));
        }
    }

    tags
}

/// The exact matching rule shared by every repository implementation: all
/// hashtag filters must appear among the content's hashtag tokens, and when
/// free-text terms are present at least one must be contained in the content,
/// case-insensitively. An empty filter matches nothing.
pub fn post_matches(content: &str, filter: &PostFilter) -> bool {
    if filter.is_empty() {
        return false;
    }

    if !filter.hashtags.is_empty() {
        let tags = extract_hashtags(content);
        if !filter
            .hashtags
            .iter()
            .all(|wanted| tags.iter().any(|tag| tag == wanted))
        {
            return false;
        }
    }

    if !filter.terms.is_empty() {
        let lowered = content.to_lowercase();
        if !filter.terms.iter().any(|term| lowered.contains(term)) {
            return false;
        }
    }

    true
}

/// Runs a parsed query against the repository. A blank query short-circuits
/// to empty results without touching the repository. Posts come back ordered
/// by recency, ties broken by id ascending; hashtag counts cover only the
/// matched posts, ordered by count descending then tag ascending.
pub async fn execute_search(
    posts: &dyn PostRepository,
    query: &SearchQuery,
) -> Result<SearchResults, RepositoryError> {
    if query.is_empty() {
        return Ok(SearchResults::default());
    }

    let mut matched = posts.find_posts_matching(&query.to_filter()).await?;
    matched.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for post in &matched {
        for tag in extract_hashtags(&post.content) {
            *counts.entry(tag).or_insert(0) += 1;
        }
    }
    let mut hashtags: Vec<HashtagCount> = counts
        .into_iter()
        .map(|(tag, count)| HashtagCount { tag, count })
        .collect();
    hashtags.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));

    Ok(SearchResults {
        posts: matched,
        hashtags,
    })
}
