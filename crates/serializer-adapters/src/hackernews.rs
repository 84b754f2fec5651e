use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serializer_core::{ExternalItem, RunContext, StoryType, SOURCE_HACKERNEWS};
use serializer_storage::HttpFetcher;
use tracing::{debug, warn};

use crate::{AdapterError, SourceAdapter};

const SEARCH_URL: &str = "https://hn.algolia.com/api/v1/search?tags=front_page&hitsPerPage=30";
const ITEM_URL: &str = "https://hn.algolia.com/api/v1/items";

#[derive(Debug, Deserialize)]
struct SearchResult {
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_tags", default)]
    tags: Vec<String>,
    #[serde(default)]
    author: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    num_comments: Option<i64>,
    #[serde(rename = "objectID")]
    object_id: String,
    #[serde(default)]
    points: Option<i64>,
    #[serde(default)]
    story_id: Option<i64>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: Option<String>,
}

impl Hit {
    fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// First matching tag wins; the more specific kinds are checked first.
    fn story_type(&self) -> StoryType {
        [
            StoryType::AskHn,
            StoryType::ShowHn,
            StoryType::Job,
            StoryType::Poll,
            StoryType::Story,
        ]
        .into_iter()
        .find(|t| self.has_tag(t.as_str()))
        .unwrap_or(StoryType::Unknown)
    }

    fn ref_id(&self) -> String {
        self.story_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| self.object_id.clone())
    }
}

#[derive(Debug, Deserialize)]
struct Item {
    id: i64,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    points: Option<i64>,
    #[serde(rename = "type", default)]
    item_type: Option<String>,
    #[serde(default)]
    children: Vec<Item>,
}

impl Item {
    fn comment_count(&self) -> i64 {
        self.children
            .iter()
            .map(|c| {
                let own = i64::from(c.item_type.as_deref() == Some("comment"));
                own + c.comment_count()
            })
            .sum()
    }
}

/// Front-page stories, ordered by story id. Jobs are dropped; hits without a
/// known type are dropped with a warning.
pub fn parse_search_results(source: &str, body: &[u8]) -> Result<Vec<ExternalItem>, AdapterError> {
    let mut result: SearchResult =
        serde_json::from_slice(body).map_err(|source| AdapterError::Decode {
            what: "hn search result".to_string(),
            source,
        })?;
    result.hits.sort_by_key(|h| h.story_id.unwrap_or_default());

    let mut items = Vec::with_capacity(result.hits.len());
    for hit in result.hits {
        let story_type = hit.story_type();
        match story_type {
            StoryType::Job => continue,
            StoryType::Unknown => {
                warn!(source, id = %hit.object_id, tags = ?hit.tags, "skipping hit of unknown type");
                continue;
            }
            _ => {}
        }
        items.push(ExternalItem {
            source: source.to_string(),
            ref_id: hit.ref_id(),
            url: hit.url.clone().unwrap_or_default(),
            title: hit.title.clone(),
            author: hit.author.clone(),
            story_type,
            score: hit.points.unwrap_or_default(),
            num_comments: hit.num_comments.unwrap_or_default(),
            published_at: hit.created_at,
        });
    }
    Ok(items)
}

/// A single item. The items endpoint does not carry front-page tags, so only
/// the coarse `type` is mapped and ask/show stories come back as `Story`.
pub fn parse_item(source: &str, ref_id: &str, body: &[u8]) -> Result<ExternalItem, AdapterError> {
    let item: Item = serde_json::from_slice(body).map_err(|source| AdapterError::Decode {
        what: format!("hn item {ref_id}"),
        source,
    })?;
    let story_type = match item.item_type.as_deref() {
        Some("story") => StoryType::Story,
        Some("job") => StoryType::Job,
        Some("poll") => StoryType::Poll,
        _ => StoryType::Unknown,
    };
    debug!(id = item.id, "decoded hn item");
    Ok(ExternalItem {
        source: source.to_string(),
        ref_id: ref_id.to_string(),
        url: item.url.clone().unwrap_or_default(),
        title: item.title.clone().unwrap_or_default(),
        author: item.author.clone().unwrap_or_default(),
        story_type,
        score: item.points.unwrap_or_default(),
        num_comments: item.comment_count(),
        published_at: item.created_at.unwrap_or_else(Utc::now),
    })
}

/// Hacker News front page through the Algolia search API.
#[derive(Debug, Clone)]
pub struct HackerNewsAdapter {
    name: String,
    http: Arc<HttpFetcher>,
}

impl HackerNewsAdapter {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_name(SOURCE_HACKERNEWS, http)
    }

    pub fn with_name(name: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            name: name.into(),
            http,
        }
    }
}

#[async_trait]
impl SourceAdapter for HackerNewsAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_batch(&self, ctx: &RunContext) -> Result<Vec<ExternalItem>, AdapterError> {
        debug!(run_id = %ctx.run_id, url = SEARCH_URL, "fetching hn front page");
        let response = self.http.get(&self.name, SEARCH_URL).await?;
        parse_search_results(&self.name, &response.body)
    }

    async fn fetch_one(
        &self,
        ctx: &RunContext,
        ref_id: &str,
    ) -> Result<Option<ExternalItem>, AdapterError> {
        let url = format!("{ITEM_URL}/{ref_id}");
        debug!(run_id = %ctx.run_id, %url, "fetching hn item");
        match self.http.get(&self.name, &url).await {
            Ok(response) => parse_item(&self.name, ref_id, &response.body).map(Some),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH: &str = r#"{
      "hits": [
        {"_tags": ["story", "author_b", "story_30", "front_page"], "author": "b",
         "created_at": "2026-03-01T10:00:00Z", "num_comments": 12, "objectID": "30",
         "points": 150, "story_id": 30, "title": "Second", "url": "https://example.com/2"},
        {"_tags": ["story", "author_a", "story_20", "ask_hn", "front_page"], "author": "a",
         "created_at": "2026-03-01T09:00:00Z", "num_comments": 40, "objectID": "20",
         "points": 99, "story_id": 20, "title": "Ask HN: First?", "url": null},
        {"_tags": ["job", "story_25", "front_page"], "author": "yc",
         "created_at": "2026-03-01T09:30:00Z", "objectID": "25", "story_id": 25,
         "title": "Acme is hiring", "url": "https://acme.test/jobs"},
        {"_tags": ["front_page"], "author": "z",
         "created_at": "2026-03-01T09:45:00Z", "objectID": "27", "story_id": 27,
         "title": "Mystery"}
      ],
      "processingTimeMS": 1
    }"#;

    #[test]
    fn search_results_are_sorted_typed_and_filtered() {
        let items = parse_search_results("hackernews", SEARCH.as_bytes()).unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.ref_id.as_str()).collect();
        assert_eq!(ids, vec!["20", "30"]);
        assert_eq!(items[0].story_type, StoryType::AskHn);
        assert_eq!(items[0].url, "");
        assert_eq!(items[1].story_type, StoryType::Story);
        assert_eq!(items[1].score, 150);
        assert_eq!(items[1].num_comments, 12);
    }

    #[test]
    fn item_comment_count_is_recursive() {
        let body = r#"{
          "id": 30, "created_at": "2026-03-01T10:00:00Z", "author": "b", "title": "Second",
          "url": "https://example.com/2", "points": 151, "type": "story",
          "children": [
            {"id": 31, "type": "comment", "children": [
              {"id": 32, "type": "comment", "children": []}
            ]},
            {"id": 33, "type": "comment", "children": []}
          ]
        }"#;
        let item = parse_item("hackernews", "30", body.as_bytes()).unwrap();
        assert_eq!(item.num_comments, 3);
        assert_eq!(item.score, 151);
        assert_eq!(item.story_type, StoryType::Story);
        assert_eq!(item.ref_id, "30");
    }

    #[test]
    fn item_type_maps_coarse_kinds() {
        for (kind, expected) in [
            ("story", StoryType::Story),
            ("job", StoryType::Job),
            ("poll", StoryType::Poll),
            ("comment", StoryType::Unknown),
        ] {
            let body = format!(r#"{{"id": 40, "type": "{kind}", "children": []}}"#);
            let item = parse_item("hackernews", "40", body.as_bytes()).unwrap();
            assert_eq!(item.story_type, expected, "type {kind}");
        }
    }

    #[test]
    fn malformed_body_is_a_decode_error() {
        let err = parse_search_results("hackernews", b"<html>").expect_err("not json");
        assert!(matches!(err, AdapterError::Decode { .. }));
    }
}
