//! Display-side link helpers. Pure functions over a stored story; nothing here
//! takes part in ingestion.

use url::{form_urlencoded, Url};

use crate::{Story, StoryType, SOURCE_HACKERNEWS};

/// Rewrites outbound links, e.g. to a privacy-friendly frontend.
pub trait UrlTransformer: Send + Sync {
    fn matches(&self, url: &Url) -> bool;
    fn transform(&self, url: Url) -> Url;
}

/// Redirects a host (and its subdomains) through a farside.link service.
#[derive(Debug, Clone)]
pub struct FarsideTransformer {
    host: String,
    match_subdomain: bool,
    target: Url,
}

impl FarsideTransformer {
    pub fn new(host: &str, service: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            host: host.to_ascii_lowercase(),
            match_subdomain: true,
            target: Url::parse(&format!("https://farside.link/{service}"))?,
        })
    }
}

impl UrlTransformer for FarsideTransformer {
    fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return false;
        };
        host == self.host || (self.match_subdomain && host.ends_with(&format!(".{}", self.host)))
    }

    fn transform(&self, url: Url) -> Url {
        let mut out = self.target.clone();
        let path = format!("{}{}", self.target.path().trim_end_matches('/'), url.path());
        out.set_path(&path);
        out.set_query(url.query());
        out.set_fragment(url.fragment());
        out
    }
}

fn subpath(path: &str, segments: usize) -> String {
    let parts: Vec<&str> = path.splitn(segments + 2, '/').collect();
    if parts.len() <= segments + 1 {
        return path.to_string();
    }
    parts[..segments + 1].join("/")
}

fn query_escape(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

impl Story {
    /// Host of the story link; code hosts keep the owner/repo part.
    pub fn domain(&self) -> String {
        if self.url.is_empty() {
            return String::new();
        }
        let Ok(url) = Url::parse(&self.url) else {
            return String::new();
        };
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        match host.as_str() {
            "github.com" | "gitlab.com" => format!("{host}{}", subpath(url.path(), 2)),
            "twitter.com" => format!("{host}{}", subpath(url.path(), 1)),
            _ => host,
        }
    }

    pub fn comments_url(&self) -> String {
        match self.source.as_str() {
            SOURCE_HACKERNEWS => format!(
                "https://news.ycombinator.com/item?id={}",
                query_escape(&self.ref_id)
            ),
            _ => "#".to_string(),
        }
    }

    pub fn search_url(&self) -> String {
        match self.source.as_str() {
            SOURCE_HACKERNEWS => format!(
                "https://hn.algolia.com/?dateRange=pastYear&type=story&query={}",
                query_escape(&self.title)
            ),
            _ => "#".to_string(),
        }
    }

    /// Where a click on the title should go, after the first matching transformer.
    pub fn link_url(&self, transformers: &[Box<dyn UrlTransformer>]) -> String {
        let link = match self.source.as_str() {
            SOURCE_HACKERNEWS if self.story_type == StoryType::AskHn || self.url.is_empty() => {
                self.comments_url()
            }
            SOURCE_HACKERNEWS => self.url.clone(),
            _ => "#".to_string(),
        };
        if link == "#" {
            return link;
        }
        let Ok(parsed) = Url::parse(&link) else {
            return link;
        };
        transformers
            .iter()
            .find(|t| t.matches(&parsed))
            .map(|t| t.transform(parsed.clone()).to_string())
            .unwrap_or(link)
    }
}
