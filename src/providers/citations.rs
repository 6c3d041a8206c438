//! Unified citation shape and the per-backend formatters that produce it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Grounding metadata attached to an answer
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Citations {
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub text_segments: Vec<TextSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_metadata: Option<SearchMetadata>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Citation {
    /// 1-based, stable within one response
    pub id: usize,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// A span of the answer backed by one or more citations
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextSegment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_index: Option<u64>,
    pub citation_ids: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_content: Option<String>,
}

fn str_at<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Format Google `groundingMetadata`
pub fn from_google_grounding(metadata: &Value) -> Option<Citations> {
    let citations: Vec<Citation> = metadata
        .get("groundingChunks")
        .and_then(Value::as_array)
        .map(|chunks| {
            chunks
                .iter()
                .enumerate()
                .filter_map(|(i, chunk)| {
                    let web = chunk.get("web")?;
                    Some(Citation {
                        id: i + 1,
                        title: str_at(web, "title").unwrap_or_default().to_string(),
                        url: str_at(web, "uri").unwrap_or_default().to_string(),
                        snippet: None,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let text_segments: Vec<TextSegment> = metadata
        .get("groundingSupports")
        .and_then(Value::as_array)
        .map(|supports| {
            supports
                .iter()
                .map(|support| {
                    let segment = support.get("segment");
                    TextSegment {
                        text: segment
                            .and_then(|s| str_at(s, "text"))
                            .map(str::to_string),
                        start_index: segment
                            .and_then(|s| s.get("startIndex"))
                            .and_then(Value::as_u64),
                        end_index: segment
                            .and_then(|s| s.get("endIndex"))
                            .and_then(Value::as_u64),
                        citation_ids: support
                            .get("groundingChunkIndices")
                            .and_then(Value::as_array)
                            .map(|ids| {
                                ids.iter()
                                    .filter_map(Value::as_u64)
                                    .map(|i| i as usize + 1)
                                    .collect()
                            })
                            .unwrap_or_default(),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let queries: Vec<String> = metadata
        .get("webSearchQueries")
        .and_then(Value::as_array)
        .map(|q| q.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let entry_point = metadata.get("searchEntryPoint");
    let rendered_content = entry_point
        .and_then(|e| str_at(e, "renderedContent"))
        .map(str::to_string);
    let search_metadata = if queries.is_empty() && entry_point.is_none() {
        None
    } else {
        Some(SearchMetadata {
            queries,
            rendered_content,
        })
    };

    if citations.is_empty() && text_segments.is_empty() && search_metadata.is_none() {
        return None;
    }

    Some(Citations {
        citations,
        text_segments,
        search_metadata,
    })
}

/// Accumulates sources and cited spans across a streamed response
#[derive(Debug, Default)]
pub struct CitationCollector {
    citations: Vec<Citation>,
    segments: Vec<TextSegment>,
    queries: Vec<String>,
}

impl CitationCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.citations.is_empty() && self.segments.is_empty() && self.queries.is_empty()
    }

    /// Register a source, returning its id. Sources are deduplicated by URL
    /// and snippet.
    pub fn add_source(&mut self, title: &str, url: &str, snippet: Option<&str>) -> usize {
        if let Some(existing) = self
            .citations
            .iter()
            .find(|c| c.url == url && c.snippet.as_deref() == snippet)
        {
            return existing.id;
        }
        let id = self.citations.len() + 1;
        self.citations.push(Citation {
            id,
            title: title.to_string(),
            url: url.to_string(),
            snippet: snippet.map(str::to_string),
        });
        id
    }

    pub fn add_query(&mut self, query: &str) {
        if !self.queries.iter().any(|q| q == query) {
            self.queries.push(query.to_string());
        }
    }

    /// Record an OpenAI `url_citation` annotation (chat nests the fields
    /// under `url_citation`, Responses puts them on the annotation itself)
    pub fn add_url_citation(&mut self, annotation: &Value) -> Option<usize> {
        if str_at(annotation, "type") != Some("url_citation") {
            return None;
        }
        let fields = annotation.get("url_citation").unwrap_or(annotation);
        let url = str_at(fields, "url")?;
        let title = str_at(fields, "title").unwrap_or(url);
        let id = self.add_source(title, url, None);
        self.segments.push(TextSegment {
            text: None,
            start_index: fields.get("start_index").and_then(Value::as_u64),
            end_index: fields.get("end_index").and_then(Value::as_u64),
            citation_ids: vec![id],
        });
        Some(id)
    }

    pub fn add_segment(&mut self, text: Option<&str>, citation_ids: Vec<usize>) {
        self.segments.push(TextSegment {
            text: text.map(str::to_string),
            start_index: None,
            end_index: None,
            citation_ids,
        });
    }

    pub fn finish(self) -> Option<Citations> {
        if self.is_empty() {
            return None;
        }
        let search_metadata = if self.queries.is_empty() {
            None
        } else {
            Some(SearchMetadata {
                queries: self.queries,
                rendered_content: None,
            })
        };
        Some(Citations {
            citations: self.citations,
            text_segments: self.segments,
            search_metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_google_grounding_is_formatted() {
        let metadata = json!({
            "webSearchQueries": ["rust streams"],
            "searchEntryPoint": {"renderedContent": "<div/>"},
            "groundingChunks": [
                {"web": {"uri": "https://a.example", "title": "A"}},
                {"web": {"uri": "https://b.example", "title": "B"}}
            ],
            "groundingSupports": [
                {"segment": {"startIndex": 0, "endIndex": 5, "text": "Hello"},
                 "groundingChunkIndices": [0, 1]}
            ]
        });

        let citations = from_google_grounding(&metadata).unwrap();
        assert_eq!(citations.citations.len(), 2);
        assert_eq!(citations.citations[1].id, 2);
        assert_eq!(citations.citations[1].url, "https://b.example");
        assert_eq!(citations.text_segments[0].citation_ids, vec![1, 2]);
        assert_eq!(citations.text_segments[0].text.as_deref(), Some("Hello"));
        let search = citations.search_metadata.unwrap();
        assert_eq!(search.queries, vec!["rust streams"]);
        assert_eq!(search.rendered_content.as_deref(), Some("<div/>"));
    }

    #[test]
    fn test_google_grounding_empty_is_none() {
        assert!(from_google_grounding(&json!({})).is_none());
    }

    #[test]
    fn test_collector_dedups_sources() {
        let mut collector = CitationCollector::new();
        let a = collector.add_source("A", "https://a", Some("x"));
        let b = collector.add_source("A again", "https://a", Some("x"));
        let c = collector.add_source("A", "https://a", Some("y"));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let citations = collector.finish().unwrap();
        assert_eq!(citations.citations.len(), 2);
    }

    #[test]
    fn test_collector_url_citation_shapes() {
        let mut collector = CitationCollector::new();
        let nested = json!({
            "type": "url_citation",
            "url_citation": {"url": "https://n", "title": "N", "start_index": 1, "end_index": 4}
        });
        let flat = json!({"type": "url_citation", "url": "https://f", "start_index": 9, "end_index": 12});
        assert_eq!(collector.add_url_citation(&nested), Some(1));
        assert_eq!(collector.add_url_citation(&flat), Some(2));
        assert_eq!(collector.add_url_citation(&json!({"type": "file_citation"})), None);

        let citations = collector.finish().unwrap();
        assert_eq!(citations.citations[1].title, "https://f");
        assert_eq!(citations.text_segments[0].start_index, Some(1));
        assert_eq!(citations.text_segments[1].end_index, Some(12));
    }

    #[test]
    fn test_empty_collector_finishes_to_none() {
        assert!(CitationCollector::new().finish().is_none());
    }
}
