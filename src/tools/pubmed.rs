//! PubMed tool backend client
//!
//! Thin client for the backend's literature proxy endpoints:
//! `POST /api/tools/pubmed` (search) and `POST /api/tools/fulltext`
//! (PubMed Central full text).

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Arguments for the `search_pubmed` tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PubmedQuery {
    /// Search query keywords
    pub query: String,

    /// Optional start year filter (e.g. `"2020"`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mindate: Option<String>,

    /// Max number of results (backend defaults to 10)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retmax: Option<u32>,
}

/// Arguments for the `get_full_text` tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FullTextQuery {
    /// PubMed ID of the article
    pub pmid: String,
}

/// One paper record as returned by the search proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paper {
    /// PubMed ID
    pub id: String,
    /// Article title
    pub title: String,
    /// Comma-joined author list
    pub authors: String,
    /// Journal name
    pub journal: String,
    /// Publication date string
    pub pubdate: String,
    /// PubMed link
    pub link: String,
    /// Abstract text, or a placeholder when unavailable
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    /// MeSH descriptor terms
    #[serde(default)]
    pub mesh_terms: Vec<String>,
    /// Pre-formatted citation
    pub citation: String,
}

/// Full-text retrieval result. The section payload varies by article, so
/// everything beyond the success flag stays dynamic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullTextResult {
    /// Whether full text was available
    pub success: bool,

    /// Failure explanation when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Title, sections, and any other article fields
    #[serde(flatten)]
    pub body: serde_json::Value,
}

/// Client for the literature proxy endpoints
pub struct PubmedClient {
    client: reqwest::Client,
    api_base: String,
}

impl PubmedClient {
    /// Create a client against the given backend base URL
    #[must_use]
    pub fn new(api_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// Search PubMed via the backend proxy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ToolBackendFailure`] when the request fails or the
    /// backend answers non-2xx.
    pub async fn search(&self, query: &PubmedQuery) -> Result<Vec<Paper>> {
        let response = self
            .client
            .post(format!("{}/api/tools/pubmed", self.api_base))
            .json(query)
            .send()
            .await
            .map_err(|e| Error::ToolBackendFailure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::ToolBackendFailure(format!(
                "pubmed search returned {status}"
            )));
        }

        let papers: Vec<Paper> = response
            .json()
            .await
            .map_err(|e| Error::ToolBackendFailure(e.to_string()))?;

        tracing::debug!(query = %query.query, results = papers.len(), "pubmed search complete");
        Ok(papers)
    }

    /// Fetch full text for an open-access article.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ToolBackendFailure`] when the request fails or the
    /// backend answers non-2xx. A "not open access" outcome is a successful
    /// response with `success = false`, not an error.
    pub async fn full_text(&self, query: &FullTextQuery) -> Result<FullTextResult> {
        let response = self
            .client
            .post(format!("{}/api/tools/fulltext", self.api_base))
            .json(query)
            .send()
            .await
            .map_err(|e| Error::ToolBackendFailure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::ToolBackendFailure(format!(
                "fulltext returned {status}"
            )));
        }

        let result: FullTextResult = response
            .json()
            .await
            .map_err(|e| Error::ToolBackendFailure(e.to_string()))?;

        tracing::debug!(pmid = %query.pmid, success = result.success, "full text fetched");
        Ok(result)
    }
}
