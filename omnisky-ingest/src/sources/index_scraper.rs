//! "Index of" catalog scraper
//!
//! Fetches directory listing pages and collects links to dataset files.
//! Relative links resolve against the page URL; only the configured
//! extensions are kept.

use super::{PluginError, SourcePlugin};
use crate::config::SourceConfig;
use crate::models::{ArtifactKind, Target};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

pub const PLUGIN_ID: &str = "index_scraper";

const DEFAULT_NAME: &str = "INDEX_SCRAPER";
const DEFAULT_EXTENSIONS: &[&str] = &[".h5", ".fil", ".fits", ".fits.gz"];
const PAGE_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("OmniSky/", env!("CARGO_PKG_VERSION"));

pub struct IndexScraper {
    name: String,
    pages: Vec<Url>,
    extensions: Vec<String>,
    kind: Option<ArtifactKind>,
    object_name: Option<String>,
    dataset: Option<String>,
    href_pattern: Regex,
    http_client: reqwest::Client,
}

pub fn build(config: &SourceConfig) -> Result<Box<dyn SourcePlugin>, PluginError> {
    let invalid = |message: String| PluginError::InvalidConfig {
        plugin: PLUGIN_ID.to_string(),
        message,
    };

    if config.urls.is_empty() {
        return Err(invalid("urls must list at least one index page".to_string()));
    }

    let pages = config
        .urls
        .iter()
        .map(|u| Url::parse(u).map_err(|e| invalid(format!("bad index url {}: {}", u, e))))
        .collect::<Result<Vec<_>, _>>()?;

    let extensions = if config.extensions.is_empty() {
        DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
    } else {
        config.extensions.iter().map(|e| e.to_ascii_lowercase()).collect()
    };

    let http_client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(PAGE_TIMEOUT)
        .build()?;

    Ok(Box::new(IndexScraper {
        name: config.name.clone().unwrap_or_else(|| DEFAULT_NAME.to_string()),
        pages,
        extensions,
        kind: config.kind,
        object_name: config.object_name.clone(),
        dataset: config.dataset.clone(),
        href_pattern: href_regex()?,
        http_client,
    }))
}

fn href_regex() -> Result<Regex, PluginError> {
    Regex::new(r#"(?i)href\s*=\s*["']([^"'#]+)["']"#).map_err(|e| PluginError::Parse(e.to_string()))
}

/// Links on `html` ending in one of `extensions`, resolved against `base`
///
/// Order of first appearance is kept; repeated links are dropped.
pub fn extract_links(pattern: &Regex, base: &Url, html: &str, extensions: &[String]) -> Vec<Url> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for caps in pattern.captures_iter(html) {
        let href = caps[1].trim();
        let path = href.split('?').next().unwrap_or(href).to_ascii_lowercase();
        if !extensions.iter().any(|ext| path.ends_with(ext.as_str())) {
            continue;
        }
        if let Ok(resolved) = base.join(href) {
            if seen.insert(resolved.to_string()) {
                links.push(resolved);
            }
        }
    }

    links
}

impl IndexScraper {
    async fn scrape_page(&self, page: &Url) -> Result<Vec<Target>, PluginError> {
        tracing::info!(plugin = %self.name, page = %page, "Crawling index page");

        let response = self.http_client.get(page.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PluginError::Network(format!("HTTP {} for {}", status.as_u16(), page)));
        }
        let html = response.text().await?;

        let dataset = self
            .dataset
            .clone()
            .or_else(|| page.host_str().map(str::to_string))
            .unwrap_or_default();

        let targets = extract_links(&self.href_pattern, page, &html, &self.extensions)
            .into_iter()
            .filter_map(|link| {
                let kind = self.kind.or_else(|| ArtifactKind::from_extension(link.path()))?;
                let target = Target::new(link.to_string(), kind).with_dataset(dataset.clone());
                Some(match &self.object_name {
                    Some(name) => target.with_object_name(name.clone()),
                    None => target,
                })
            })
            .collect();

        Ok(targets)
    }
}

#[async_trait]
impl SourcePlugin for IndexScraper {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Option<ArtifactKind> {
        self.kind
    }

    /// Pages are crawled one after another; a failing page is skipped
    /// unless every page fails
    async fn discover(&self) -> Result<Vec<Target>, PluginError> {
        let mut targets = Vec::new();
        let mut last_error = None;
        let mut succeeded = 0usize;

        for page in &self.pages {
            match self.scrape_page(page).await {
                Ok(found) => {
                    succeeded += 1;
                    targets.extend(found);
                }
                Err(e) => {
                    tracing::warn!(plugin = %self.name, page = %page, error = %e, "Error scraping index page");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if succeeded == 0 => Err(e),
            _ => Ok(targets),
        }
    }
}
