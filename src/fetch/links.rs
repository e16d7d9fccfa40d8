use scraper::{Html, Selector};
use tracing::info;
use url::Url;

use super::HttpFetch;
use crate::error::{Error, Result};

/// Absolute URLs of every `.zip` link on an HTML index page, in page order.
pub fn zip_links(html: &str, base: &Url) -> Vec<Url> {
    let Ok(selector) = Selector::parse(r#"a[href$=".zip"], a[href$=".ZIP"]"#) else {
        return Vec::new();
    };
    Html::parse_document(html)
        .select(&selector)
        .filter_map(|e| e.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .collect()
}

/// The configured source may point straight at the archive or at a page
/// linking to it. In the latter case the first `.zip` link wins.
pub async fn resolve_archive_url(fetcher: &dyn HttpFetch, source_url: &str) -> Result<String> {
    let url = Url::parse(source_url)
        .map_err(|e| Error::Config(format!("source url `{}`: {}", source_url, e)))?;
    if url.path().to_ascii_lowercase().ends_with(".zip") {
        return Ok(url.to_string());
    }

    let page = fetcher.get(url.as_str()).await?;
    let html = String::from_utf8_lossy(&page);
    let link = zip_links(&html, &url).into_iter().next().ok_or_else(|| {
        Error::Validation(format!("no .zip link found on {}", source_url))
    })?;
    info!(page = %url, archive = %link, "resolved archive link");
    Ok(link.to_string())
}
