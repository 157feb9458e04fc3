use std::io::Write;
use std::path::Path;
use std::process::Command;

use scraper::{Html, Selector};
use url::Url;

use crate::error::CrawlError;
use crate::models::host_of;

/// Minimum extracted text length for an HTML page to count as readable.
const MIN_HTML_TEXT_CHARS: usize = 50;

const VIDEO_HOSTS: &[&str] = &["youtube.com", "youtu.be"];

#[derive(Debug, Clone)]
pub struct ExtractedContent {
    pub title: String,
    pub text: String,
    pub image_url: Option<String>,
}

/// Turn a fetched payload into readable content. Dispatches on content
/// type: PDF, known video hosts, then general HTML readability.
pub async fn extract(
    bytes: Vec<u8>,
    content_type: Option<&str>,
    url: &str,
) -> Result<ExtractedContent, CrawlError> {
    if is_pdf(content_type, url) {
        let url = url.to_string();
        return tokio::task::spawn_blocking(move || extract_pdf(&bytes, &url))
            .await
            .map_err(|e| CrawlError::Transport(format!("PDF extraction task failed: {}", e)))?;
    }

    let html = String::from_utf8_lossy(&bytes).into_owned();

    if is_video_host(url) {
        if let Some(content) = extract_video_page(&html) {
            return Ok(content);
        }
        // No usable title/description meta: treat like a normal page.
    }

    extract_html(&html, url)
}

fn is_pdf(content_type: Option<&str>, url: &str) -> bool {
    if content_type
        .map(|ct| ct.starts_with("application/pdf"))
        .unwrap_or(false)
    {
        return true;
    }
    Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase().ends_with(".pdf"))
        .unwrap_or(false)
}

fn is_video_host(url: &str) -> bool {
    match host_of(url) {
        Some(host) => VIDEO_HOSTS
            .iter()
            .any(|v| host == *v || host.ends_with(&format!(".{}", v))),
        None => false,
    }
}

/// Readable-content pass over an HTML document: main-article heuristics
/// for the body text, social-card metas for the image.
fn extract_html(html: &str, url: &str) -> Result<ExtractedContent, CrawlError> {
    let parsed_url =
        Url::parse(url).map_err(|e| CrawlError::Transport(format!("Invalid URL: {}", e)))?;

    let product = readability::extractor::extract(&mut html.as_bytes(), &parsed_url)
        .map_err(|_| CrawlError::ReadabilityFailed)?;

    let title = product.title.trim().to_string();
    let text = normalize_whitespace(&product.text);

    if title.is_empty() || text.chars().count() < MIN_HTML_TEXT_CHARS {
        return Err(CrawlError::ReadabilityFailed);
    }

    Ok(ExtractedContent {
        title,
        text,
        image_url: extract_meta_image(html),
    })
}

/// Video pages have no article body; synthesize one from the title and
/// description metas when both are present.
fn extract_video_page(html: &str) -> Option<ExtractedContent> {
    let document = Html::parse_document(html);

    let title_selector = Selector::parse("title").ok()?;
    let title = document
        .select(&title_selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())?;

    let description_selector = Selector::parse("meta[name=\"description\"]").ok()?;
    let description = document
        .select(&description_selector)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())?;

    let image_url = extract_meta_image(html);

    Some(ExtractedContent {
        text: format!("{}\n\nDescription:\n{}", title, description),
        title,
        image_url,
    })
}

/// `og:image` first, `twitter:image` as fallback.
pub fn extract_meta_image(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selectors = [
        "meta[property=\"og:image\"]",
        "meta[name=\"og:image\"]",
        "meta[name=\"twitter:image\"]",
        "meta[property=\"twitter:image\"]",
    ];

    for selector_str in selectors {
        if let Ok(selector) = Selector::parse(selector_str) {
            if let Some(content) = document
                .select(&selector)
                .next()
                .and_then(|el| el.value().attr("content"))
            {
                let content = content.trim();
                if !content.is_empty() {
                    return Some(content.to_string());
                }
            }
        }
    }
    None
}

fn normalize_whitespace(text: &str) -> String {
    text.lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// PDF handling shells out to the Poppler tools; the payload is staged in
// a temp file because they only read from disk.

fn extract_pdf(bytes: &[u8], url: &str) -> Result<ExtractedContent, CrawlError> {
    let mut file = tempfile::Builder::new()
        .suffix(".pdf")
        .tempfile()
        .map_err(|e| CrawlError::Transport(format!("Temp file failed: {}", e)))?;
    file.write_all(bytes)
        .map_err(|e| CrawlError::Transport(format!("Temp file write failed: {}", e)))?;

    let text = run_pdftotext(file.path())?;
    let text = normalize_whitespace(&text);
    if text.is_empty() {
        return Err(CrawlError::ReadabilityFailed);
    }

    let title = pdf_metadata_title(file.path())
        .or_else(|| pdf_title_from_url(url))
        .ok_or(CrawlError::ReadabilityFailed)?;

    Ok(ExtractedContent {
        title,
        text,
        image_url: None,
    })
}

fn run_pdftotext(path: &Path) -> Result<String, CrawlError> {
    let output = Command::new("pdftotext")
        .args(["-layout", "-enc", "UTF-8"])
        .arg(path)
        .arg("-")
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CrawlError::Transport("pdftotext not found (install poppler-utils)".to_string())
            } else {
                CrawlError::Transport(format!("pdftotext failed: {}", e))
            }
        })?;

    if !output.status.success() {
        return Err(CrawlError::ReadabilityFailed);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn pdf_metadata_title(path: &Path) -> Option<String> {
    let output = Command::new("pdfinfo").arg(path).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("Title:") {
            let title = rest.trim();
            if !title.is_empty() {
                return Some(title.to_string());
            }
        }
    }
    None
}

/// Fallback title for metadata-less PDFs: the decoded basename of the
/// URL path, without the extension.
pub fn pdf_title_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let basename = parsed.path_segments()?.next_back()?.to_string();
    let decoded = urlencoding::decode(&basename)
        .map(|d| d.into_owned())
        .unwrap_or(basename);
    let stem = Path::new(&decoded)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.trim().to_string())?;
    if stem.is_empty() {
        None
    } else {
        Some(stem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article_html(paragraph: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head>
  <title>T</title>
  <meta property="og:image" content="https://img.example/i.png">
</head>
<body>
  <article>
    <h1>T</h1>
    <p>{p}</p>
    <p>{p}</p>
  </article>
</body>
</html>"#,
            p = paragraph
        )
    }

    #[tokio::test]
    async fn extracts_title_text_and_image_from_html() {
        let paragraph = "The committee published its long awaited report on municipal water \
                         infrastructure, describing in detail the funding gaps that have grown \
                         over the last decade and the repair backlog facing smaller districts.";
        let html = article_html(paragraph);
        let content = extract(html.into_bytes(), Some("text/html"), "https://site.example/a")
            .await
            .unwrap();
        assert_eq!(content.title, "T");
        assert!(content.text.chars().count() >= 200);
        assert!(content.text.contains("funding gaps"));
        assert_eq!(
            content.image_url.as_deref(),
            Some("https://img.example/i.png")
        );
    }

    #[tokio::test]
    async fn rejects_pages_with_too_little_text() {
        let html = "<html><head><title>T</title></head><body><p>hi</p></body></html>";
        let err = extract(
            html.as_bytes().to_vec(),
            Some("text/html"),
            "https://site.example/a",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CrawlError::ReadabilityFailed));
    }

    #[tokio::test]
    async fn synthesizes_video_page_content() {
        let html = r#"<html><head>
            <title>Deep dive video</title>
            <meta name="description" content="A one hour walkthrough.">
        </head><body></body></html>"#;
        let content = extract(
            html.as_bytes().to_vec(),
            Some("text/html"),
            "https://www.youtube.com/watch?v=abc",
        )
        .await
        .unwrap();
        assert_eq!(content.title, "Deep dive video");
        assert_eq!(
            content.text,
            "Deep dive video\n\nDescription:\nA one hour walkthrough."
        );
    }

    #[test]
    fn twitter_image_is_fallback() {
        let html = r#"<html><head>
            <meta name="twitter:image" content="https://img.example/t.png">
        </head><body></body></html>"#;
        assert_eq!(
            extract_meta_image(html).as_deref(),
            Some("https://img.example/t.png")
        );
    }

    #[test]
    fn pdf_detection_by_type_and_path() {
        assert!(is_pdf(Some("application/pdf"), "https://x.example/doc"));
        assert!(is_pdf(None, "https://x.example/files/report.PDF"));
        assert!(!is_pdf(Some("text/html"), "https://x.example/report.pdf.html"));
    }

    #[test]
    fn pdf_title_falls_back_to_decoded_basename() {
        assert_eq!(
            pdf_title_from_url("https://x.example/files/annual%20report.pdf"),
            Some("annual report".to_string())
        );
        assert_eq!(pdf_title_from_url("https://x.example/"), None);
    }

    #[test]
    fn video_host_matching() {
        assert!(is_video_host("https://www.youtube.com/watch?v=abc"));
        assert!(is_video_host("https://youtu.be/abc"));
        assert!(!is_video_host("https://notyoutube.com/watch"));
    }
}
