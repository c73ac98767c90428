//! Web tools: search and page fetch with text extraction.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolError};

/// Strip an HTML document down to readable text.
pub fn html_to_text(html: &str) -> String {
    let script_re = Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap();
    let style_re = Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap();
    let text = script_re.replace_all(html, "");
    let text = style_re.replace_all(&text, "");

    let block_re = Regex::new(r"(?i)</?(p|div|br|h[1-6]|li|tr)[^>]*>").unwrap();
    let text = block_re.replace_all(&text, "\n");

    let tag_re = Regex::new(r"<[^>]+>").unwrap();
    let text = tag_re.replace_all(&text, "");

    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    let multi_newline = Regex::new(r"\n{3,}").unwrap();
    let multi_space = Regex::new(r" {2,}").unwrap();
    let text = multi_newline.replace_all(&text, "\n\n");
    let text = multi_space.replace_all(&text, " ");

    text.trim().to_string()
}

fn http_client() -> Result<reqwest::Client, ToolError> {
    reqwest::Client::builder()
        .user_agent("Mozilla/5.0 (compatible; AgentSmithy/1.0)")
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| ToolError::Exception(e.to_string()))
}

// ---- web_search ----

pub struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn description(&self) -> &'static str {
        "Search the web and return result titles with URLs."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "limit": {"type": "integer", "description": "Maximum results (default 5)"}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Validation("missing required argument: query".into()))?;
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(5) as usize;

        let client = http_client()?;
        let url = format!(
            "https://html.duckduckgo.com/html/?q={}",
            urlencoding::encode(query)
        );
        let html = tokio::select! {
            response = client.get(&url).send() => {
                response
                    .map_err(|e| ToolError::ExecFailed(format!("search request failed: {e}")))?
                    .text()
                    .await
                    .map_err(|e| ToolError::ExecFailed(e.to_string()))?
            }
            _ = ctx.cancel.cancelled() => {
                return Err(ToolError::Cancelled("web search cancelled".into()));
            }
        };

        let results = parse_search_results(&html, limit);
        Ok(json!({
            "type": "web_search_result",
            "query": query,
            "results": results,
        }))
    }
}

/// Pull `(title, url)` pairs out of the DuckDuckGo HTML results page.
fn parse_search_results(html: &str, limit: usize) -> Vec<Value> {
    let mut results = Vec::new();
    for chunk in html.split("result__a").skip(1) {
        if results.len() >= limit {
            break;
        }
        let Some(href_start) = chunk.find("href=\"") else {
            continue;
        };
        let rest = &chunk[href_start + 6..];
        let Some(href_end) = rest.find('"') else {
            continue;
        };
        let href = &rest[..href_end];
        // Unwrap the redirect URL if present.
        let url = if href.contains("uddg=") {
            href.split("uddg=")
                .nth(1)
                .and_then(|s| s.split('&').next())
                .map(|s| urlencoding::decode(s).unwrap_or_default().into_owned())
                .unwrap_or_else(|| href.to_string())
        } else {
            href.to_string()
        };

        if let Some(title_end) = rest.find("</a>") {
            let title_chunk = rest.get(href_end + 2..title_end).unwrap_or("");
            let title = title_chunk
                .replace("<b>", "")
                .replace("</b>", "")
                .trim()
                .to_string();
            if !title.is_empty() && !url.is_empty() {
                results.push(json!({"title": title, "url": url}));
            }
        }
    }
    results
}

// ---- web_fetch ----

pub struct WebFetchTool;

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &'static str {
        "web_fetch"
    }

    fn description(&self) -> &'static str {
        "Fetch a URL and return its extracted text content."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "URL to fetch"}
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Validation("missing required argument: url".into()))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::Validation(format!("not an http(s) URL: {url}")));
        }

        let client = http_client()?;
        let response = tokio::select! {
            response = client.get(url).send() => {
                response.map_err(|e| ToolError::ExecFailed(format!("fetch failed: {e}")))?
            }
            _ = ctx.cancel.cancelled() => {
                return Err(ToolError::Cancelled("web fetch cancelled".into()));
            }
        };
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::ExecFailed(e.to_string()))?;

        let text = if content_type.contains("html") {
            html_to_text(&body)
        } else {
            body
        };
        // Keep the result bounded; large pages dilute the model's context.
        let text: String = text.chars().take(40_000).collect();

        Ok(json!({
            "type": "web_fetch_result",
            "url": url,
            "status": status,
            "content_type": content_type,
            "text": text,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_extraction_strips_markup() {
        let html = r#"<html><head><style>p{color:red}</style>
            <script>alert(1)</script></head>
            <body><h1>Title</h1><p>First &amp; second</p><div>Block</div></body></html>"#;
        let text = html_to_text(html);
        assert!(text.contains("Title"));
        assert!(text.contains("First & second"));
        assert!(text.contains("Block"));
        assert!(!text.contains("alert"));
        assert!(!text.contains("color:red"));
    }

    #[test]
    fn search_parsing_unwraps_redirects() {
        let html = r#"junk result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fdocs&amp;rut=x">Example <b>Docs</b></a> trailing"#;
        let results = parse_search_results(html, 5);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["url"], "https://example.com/docs");
        assert_eq!(results[0]["title"], "Example Docs");
    }
}
