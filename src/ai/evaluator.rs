use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::CrawlError;
use crate::models::{Evaluation, Scores};

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
const LLM_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONTENT_CHARS: usize = 5000;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    response_format: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

pub struct Evaluator {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl Evaluator {
    pub fn new(api_key: String, model: String) -> Self {
        let client = Client::builder()
            .timeout(LLM_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            api_key,
            model,
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    /// Score and summarize one article. Requires JSON response mode so
    /// the reply parses into a strict result record.
    pub async fn evaluate(&self, title: &str, content: &str) -> Result<Evaluation, CrawlError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: build_prompt(title, content),
            }],
            response_format: json!({ "type": "json_object" }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CrawlError::Timeout
                } else {
                    CrawlError::Transport(format!("LLM request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CrawlError::Transport(format!(
                "LLM API error (HTTP {}): {}",
                status.as_u16(),
                body
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|_| CrawlError::InvalidLlmResponse)?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(CrawlError::InvalidLlmResponse)?;

        parse_evaluation(&content)
    }
}

fn build_prompt(title: &str, content: &str) -> String {
    format!(
        r#"あなたはニュース記事の評価者です。以下の記事を読み、JSONオブジェクトのみで回答してください。

記事タイトル: {title}

記事本文:
{content}

次のキーを持つJSONオブジェクトを出力してください:
- "translatedTitle": タイトルの自然な日本語訳
- "summary": 記事の要約（日本語、3〜5文）
- "shortSummary": 一文の短い要約（日本語）
- "scores": 以下の5項目をそれぞれ1〜5の整数で評価したオブジェクト
  - "novelty": 新規性
  - "importance": 重要性
  - "reliability": 信頼性
  - "contextValue": 文脈的価値
  - "thoughtProvoking": 思考喚起度

JSON以外のテキストは出力しないでください。"#,
        title = title,
        content = truncate_chars(content, MAX_CONTENT_CHARS),
    )
}

/// First `max` characters of the content, on a char boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Parse the model's JSON reply into a strict record. The reply must be a
/// JSON object with a `scores` object whose `novelty` field is numeric;
/// anything else is rejected rather than passed through.
pub fn parse_evaluation(raw: &str) -> Result<Evaluation, CrawlError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|_| CrawlError::InvalidLlmResponse)?;

    let scores_value = value.get("scores").ok_or(CrawlError::InvalidLlmResponse)?;
    if !scores_value
        .get("novelty")
        .map(|n| n.is_number())
        .unwrap_or(false)
    {
        return Err(CrawlError::InvalidLlmResponse);
    }

    let scores = Scores {
        novelty: score_field(scores_value, "novelty")?,
        importance: score_field(scores_value, "importance")?,
        reliability: score_field(scores_value, "reliability")?,
        context_value: score_field(scores_value, "contextValue")?,
        thought_provoking: score_field(scores_value, "thoughtProvoking")?,
    };

    let translated_title = string_field(&value, "translatedTitle")?;
    let summary = string_field(&value, "summary")?;
    let short_summary = string_field(&value, "shortSummary")?;

    Ok(Evaluation {
        translated_title,
        summary,
        short_summary,
        average_score: scores.average(),
        scores,
    })
}

fn score_field(scores: &serde_json::Value, key: &str) -> Result<i64, CrawlError> {
    let number = scores
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or(CrawlError::InvalidLlmResponse)?;
    Ok(number.round() as i64)
}

fn string_field(value: &serde_json::Value, key: &str) -> Result<String, CrawlError> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or(CrawlError::InvalidLlmResponse)
}
