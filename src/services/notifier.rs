use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::json;

use crate::error::CrawlError;
use crate::models::Evaluation;

/// Posts high-scoring evaluations to the configured webhook channel.
pub struct Notifier {
    client: Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            webhook_url,
        }
    }

    /// Post one evaluation. Silent no-op when no webhook is configured;
    /// a non-2xx reply is logged and swallowed. Only transport failures
    /// surface to the caller.
    pub async fn notify(
        &self,
        article_url: &str,
        source_url: &str,
        evaluation: &Evaluation,
        image_url: Option<&str>,
    ) -> Result<(), CrawlError> {
        let Some(webhook_url) = &self.webhook_url else {
            return Ok(());
        };

        let payload = build_payload(article_url, source_url, evaluation, image_url);

        let response = self
            .client
            .post(webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CrawlError::Timeout
                } else {
                    CrawlError::Transport(format!("Webhook request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            tracing::warn!(
                "Webhook returned HTTP {} for {}",
                response.status(),
                article_url
            );
        }
        Ok(())
    }
}

pub fn build_payload(
    article_url: &str,
    source_url: &str,
    evaluation: &Evaluation,
    image_url: Option<&str>,
) -> serde_json::Value {
    let mut embed = json!({
        "title": evaluation.translated_title,
        "url": article_url,
        "description": evaluation.short_summary,
        "fields": [
            {
                "name": "Scores",
                "value": format_scores(evaluation),
                "inline": true
            },
            {
                "name": "Source",
                "value": source_url,
                "inline": false
            }
        ],
        "color": embed_color(evaluation.average_score),
        "timestamp": Utc::now().to_rfc3339(),
    });

    if let Some(image) = image_url {
        embed["image"] = json!({ "url": image });
    }

    json!({ "embeds": [embed] })
}

/// `Avg: 4.20 (N:5 I:4 R:4 C:3 T:5)`
pub fn format_scores(evaluation: &Evaluation) -> String {
    let s = &evaluation.scores;
    format!(
        "Avg: {:.2} (N:{} I:{} R:{} C:{} T:{})",
        evaluation.average_score,
        s.novelty,
        s.importance,
        s.reliability,
        s.context_value,
        s.thought_provoking
    )
}

fn embed_color(average_score: f64) -> u32 {
    if average_score >= 4.5 {
        0xE74C3C
    } else if average_score >= 4.0 {
        0xE67E22
    } else {
        0x3498DB
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scores;

    fn evaluation() -> Evaluation {
        let scores = Scores {
            novelty: 5,
            importance: 4,
            reliability: 4,
            context_value: 3,
            thought_provoking: 5,
        };
        Evaluation {
            translated_title: "T-ja".to_string(),
            summary: "要約".to_string(),
            short_summary: "S".to_string(),
            average_score: scores.average(),
            scores,
        }
    }

    #[test]
    fn scores_line_formats_average_to_two_places() {
        assert_eq!(
            format_scores(&evaluation()),
            "Avg: 4.20 (N:5 I:4 R:4 C:3 T:5)"
        );
    }

    #[test]
    fn payload_carries_embed_fields() {
        let payload = build_payload(
            "https://site.example/a",
            "https://news.google.com/rss/articles/x",
            &evaluation(),
            Some("https://img.example/i.png"),
        );

        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "T-ja");
        assert_eq!(embed["url"], "https://site.example/a");
        assert_eq!(embed["description"], "S");
        assert_eq!(embed["fields"][0]["name"], "Scores");
        assert_eq!(embed["fields"][0]["value"], "Avg: 4.20 (N:5 I:4 R:4 C:3 T:5)");
        assert_eq!(embed["fields"][0]["inline"], true);
        assert_eq!(embed["image"]["url"], "https://img.example/i.png");
    }

    #[test]
    fn payload_omits_image_when_absent() {
        let payload = build_payload("https://a", "https://a", &evaluation(), None);
        assert!(payload["embeds"][0].get("image").is_none());
    }

    #[tokio::test]
    async fn unset_webhook_is_a_silent_noop() {
        let notifier = Notifier::new(None);
        notifier
            .notify("https://a", "https://a", &evaluation(), None)
            .await
            .unwrap();
    }
}
