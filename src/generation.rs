//! Text-to-SQL generation step.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command};

#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub question: &'a str,
    pub dialect: &'a str,
    pub schema_context: &'a str,
    pub top_k: usize,
}

/// Turns a question plus schema context into SQL text. The text may still be
/// wrapped in markdown fences; cleanup is the caller's job.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String>;
}

pub fn build_prompt(request: &GenerationRequest<'_>) -> String {
    format!(
        "You are a {dialect} expert. Given an input question, create a syntactically correct \
{dialect} query to run.\n\
Unless the user specifies in the question a specific number of examples to obtain, query for \
at most {top_k} results using the LIMIT clause as per {dialect}. Never query for all columns \
from a table; only ask for the columns needed to answer the question, and wrap each column \
name in double quotes to mark it as a delimited identifier.\n\
Only use column names you can see in the tables below and pay attention to which column is in \
which table.\n\
Respond with the SQL query only, without explanation.\n\n\
Only use the following tables:\n{schema}\n\n\
Question: {question}",
        dialect = request.dialect,
        top_k = request.top_k,
        schema = request.schema_context,
        question = request.question,
    )
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatCompletionMessage<'a>>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    error: Option<ChatCompletionError>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionContent,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionError {
    message: String,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct ChatCompletionsGenerator {
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout_seconds: u64,
}

impl ChatCompletionsGenerator {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            timeout_seconds,
        }
    }
}

#[async_trait]
impl SqlGenerator for ChatCompletionsGenerator {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String> {
        let Some(api_key) = self.api_key.as_deref() else {
            anyhow::bail!("No language model API key configured");
        };

        let prompt = build_prompt(request);
        let payload = ChatCompletionRequest {
            model: &self.model,
            temperature: 0.0,
            messages: vec![ChatCompletionMessage {
                role: "user",
                content: &prompt,
            }],
        };
        let body = serde_json::to_string(&payload)
            .context("Failed to encode chat completion payload")?;
        let url = format!("{}/chat/completions", self.base_url);

        let raw = execute_curl_json(&url, api_key, body, self.timeout_seconds).await?;
        let parsed: ChatCompletionResponse = serde_json::from_str(&raw).with_context(|| {
            format!("Failed to parse chat completion response: {}", raw.trim())
        })?;
        parse_completion(parsed)
    }
}

fn parse_completion(response: ChatCompletionResponse) -> Result<String> {
    if let Some(error) = response.error {
        anyhow::bail!("Language model returned an error: {}", error.message);
    }
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .context("Language model returned no completion")
}

/// Runs curl with its whole request read from a `--config -` document on
/// stdin. The key and the payload never reach the argument list, which is
/// both size-capped and visible to other processes.
async fn execute_curl_json(
    url: &str,
    api_key: &str,
    body: String,
    timeout_seconds: u64,
) -> Result<String> {
    let config = curl_config(url, api_key, &body);

    let mut child = Command::new("curl")
        .arg("-sS")
        .arg("--max-time")
        .arg(timeout_seconds.max(1).to_string())
        .arg("--config")
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to execute curl for {url}"))?;

    let mut stdin = child
        .stdin
        .take()
        .context("curl stdin was not captured")?;
    stdin
        .write_all(config.as_bytes())
        .await
        .context("Failed to stream request to curl")?;
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("Failed waiting for curl for {url}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("Chat completion request failed: {}", stderr.trim());
    }

    String::from_utf8(output.stdout).context("Chat completion response was not valid UTF-8")
}

fn curl_config(url: &str, api_key: &str, body: &str) -> String {
    format!(
        "url = \"{}\"\n\
request = \"POST\"\n\
header = \"Authorization: Bearer {}\"\n\
header = \"Content-Type: application/json\"\n\
data-binary = \"{}\"\n",
        config_quote(url),
        config_quote(api_key),
        config_quote(body),
    )
}

/// Escapes a value for a double-quoted curl config string.
fn config_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest<'static> {
        GenerationRequest {
            question: "How many orders per region?",
            dialect: "SQLite",
            schema_context: "CREATE TABLE orders (id INTEGER, region TEXT)",
            top_k: 5,
        }
    }

    #[test]
    fn prompt_carries_dialect_schema_limit_and_question() {
        let prompt = build_prompt(&request());
        assert!(prompt.starts_with("You are a SQLite expert."));
        assert!(prompt.contains("at most 5 results"));
        assert!(prompt.contains("CREATE TABLE orders (id INTEGER, region TEXT)"));
        assert!(prompt.ends_with("Question: How many orders per region?"));
    }

    #[test]
    fn completion_content_is_extracted() {
        let parsed: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"SELECT 1"}}]}"#,
        )
        .expect("json");
        assert_eq!(parse_completion(parsed).expect("content"), "SELECT 1");
    }

    #[test]
    fn provider_errors_and_empty_completions_fail() {
        let parsed: ChatCompletionResponse =
            serde_json::from_str(r#"{"error":{"message":"quota exceeded"}}"#).expect("json");
        let err = parse_completion(parsed).expect_err("error");
        assert!(err.to_string().contains("quota exceeded"));

        let parsed: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"  "}}]}"#).expect("json");
        assert!(parse_completion(parsed).is_err());
    }

    #[test]
    fn config_document_quotes_every_value() {
        let config = curl_config(
            "http://llm.local/v1/chat/completions",
            "sk-\"x\"",
            "{\"content\":\"a\\\\b\\nc\"}",
        );

        assert!(config.contains("url = \"http://llm.local/v1/chat/completions\"\n"));
        assert!(config.contains("header = \"Authorization: Bearer sk-\\\"x\\\"\"\n"));
        assert!(config.contains(r#"data-binary = "{\"content\":\"a\\\\b\\nc\"}""#));
        assert_eq!(config.lines().count(), 5);
    }

    #[tokio::test]
    async fn oversized_payloads_still_reach_curl() {
        let schema = format!(
            "CREATE TABLE wide ({});",
            (0..6_000)
                .map(|i| format!("column_{i:05} TEXT"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        assert!(schema.len() > 128 * 1024);
        let request = GenerationRequest {
            schema_context: &schema,
            ..request()
        };
        let generator = ChatCompletionsGenerator::new(
            "http://127.0.0.1:9/v1".to_string(),
            Some("sk-test".to_string()),
            "gpt-4-turbo-preview".to_string(),
            2,
        );

        let err = generator.generate(&request).await.expect_err("nothing listens");
        let message = format!("{err:#}");
        assert!(!message.contains("Argument list too long"), "{message}");
        assert!(message.contains("Chat completion request failed"), "{message}");
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_any_request() {
        let generator = ChatCompletionsGenerator::new(
            "http://127.0.0.1:9/v1/".to_string(),
            None,
            "gpt-4-turbo-preview".to_string(),
            5,
        );
        let err = generator.generate(&request()).await.expect_err("no key");
        assert!(err.to_string().contains("API key"));
    }
}
