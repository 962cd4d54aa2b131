//! Token usage reported in upstream response bodies

use conduit_core::ChannelKind;
use conduit_store::TokenCounts;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Envelope {
    usage: Option<WireUsage>,
}

/// Union of the chat completions, responses and messages usage shapes
#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    prompt_tokens_details: Option<CachedDetails>,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    input_tokens_details: Option<CachedDetails>,
    cache_read_input_tokens: Option<i64>,
    cache_creation_input_tokens: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct CachedDetails {
    cached_tokens: Option<i64>,
}

/// Extract token counts from a JSON response body
///
/// Returns `Ok(None)` when the body is JSON but carries no usage block and
/// `Err` when it is not JSON at all.
pub(crate) fn parse(kind: ChannelKind, body: &[u8]) -> Result<Option<TokenCounts>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_slice(body)?;
    let Ok(Envelope { usage: Some(usage) }) = Envelope::deserialize(&value) else {
        return Ok(None);
    };

    let counts = match kind {
        // input_tokens excludes cache reads and writes on the messages API
        ChannelKind::Anthropic => {
            let cache_read = usage.cache_read_input_tokens.unwrap_or(0);
            let cache_write = usage.cache_creation_input_tokens.unwrap_or(0);
            TokenCounts {
                input: usage
                    .input_tokens
                    .unwrap_or(0)
                    .saturating_add(cache_read)
                    .saturating_add(cache_write),
                cached_input: cache_read,
                output: usage.output_tokens.unwrap_or(0),
                cached_output: 0,
            }
        }
        ChannelKind::OpenaiCompatible | ChannelKind::CodexOauth => {
            let cached = usage
                .prompt_tokens_details
                .or(usage.input_tokens_details)
                .and_then(|d| d.cached_tokens)
                .unwrap_or(0);
            TokenCounts {
                input: usage.prompt_tokens.or(usage.input_tokens).unwrap_or(0),
                cached_input: cached,
                output: usage.completion_tokens.or(usage.output_tokens).unwrap_or(0),
                cached_output: 0,
            }
        }
    };
    Ok(Some(counts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_completions_usage() {
        let body = br#"{"id":"x","usage":{"prompt_tokens":120,"completion_tokens":30,"prompt_tokens_details":{"cached_tokens":100}}}"#;
        let counts = parse(ChannelKind::OpenaiCompatible, body).unwrap().unwrap();
        assert_eq!(
            counts,
            TokenCounts {
                input: 120,
                cached_input: 100,
                output: 30,
                cached_output: 0,
            }
        );
    }

    #[test]
    fn responses_usage() {
        let body = br#"{"usage":{"input_tokens":50,"output_tokens":7,"input_tokens_details":{"cached_tokens":10}}}"#;
        let counts = parse(ChannelKind::CodexOauth, body).unwrap().unwrap();
        assert_eq!((counts.input, counts.cached_input, counts.output), (50, 10, 7));
    }

    #[test]
    fn messages_usage_adds_cache_tokens_to_input() {
        let body = br#"{"usage":{"input_tokens":5,"output_tokens":9,"cache_read_input_tokens":40,"cache_creation_input_tokens":3}}"#;
        let counts = parse(ChannelKind::Anthropic, body).unwrap().unwrap();
        assert_eq!((counts.input, counts.cached_input, counts.output), (48, 40, 9));
    }

    #[test]
    fn missing_usage_and_invalid_json() {
        assert!(parse(ChannelKind::OpenaiCompatible, br#"{"id":"x"}"#).unwrap().is_none());
        assert!(parse(ChannelKind::OpenaiCompatible, b"[1,2]").unwrap().is_none());
        assert!(parse(ChannelKind::OpenaiCompatible, b"<html>").is_err());
    }
}
