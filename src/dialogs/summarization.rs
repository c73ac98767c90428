//! History summarization.
//!
//! When the prepared prompt grows past a token threshold, older turns are
//! collapsed into a persisted summary and only the trailing window of
//! messages is sent verbatim. The summary is reused and extended on later
//! turns.

use anyhow::Result;

use super::store::DialogStore;
use super::types::{MessageRole, StoredMessage};
use crate::llm::{ChatMessage, ChatProvider, Workload};

/// Messages kept verbatim after the summarized prefix.
pub const KEEP_LAST_MESSAGES: usize = 8;

/// Estimated-token threshold that triggers summarization.
pub const SUMMARY_TOKEN_THRESHOLD: usize = 24_000;

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Total estimated tokens across message contents.
pub fn estimate_messages_tokens(messages: &[StoredMessage]) -> usize {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// Whether the history needs (re)summarizing before the next LLM call.
pub fn should_summarize(messages: &[StoredMessage], already_summarized: i64) -> bool {
    if messages.len() <= KEEP_LAST_MESSAGES {
        return false;
    }
    let start = (already_summarized.max(0) as usize).min(messages.len());
    estimate_messages_tokens(&messages[start..]) > SUMMARY_TOKEN_THRESHOLD
}

const SUMMARY_SYSTEM: &str = "You condense coding-assistant conversations. Produce a \
compact summary that preserves: the user's goals, decisions taken, files created or \
modified, commands run and their outcomes, and any unresolved problems. Write plain \
prose, no preamble.";

/// Summarize the prefix of a dialog, merging with any previous summary.
///
/// Returns `(summary_text, summarized_count)` and persists it.
pub async fn summarize_history(
    provider: &dyn ChatProvider,
    store: &DialogStore,
    dialog_id: &str,
    messages: &[StoredMessage],
) -> Result<(String, i64)> {
    let existing = store.load_summary(dialog_id).await?;
    let keep_from = messages.len().saturating_sub(KEEP_LAST_MESSAGES);
    let start = existing
        .as_ref()
        .map(|s| s.summarized_count.max(0) as usize)
        .unwrap_or(0)
        .min(keep_from);
    let to_summarize = &messages[start..keep_from];

    if to_summarize.is_empty() {
        if let Some(existing) = existing {
            return Ok((existing.summary_text, existing.summarized_count));
        }
        return Ok((String::new(), 0));
    }

    let mut transcript = String::new();
    if let Some(existing) = &existing {
        transcript.push_str("Previous summary:\n");
        transcript.push_str(&existing.summary_text);
        transcript.push_str("\n\nNew turns to fold in:\n");
    }
    for message in to_summarize {
        match message.role {
            MessageRole::User => {
                transcript.push_str(&format!("User: {}\n", message.content));
            }
            MessageRole::Assistant => {
                if !message.content.is_empty() {
                    transcript.push_str(&format!("Assistant: {}\n", message.content));
                }
                for call in &message.tool_calls {
                    transcript.push_str(&format!("Assistant called tool {}\n", call.name));
                }
            }
            MessageRole::Tool => {
                if let Some(result) = &message.tool_result {
                    transcript.push_str(&format!(
                        "Tool {} -> {}\n",
                        result.tool_name, result.summary
                    ));
                }
            }
            MessageRole::System => {}
        }
    }

    let request = vec![
        ChatMessage::system(SUMMARY_SYSTEM),
        ChatMessage::user(&transcript),
    ];
    let summary = provider
        .generate(Workload::Summarization, &request)
        .await?
        .trim()
        .to_string();

    let summarized_count = keep_from as i64;
    store
        .save_summary(dialog_id, &summary, summarized_count)
        .await?;
    Ok((summary, summarized_count))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: MessageRole, content: &str) -> StoredMessage {
        StoredMessage {
            idx: 0,
            role,
            content: content.into(),
            checkpoint_id: None,
            session_name: None,
            tool_calls: Vec::new(),
            tool_result: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn token_estimate_is_quarter_of_chars() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn short_histories_never_summarize() {
        let messages: Vec<StoredMessage> = (0..KEEP_LAST_MESSAGES)
            .map(|_| message(MessageRole::User, &"x".repeat(200_000)))
            .collect();
        assert!(!should_summarize(&messages, 0));
    }

    #[test]
    fn long_histories_trigger_over_threshold() {
        // 20 messages of 25k chars each: well past the threshold.
        let messages: Vec<StoredMessage> = (0..20)
            .map(|_| message(MessageRole::User, &"x".repeat(25_000)))
            .collect();
        assert!(should_summarize(&messages, 0));
    }

    #[test]
    fn small_histories_under_threshold_do_not_trigger() {
        let messages: Vec<StoredMessage> = (0..20)
            .map(|_| message(MessageRole::User, "short"))
            .collect();
        assert!(!should_summarize(&messages, 0));
    }
}
