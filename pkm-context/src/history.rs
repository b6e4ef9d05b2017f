use pkm_llm::{ContentBlock, Message, Role, TokenEstimator};
use serde::Serialize;
use std::ops::Range;
use std::sync::Arc;

const PLACEHOLDER_PREFIX: &str = "[tool result truncated";
const LARGEST_MESSAGES_REPORTED: usize = 5;

/// Result of one budgeting pass.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncatedHistory {
    pub messages: Vec<Message>,
    pub estimated_tokens: usize,
    /// The preserved window alone does not fit the budget.
    pub over_budget: bool,
    pub placeholders: usize,
    pub dropped_messages: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageSize {
    pub index: usize,
    pub role: Role,
    pub tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub total_tokens: usize,
    pub message_count: usize,
    pub turn_count: usize,
    pub token_budget: usize,
    pub over_budget: bool,
    pub largest_messages: Vec<MessageSize>,
}

/// Fits a conversation into a token budget.
///
/// Work happens at turn granularity: a turn is a user text message plus every assistant
/// and tool message up to the next one, so a tool call is never separated from its result.
/// Precedence is fixed: the newest `preserve_turns` turns are never touched, then
/// oversized tool results in older turns become placeholders, then the oldest whole turns
/// are dropped.
#[derive(Clone)]
pub struct HistoryBudgeter {
    estimator: Arc<dyn TokenEstimator>,
    tool_result_threshold: usize,
}

impl HistoryBudgeter {
    pub fn new(estimator: Arc<dyn TokenEstimator>, tool_result_threshold: usize) -> Self {
        Self {
            estimator,
            tool_result_threshold,
        }
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    pub fn estimate(&self, messages: &[Message]) -> usize {
        messages.iter().map(Message::token_estimate).sum()
    }

    pub fn truncate(
        &self,
        history: &[Message],
        token_budget: usize,
        preserve_turns: usize,
    ) -> TruncatedHistory {
        let mut messages = history.to_vec();
        for m in &mut messages {
            m.refresh_token_estimate(self.estimator());
        }
        let mut total = self.estimate(&messages);
        if total <= token_budget {
            return TruncatedHistory {
                messages,
                estimated_tokens: total,
                over_budget: false,
                placeholders: 0,
                dropped_messages: 0,
            };
        }

        let turns = turn_ranges(&messages);
        let window_start = preserved_window_start(&turns, messages.len(), preserve_turns);

        let mut placeholders = 0;
        for message in &mut messages[..window_start] {
            placeholders += self.placeholder_large_results(message);
        }
        total = self.estimate(&messages);

        let mut drop_until = 0;
        if total > token_budget {
            for turn in turns.iter().filter(|t| t.end <= window_start) {
                if total <= token_budget {
                    break;
                }
                total -= self.estimate(&messages[turn.clone()]);
                drop_until = turn.end;
            }
        }
        messages.drain(..drop_until);

        let over_budget = total > token_budget;
        if over_budget {
            tracing::warn!(
                estimated_tokens = total,
                token_budget,
                preserve_turns,
                "preserved history window exceeds token budget"
            );
        } else if placeholders > 0 || drop_until > 0 {
            tracing::debug!(
                estimated_tokens = total,
                token_budget,
                placeholders,
                dropped_messages = drop_until,
                "history truncated"
            );
        }

        TruncatedHistory {
            messages,
            estimated_tokens: total,
            over_budget,
            placeholders,
            dropped_messages: drop_until,
        }
    }

    /// Returns how many blocks were replaced.
    fn placeholder_large_results(&self, message: &mut Message) -> usize {
        let targets: Vec<(usize, ContentBlock)> = message
            .content()
            .iter()
            .enumerate()
            .filter_map(|(i, block)| match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } if !content.starts_with(PLACEHOLDER_PREFIX) => {
                    let tokens = self.estimator.estimate(content);
                    if tokens <= self.tool_result_threshold {
                        return None;
                    }
                    let placeholder = format!(
                        "{PLACEHOLDER_PREFIX}: originally ~{tokens} tokens ({} bytes)]",
                        content.len()
                    );
                    (self.estimator.estimate(&placeholder) < tokens).then(|| {
                        (i, ContentBlock::tool_result(tool_use_id.clone(), placeholder, *is_error))
                    })
                }
                _ => None,
            })
            .collect();

        let replaced = targets.len();
        for (i, block) in targets {
            message.replace_block(i, block, self.estimator());
        }
        replaced
    }

    pub fn stats(&self, history: &[Message], token_budget: usize) -> HistoryStats {
        let sizes: Vec<MessageSize> = history
            .iter()
            .enumerate()
            .map(|(index, m)| MessageSize {
                index,
                role: m.role,
                tokens: m
                    .content()
                    .iter()
                    .map(|b| b.estimate_tokens(self.estimator()))
                    .sum::<usize>()
                    .max(1),
            })
            .collect();
        let total_tokens = sizes.iter().map(|s| s.tokens).sum();
        let mut largest_messages = sizes;
        largest_messages.sort_by(|a, b| b.tokens.cmp(&a.tokens).then(a.index.cmp(&b.index)));
        largest_messages.truncate(LARGEST_MESSAGES_REPORTED);

        HistoryStats {
            total_tokens,
            message_count: history.len(),
            turn_count: history.iter().filter(|m| m.starts_turn()).count(),
            token_budget,
            over_budget: total_tokens > token_budget,
            largest_messages,
        }
    }
}

/// Splits messages into turns. Messages before the first user text message form a
/// leading unit of their own.
fn turn_ranges(messages: &[Message]) -> Vec<Range<usize>> {
    let mut starts: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.starts_turn())
        .map(|(i, _)| i)
        .collect();
    if starts.first() != Some(&0) && !messages.is_empty() {
        starts.insert(0, 0);
    }
    starts
        .iter()
        .enumerate()
        .map(|(n, &start)| {
            let end = starts.get(n + 1).copied().unwrap_or(messages.len());
            start..end
        })
        .collect()
}

fn preserved_window_start(turns: &[Range<usize>], len: usize, preserve_turns: usize) -> usize {
    if preserve_turns == 0 {
        return len;
    }
    if turns.len() <= preserve_turns {
        return 0;
    }
    turns[turns.len() - preserve_turns].start
}
