//! Decision cycle reconstruction
//!
//! A cycle is the span of a session's chat log that starts at a `system`
//! message and runs up to (excluding) the next one. The agent writes a fresh
//! system prompt at the top of every decision, so the cycle that was active
//! when a strategy was logged is the one opened by the latest system message
//! at or before the strategy's timestamp.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::types::{ChatMessage, DecisionCycle, PromptMessage, Role};

/// Chat log indexed by session
#[derive(Debug, Clone, Default)]
pub struct CycleSegmenter {
    sessions: HashMap<String, Vec<ChatMessage>>,
}

impl CycleSegmenter {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        let mut sessions: HashMap<String, Vec<ChatMessage>> = HashMap::new();
        for msg in messages {
            sessions.entry(msg.session_id.clone()).or_default().push(msg);
        }
        for msgs in sessions.values_mut() {
            msgs.sort_by_key(|m| m.sequence_id);
        }
        Self { sessions }
    }

    /// Cycle active at `reference`, if any system message precedes it
    pub fn segment(&self, session_id: &str, reference: DateTime<Utc>) -> Option<DecisionCycle> {
        let messages = self.sessions.get(session_id)?;

        let anchor = messages
            .iter()
            .filter(|m| m.role == Role::System && m.timestamp <= reference)
            .max_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then(a.sequence_id.cmp(&b.sequence_id))
            })?;

        // Sorted by id, so the first later system message closes the span
        let next_anchor = messages
            .iter()
            .find(|m| m.role == Role::System && m.sequence_id > anchor.sequence_id);

        let mut span: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| {
                m.sequence_id >= anchor.sequence_id
                    && next_anchor.map_or(true, |next| m.sequence_id < next.sequence_id)
            })
            .cloned()
            .collect();

        if span.is_empty() {
            return None;
        }
        span.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.sequence_id.cmp(&b.sequence_id))
        });

        let end_timestamp = next_anchor.and(span.last().map(|m| m.timestamp));

        debug!(
            session = session_id,
            anchor_id = anchor.sequence_id,
            messages = span.len(),
            closed = end_timestamp.is_some(),
            "Cycle segmented"
        );

        Some(DecisionCycle {
            session_id: session_id.to_string(),
            start_timestamp: anchor.timestamp,
            end_timestamp,
            messages: span,
        })
    }
}

/// Where a cycle is cut before it becomes a training sample
#[derive(Debug, Clone)]
pub struct SentinelRule {
    /// Phrase marking the user message that ends the sample
    pub phrase: String,
    /// Keep the single message following the sentinel
    pub keep_reply: bool,
}

impl SentinelRule {
    pub fn new(phrase: impl Into<String>, keep_reply: bool) -> Self {
        Self {
            phrase: phrase.into(),
            keep_reply,
        }
    }

    /// Messages up to and including the first sentinel user message
    pub fn truncate<'a>(&self, messages: &'a [ChatMessage]) -> &'a [ChatMessage] {
        let cut = messages
            .iter()
            .position(|m| m.role == Role::User && m.content.contains(&self.phrase));

        match cut {
            Some(idx) => {
                let end = if self.keep_reply { idx + 2 } else { idx + 1 };
                &messages[..end.min(messages.len())]
            }
            None => messages,
        }
    }

    /// Prompt (system/user only) and trailing response of a cycle
    pub fn split(&self, cycle: &DecisionCycle) -> Option<CycleSample> {
        let kept = self.truncate(&cycle.messages);
        if kept.len() < 2 {
            return None;
        }
        let (response, history) = kept.split_last()?;

        Some(CycleSample {
            session_id: cycle.session_id.clone(),
            prompt: history
                .iter()
                .filter(|m| m.role.is_prompt_role())
                .map(PromptMessage::from)
                .collect(),
            response: PromptMessage::from(response),
            start_timestamp: cycle.start_timestamp,
        })
    }
}

/// Prompt/response view of a truncated cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSample {
    pub session_id: String,
    pub prompt: Vec<PromptMessage>,
    pub response: PromptMessage,
    pub start_timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn msg(id: i64, role: Role, at: DateTime<Utc>, content: &str) -> ChatMessage {
        ChatMessage {
            sequence_id: id,
            session_id: "agent_007".to_string(),
            role,
            content: content.to_string(),
            timestamp: at,
        }
    }

    fn log() -> Vec<ChatMessage> {
        vec![
            msg(1, Role::System, t(0), "sys0"),
            msg(2, Role::User, t(1), "user1"),
            msg(3, Role::Assistant, t(2), "asst2"),
            msg(4, Role::System, t(3), "sys3"),
            msg(5, Role::User, t(4), "user4"),
        ]
    }

    fn ids(cycle: &DecisionCycle) -> Vec<i64> {
        cycle.messages.iter().map(|m| m.sequence_id).collect()
    }

    #[test]
    fn segments_around_system_anchors() {
        let segmenter = CycleSegmenter::new(log());

        let first = segmenter.segment("agent_007", t(2)).unwrap();
        assert_eq!(ids(&first), vec![1, 2, 3]);
        assert_eq!(first.start_timestamp, t(0));
        assert_eq!(first.end_timestamp, Some(t(2)));

        let second = segmenter.segment("agent_007", t(4)).unwrap();
        assert_eq!(ids(&second), vec![4, 5]);
        assert_eq!(second.end_timestamp, None);
    }

    #[test]
    fn no_anchor_before_reference() {
        let segmenter = CycleSegmenter::new(log());
        assert!(segmenter.segment("agent_007", t(-1)).is_none());
        assert!(segmenter.segment("other_agent", t(10)).is_none());
    }

    #[test]
    fn timestamp_ties_pick_highest_id() {
        let mut messages = log();
        messages.push(msg(6, Role::System, t(3), "sys3-bis"));
        messages.push(msg(7, Role::User, t(5), "user5"));
        let segmenter = CycleSegmenter::new(messages);

        let cycle = segmenter.segment("agent_007", t(6)).unwrap();
        assert_eq!(ids(&cycle), vec![6, 7]);
    }

    #[test]
    fn cycles_never_contain_a_second_system_message() {
        let segmenter = CycleSegmenter::new(log());
        for minute in 0..6 {
            if let Some(cycle) = segmenter.segment("agent_007", t(minute)) {
                assert_eq!(cycle.messages[0].role, Role::System);
                let systems = cycle
                    .messages
                    .iter()
                    .filter(|m| m.role == Role::System)
                    .count();
                assert_eq!(systems, 1);
            }
        }
    }

    #[test]
    fn span_is_ordered_by_timestamp_then_id() {
        // Ids 3 and 4 were written late; 5 shares 2's timestamp
        let messages = vec![
            msg(1, Role::System, t(0), "sys"),
            msg(2, Role::User, t(2), "question"),
            msg(3, Role::Assistant, t(4), "late answer"),
            msg(4, Role::User, t(1), "early note"),
            msg(5, Role::Assistant, t(2), "same minute"),
            msg(6, Role::System, t(10), "next"),
        ];
        let segmenter = CycleSegmenter::new(messages);

        let cycle = segmenter.segment("agent_007", t(5)).unwrap();
        assert_eq!(ids(&cycle), vec![1, 4, 2, 5, 3]);
        assert_eq!(cycle.end_timestamp, Some(t(4)));

        let rule = SentinelRule::new("sentinel", false);
        let sample = rule.split(&cycle).unwrap();
        assert_eq!(sample.response.content, "late answer");
    }

    #[test]
    fn keep_reply_with_trailing_sentinel_keeps_whole_list() {
        let messages = vec![
            msg(1, Role::System, t(0), "sys"),
            msg(2, Role::Assistant, t(1), "strategy"),
            msg(3, Role::User, t(2), "You just learnt the following information: fills"),
        ];
        let rule = SentinelRule::new("You just learnt the following information", true);
        let kept = rule.truncate(&messages);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept.last().unwrap().sequence_id, 3);
    }

    #[test]
    fn sentinel_cuts_after_the_marked_user_message() {
        let messages = vec![
            msg(1, Role::System, t(0), "sys"),
            msg(2, Role::User, t(1), "market data"),
            msg(3, Role::Assistant, t(2), "strategy"),
            msg(4, Role::User, t(3), "You just learnt the following information: fills"),
            msg(5, Role::Assistant, t(4), "noted"),
            msg(6, Role::User, t(5), "more"),
        ];
        let rule = SentinelRule::new("You just learnt the following information", false);
        assert_eq!(rule.truncate(&messages).len(), 4);

        let with_reply = SentinelRule::new("You just learnt the following information", true);
        assert_eq!(with_reply.truncate(&messages).len(), 5);

        let none = SentinelRule::new("absent phrase", false);
        assert_eq!(none.truncate(&messages).len(), 6);
    }

    #[test]
    fn split_keeps_prompt_roles_and_last_message() {
        let segmenter = CycleSegmenter::new(log());
        let cycle = segmenter.segment("agent_007", t(2)).unwrap();
        let rule = SentinelRule::new("You just learnt the following information", false);

        let sample = rule.split(&cycle).unwrap();
        assert_eq!(sample.prompt.len(), 2);
        assert!(sample.prompt.iter().all(|m| m.role.is_prompt_role()));
        assert_eq!(sample.response.role, Role::Assistant);
        assert_eq!(sample.response.content, "asst2");
    }

    #[test]
    fn single_message_cycle_is_not_a_sample() {
        let segmenter = CycleSegmenter::new(vec![msg(1, Role::System, t(0), "sys")]);
        let cycle = segmenter.segment("agent_007", t(1)).unwrap();
        let rule = SentinelRule::new("sentinel", false);
        assert!(rule.split(&cycle).is_none());
    }
}
