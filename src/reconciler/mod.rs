//! Turns the model's raw stream into a live projection and a finished message.

pub mod directive;
pub mod finalize;

use serde::{ Serialize, Deserialize };

use crate::llm::Tier;
use crate::models::action::Action;

/// Number of thinking steps a pro answer is expected to announce.
pub const EXPECTED_THINKING_STEPS: usize = 8;
/// Ceiling for the progress bar until the stream has ended.
pub const STREAMING_PROGRESS_CAP: u8 = 90;
pub const EMPTY_ANSWER_PLACEHOLDER: &str = "...";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingProgress {
    pub steps: Vec<String>,
    pub percentage: u8,
}

/// What changed after one chunk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkUpdate {
    /// Set once, the first time an auto specialist tag shows up.
    pub specialist: Option<String>,
    /// Pro tier only.
    pub progress: Option<ThinkingProgress>,
    /// Base tier only.
    pub visible_text: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Finalization {
    pub text: String,
    pub action: Option<Action>,
    pub image_prompt: Option<String>,
}

#[derive(Debug)]
pub struct StreamReconciler {
    tier: Tier,
    specialist_locked: bool,
    specialist_activated: Option<String>,
    buffer: String,
    progress: ThinkingProgress,
}

impl StreamReconciler {
    /// `specialist_locked` is set when a specialist mode was chosen explicitly
    /// for this exchange; auto activation is then off.
    pub fn new(tier: Tier, specialist_locked: bool) -> Self {
        Self {
            tier,
            specialist_locked: specialist_locked || tier.is_elevated(),
            specialist_activated: None,
            buffer: String::new(),
            progress: ThinkingProgress::default(),
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn progress(&self) -> &ThinkingProgress {
        &self.progress
    }

    pub fn auto_specialist(&self) -> Option<&str> {
        self.specialist_activated.as_deref()
    }

    /// Seeds the step list shown before the first chunk.
    pub fn progress_start(&mut self, label: &str) -> ThinkingProgress {
        self.progress = ThinkingProgress {
            steps: vec![label.to_string()],
            percentage: 0,
        };
        self.progress.clone()
    }

    pub fn push(&mut self, chunk: &str) -> ChunkUpdate {
        self.buffer.push_str(chunk);
        let mut update = ChunkUpdate::default();

        if !self.specialist_locked && self.specialist_activated.is_none() {
            if let Some(subject) = directive::auto_specialist_subject(&self.buffer) {
                self.specialist_activated = Some(subject.clone());
                update.specialist = Some(subject);
            }
        }

        if self.tier.is_elevated() {
            let matched = directive::thinking_steps(&self.buffer);
            let percentage = (matched.len() * 100) / EXPECTED_THINKING_STEPS;
            let percentage = percentage.min(STREAMING_PROGRESS_CAP as usize) as u8;
            for step in matched {
                if !self.progress.steps.contains(&step) {
                    self.progress.steps.push(step);
                }
            }
            self.progress.percentage = self.progress.percentage.max(percentage);
            update.progress = Some(self.progress.clone());
        } else {
            update.visible_text = Some(directive::strip_live(&self.buffer));
        }

        update
    }

    /// Closes the step list once the stream has ended.
    pub fn progress_complete(&mut self, label: &str) -> ThinkingProgress {
        if !self.progress.steps.iter().any(|s| s == label) {
            self.progress.steps.push(label.to_string());
        }
        self.progress.percentage = 100;
        self.progress.clone()
    }

    pub fn finish(&self) -> Finalization {
        let text = directive::strip_final(&self.buffer);
        Finalization {
            text: if text.is_empty() { EMPTY_ANSWER_PLACEHOLDER.to_string() } else { text },
            action: directive::action_payload(&self.buffer).and_then(directive::parse_action),
            image_prompt: directive::last_image_prompt(&self.buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_tier_projects_clean_text() {
        let mut rec = StreamReconciler::new(Tier::Standard, false);
        let first = rec.push("<thinking step=\"a\" />He");
        assert_eq!(first.visible_text.as_deref(), Some("He"));
        assert!(first.progress.is_none());
        let second = rec.push("llo <generate_image prompt=\"cat\"/> world");
        assert_eq!(second.visible_text.as_deref(), Some("Hello  world"));

        let done = rec.finish();
        assert_eq!(done.text, "Hello  world");
        assert_eq!(done.image_prompt.as_deref(), Some("cat"));
        assert_eq!(done.action, None);
    }

    #[test]
    fn pro_tier_reports_progress_only() {
        let mut rec = StreamReconciler::new(Tier::Pro, false);
        rec.progress_start("starting");
        let update = rec.push("<thinking step=\"a\" />text");
        assert!(update.visible_text.is_none());
        let progress = update.progress.unwrap();
        assert_eq!(progress.steps, vec!["starting".to_string(), "a".to_string()]);
        assert_eq!(progress.percentage, 12);
    }

    #[test]
    fn repeated_labels_do_not_grow_the_list() {
        let mut rec = StreamReconciler::new(Tier::Pro, false);
        rec.push("<thinking step=\"a\" /><thinking step=\"a\" />");
        let update = rec.push("<thinking step=\"A\" /><thinking step=\"a\" />");
        assert_eq!(update.progress.unwrap().steps, vec!["a".to_string(), "A".to_string()]);
    }

    #[test]
    fn progress_is_monotonic_and_capped() {
        let mut rec = StreamReconciler::new(Tier::Pro, false);
        let mut last = 0;
        for i in 0..20 {
            let update = rec.push(&format!("<thinking step=\"s{}\" />", i));
            let pct = update.progress.unwrap().percentage;
            assert!(pct >= last);
            assert!(pct <= STREAMING_PROGRESS_CAP);
            last = pct;
        }
        assert_eq!(last, STREAMING_PROGRESS_CAP);
        assert_eq!(rec.progress_complete("final").percentage, 100);
    }

    #[test]
    fn auto_specialist_fires_once() {
        let mut rec = StreamReconciler::new(Tier::Standard, false);
        assert_eq!(rec.push("<auto_specialist_mode subj").specialist, None);
        let update = rec.push("ect=\"chemist\">Acids");
        assert_eq!(update.specialist.as_deref(), Some("chemist"));
        assert_eq!(update.visible_text.as_deref(), Some("Acids"));
        let later = rec.push("<auto_specialist_mode subject=\"biologist\"></auto_specialist_mode>");
        assert_eq!(later.specialist, None);
        assert_eq!(rec.auto_specialist(), Some("chemist"));
    }

    #[test]
    fn auto_specialist_is_off_when_locked_or_pro() {
        let tag = "<auto_specialist_mode subject=\"chemist\">x";
        assert_eq!(StreamReconciler::new(Tier::Standard, true).push(tag).specialist, None);
        assert_eq!(StreamReconciler::new(Tier::Pro, false).push(tag).specialist, None);
    }

    #[test]
    fn empty_answer_gets_placeholder() {
        let mut rec = StreamReconciler::new(Tier::Standard, false);
        rec.push("<thinking step=\"only\" />  ");
        assert_eq!(rec.finish().text, EMPTY_ANSWER_PLACEHOLDER);
    }

    #[test]
    fn malformed_action_finishes_without_action() {
        let mut rec = StreamReconciler::new(Tier::Standard, false);
        rec.push("Sure. <action>{not json}</action>");
        let done = rec.finish();
        assert_eq!(done.action, None);
        assert_eq!(done.text, "Sure.");
    }

    #[test]
    fn split_at_every_offset_yields_same_final_text() {
        let full = "<thinking step=\"a\" />Hello <generate_image prompt=\"cat\" /> <action>{\"type\":\"call\",\"number\":\"1\"}</action>world";
        for (i, _) in full.char_indices() {
            let mut rec = StreamReconciler::new(Tier::Standard, false);
            rec.push(&full[..i]);
            rec.push(&full[i..]);
            let done = rec.finish();
            assert_eq!(done.text, "Hello  world", "split at {}", i);
            assert_eq!(done.image_prompt.as_deref(), Some("cat"));
            assert_eq!(done.action, Some(Action::Call { number: "1".into() }));
        }
    }
}
