//! Inline control tags the model embeds in its answer.
//!
//! Every function here takes the whole text received so far; nothing depends
//! on where chunk boundaries fell.

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;

use crate::models::action::Action;

lazy_static! {
    static ref THINKING_STEP: Regex = Regex::new(r#"<thinking step="([^"]+)"\s*/>"#).unwrap();
    static ref GENERATE_IMAGE: Regex = Regex::new(r#"<generate_image prompt="([^"]+)"\s*/>"#).unwrap();
    static ref SPECIALIST_OPEN: Regex = Regex::new(r#"<auto_specialist_mode subject="([^"]+)">"#).unwrap();
    static ref SPECIALIST_CLOSE: Regex = Regex::new(r"</auto_specialist_mode>").unwrap();
    static ref ACTION: Regex = Regex::new(r"(?s)<action>(.*?)</action>").unwrap();
}

const ACTION_OPEN: &str = "<action>";

/// Leading text of every directive; used to recognise a tag still in flight.
const OPENERS: [&str; 5] = [
    "<thinking step=\"",
    "<generate_image prompt=\"",
    "<auto_specialist_mode subject=\"",
    "</auto_specialist_mode>",
    ACTION_OPEN,
];

/// Labels of all thinking steps, in order, duplicates included.
pub fn thinking_steps(buffer: &str) -> Vec<String> {
    THINKING_STEP.captures_iter(buffer)
        .map(|c| c[1].to_string())
        .collect()
}

/// Only the last image request counts.
pub fn last_image_prompt(buffer: &str) -> Option<String> {
    GENERATE_IMAGE.captures_iter(buffer)
        .last()
        .map(|c| c[1].to_string())
}

pub fn auto_specialist_subject(buffer: &str) -> Option<String> {
    SPECIALIST_OPEN.captures(buffer).map(|c| c[1].to_string())
}

pub fn action_payload(buffer: &str) -> Option<&str> {
    ACTION.captures(buffer)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Decodes an action body. Anything that is not a known action is logged and
/// dropped.
pub fn parse_action(payload: &str) -> Option<Action> {
    match serde_json::from_str::<Action>(payload.trim()) {
        Ok(action) => Some(action),
        Err(e) => {
            warn!("Failed to parse action JSON: {}", e);
            None
        }
    }
}

/// Removes every directive. The auto specialist tags go but the text they
/// wrap stays. Runs to a fixpoint so that removing one tag cannot splice a new
/// one together from its neighbours.
pub fn strip_directives(buffer: &str) -> String {
    let mut current = buffer.to_string();
    loop {
        let next = strip_once(&current);
        if next == current {
            return next;
        }
        current = next;
    }
}

fn strip_once(text: &str) -> String {
    let text = ACTION.replace_all(text, "");
    let text = THINKING_STEP.replace_all(&text, "");
    let text = GENERATE_IMAGE.replace_all(&text, "");
    let text = SPECIALIST_OPEN.replace_all(&text, "");
    SPECIALIST_CLOSE.replace_all(&text, "").into_owned()
}

/// Projection shown while the answer is still streaming: directives removed,
/// a directive that has started but not finished held back, leading
/// whitespace trimmed.
pub fn strip_live(buffer: &str) -> String {
    let mut text = strip_directives(buffer);

    // An action block with no closing tag yet; its JSON is never shown.
    if let Some(pos) = text.find(ACTION_OPEN) {
        text.truncate(pos);
    }

    if let Some(pos) = text.rfind('<') {
        let tail = &text[pos..];
        let in_flight = OPENERS.iter().any(|opener| {
            opener.starts_with(tail) || (tail.starts_with(opener) && !tail.ends_with('>'))
        });
        if in_flight {
            text.truncate(pos);
        }
    }

    text.trim_start().to_string()
}

/// Text of the finished message.
pub fn strip_final(buffer: &str) -> String {
    strip_directives(buffer).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_DIRECTIVES: &str = concat!(
        "<auto_specialist_mode subject=\"physicist\">",
        "<thinking step=\"read question\" />",
        "Light bends. ",
        "<generate_image prompt=\"prism\" />",
        "<action>{\"type\":\"open_url\",\"url\":\"https://example.com\"}</action>",
        "Done.",
        "</auto_specialist_mode>"
    );

    #[test]
    fn extracts_each_directive() {
        assert_eq!(thinking_steps(ALL_DIRECTIVES), vec!["read question".to_string()]);
        assert_eq!(last_image_prompt(ALL_DIRECTIVES).as_deref(), Some("prism"));
        assert_eq!(auto_specialist_subject(ALL_DIRECTIVES).as_deref(), Some("physicist"));
        assert_eq!(
            action_payload(ALL_DIRECTIVES),
            Some("{\"type\":\"open_url\",\"url\":\"https://example.com\"}")
        );
    }

    #[test]
    fn final_strip_keeps_wrapped_text() {
        assert_eq!(strip_final(ALL_DIRECTIVES), "Light bends. Done.");
    }

    #[test]
    fn self_closing_tags_tolerate_missing_space() {
        assert_eq!(strip_final("a<generate_image prompt=\"cat\"/>b"), "ab");
        assert_eq!(strip_final("a<thinking step=\"x\"/>b"), "ab");
    }

    #[test]
    fn only_last_image_prompt_is_kept() {
        let text = "<generate_image prompt=\"one\" /> and <generate_image prompt=\"two\" />";
        assert_eq!(last_image_prompt(text).as_deref(), Some("two"));
    }

    #[test]
    fn multiline_action_payload() {
        let text = "ok <action>{\n  \"type\": \"call\",\n  \"number\": \"123\"\n}</action>";
        let action = action_payload(text).and_then(parse_action);
        assert_eq!(action, Some(Action::Call { number: "123".into() }));
        assert_eq!(strip_final(text), "ok");
    }

    #[test]
    fn malformed_action_is_none() {
        assert_eq!(action_payload("<action>{not json}</action>").and_then(parse_action), None);
    }

    #[test]
    fn stripping_is_idempotent_and_closes_spliced_tags() {
        let nested = "x<thin<thinking step=\"a\" />king step=\"b\" />y";
        let once = strip_final(nested);
        assert_eq!(once, "xy");
        assert_eq!(strip_final(&once), once);
    }

    #[test]
    fn live_view_holds_back_partial_tags() {
        assert_eq!(strip_live("Hello <thinking step=\"an"), "Hello ");
        assert_eq!(strip_live("Hello <gen"), "Hello ");
        assert_eq!(strip_live("Hello <"), "Hello ");
        assert_eq!(strip_live("Hi <action>{\"type\":"), "Hi ");
        assert_eq!(strip_live("Hi <thinking step=\"a\" /"), "Hi ");
        assert_eq!(strip_live("  a < b and <b>bold</b>"), "a < b and <b>bold</b>");
    }

    #[test]
    fn every_split_point_hides_markup() {
        for (i, _) in ALL_DIRECTIVES.char_indices().skip(1) {
            let prefix = &ALL_DIRECTIVES[..i];
            let live = strip_live(prefix);
            for opener in OPENERS {
                assert!(!live.contains(opener), "offset {}: {:?}", i, live);
            }
            assert!(!live.contains("<thinking"), "offset {}: {:?}", i, live);
            assert!(!live.contains("<generate_image"), "offset {}: {:?}", i, live);
            assert!(!live.contains("</auto_"), "offset {}: {:?}", i, live);
        }
    }
}
