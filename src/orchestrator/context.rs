//! Prompt assembly from conversation history.

use crate::memory::{InteractionRecord, Role};

fn speaker(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "AI",
        Role::System => "System",
        Role::Tool => "Tool",
    }
}

/// Render `history` followed by the new turn.
///
/// History is trimmed from the oldest end until it fits in `word_budget`
/// words. The new turn is always included.
pub fn build_prompt(history: &[InteractionRecord], content: &str, role: Role, word_budget: usize) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut words = 0usize;
    for record in history.iter().rev() {
        let line = format!("{}: {}", speaker(record.role), record.content.trim());
        let n = line.split_whitespace().count();
        if words + n > word_budget {
            break;
        }
        words += n;
        kept.push(line);
    }
    kept.reverse();

    let mut prompt = String::new();
    for line in kept {
        prompt.push_str(&line);
        prompt.push('\n');
    }
    prompt.push_str(speaker(role));
    prompt.push_str(": ");
    prompt.push_str(content.trim());
    prompt.push_str("\nAI:");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_history() {
        assert_eq!(build_prompt(&[], " hello ", Role::User, 100), "User: hello\nAI:");
    }

    #[test]
    fn test_history_rendered_in_order() {
        let history = vec![
            InteractionRecord::new(Role::User, "hi"),
            InteractionRecord::new(Role::Assistant, "hello"),
        ];
        let prompt = build_prompt(&history, "how are you", Role::User, 100);
        assert_eq!(prompt, "User: hi\nAI: hello\nUser: how are you\nAI:");
    }

    #[test]
    fn test_budget_drops_oldest() {
        let history = vec![
            InteractionRecord::new(Role::User, "one two three four"),
            InteractionRecord::new(Role::Assistant, "five six"),
        ];
        // "AI: five six" is 3 words; the older line would need 5 more.
        let prompt = build_prompt(&history, "next", Role::User, 4);
        assert_eq!(prompt, "AI: five six\nUser: next\nAI:");
    }
}
