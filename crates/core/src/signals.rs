//! Pure text heuristics shared by every pipeline layer: greeting and
//! acknowledgement detection, question/request detection, and teammate
//! command matching. No model calls, no I/O.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalClassifierConfig {
    pub greeting_phrases: Vec<String>,
    pub acknowledgement_phrases: Vec<String>,
    pub request_verbs: Vec<String>,
    pub interrogative_leads: Vec<String>,
    pub command_prefixes: Vec<String>,
    /// Messages at or under this word count are eligible to read as a bare
    /// greeting or acknowledgement.
    pub max_greeting_words: usize,
}

impl Default for SignalClassifierConfig {
    fn default() -> Self {
        Self {
            greeting_phrases: vec![
                "hi".to_string(),
                "hello".to_string(),
                "hey".to_string(),
                "good morning".to_string(),
                "good afternoon".to_string(),
                "good evening".to_string(),
            ],
            acknowledgement_phrases: vec![
                "ok".to_string(),
                "okay".to_string(),
                "thanks".to_string(),
                "thank you".to_string(),
                "thx".to_string(),
                "got it".to_string(),
                "sounds good".to_string(),
                "perfect".to_string(),
                "great".to_string(),
                "cool".to_string(),
                "sure".to_string(),
                "yes".to_string(),
                "yep".to_string(),
                "no".to_string(),
                "nope".to_string(),
            ],
            request_verbs: vec![
                "help".to_string(),
                "need".to_string(),
                "want".to_string(),
                "please".to_string(),
                "can you".to_string(),
                "could you".to_string(),
                "would you".to_string(),
                "fix".to_string(),
                "refund".to_string(),
                "cancel".to_string(),
                "change".to_string(),
                "update".to_string(),
            ],
            interrogative_leads: vec![
                "who".to_string(),
                "what".to_string(),
                "when".to_string(),
                "where".to_string(),
                "why".to_string(),
                "how".to_string(),
                "which".to_string(),
                "is ".to_string(),
                "are ".to_string(),
                "do ".to_string(),
                "does ".to_string(),
                "did ".to_string(),
                "will ".to_string(),
            ],
            command_prefixes: vec!["/ai".to_string(), "/bot".to_string(), "@assistant".to_string()],
            max_greeting_words: 4,
        }
    }
}

/// A teammate command recognized by prefix, with the prefix stripped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HumanCommand {
    pub prefix: String,
    pub text: String,
}

#[derive(Clone, Debug, Default)]
pub struct SignalClassifier {
    config: SignalClassifierConfig,
}

impl SignalClassifier {
    pub fn new(config: SignalClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalClassifierConfig {
        &self.config
    }

    /// A short message that is nothing but a greeting, thanks, or
    /// acknowledgement.
    pub fn is_greeting_or_ack(&self, text: &str) -> bool {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return false;
        }
        if word_count(&normalized) > self.config.max_greeting_words {
            return false;
        }

        let mut phrases: Vec<&str> = self
            .config
            .greeting_phrases
            .iter()
            .chain(self.config.acknowledgement_phrases.iter())
            .map(String::as_str)
            .collect();
        // Longest phrases first so "thank you" wins over "thanks".
        phrases.sort_by_key(|phrase| std::cmp::Reverse(phrase.len()));

        let words: Vec<&str> = normalized.split_whitespace().collect();
        let mut index = 0;
        while index < words.len() {
            if is_filler_word(words[index]) {
                index += 1;
                continue;
            }
            let matched = phrases.iter().find_map(|phrase| {
                let phrase_words: Vec<&str> = phrase.split_whitespace().collect();
                let end = index + phrase_words.len();
                (end <= words.len() && words[index..end] == phrase_words[..]).then_some(end)
            });
            match matched {
                Some(end) => index = end,
                None => return false,
            }
        }
        true
    }

    /// Whether the text reads as a question or an actionable request.
    pub fn is_question_or_request(&self, text: &str) -> bool {
        if text.contains('?') {
            return true;
        }
        let normalized = normalize(text);
        if self
            .config
            .interrogative_leads
            .iter()
            .any(|lead| normalized.starts_with(lead.trim_end()) && leads_word(&normalized, lead))
        {
            return true;
        }
        self.config.request_verbs.iter().any(|verb| normalized.contains(verb.as_str()))
    }

    /// Whether an automated reply reads like it ended on a follow-up question
    /// back to the visitor.
    pub fn reads_as_followup_question(&self, text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return false;
        }
        if trimmed.ends_with('?') {
            return true;
        }
        let normalized = normalize(trimmed);
        normalized.contains("anything else") || normalized.contains("let me know if")
    }

    pub fn sentence_count(&self, text: &str) -> usize {
        text.split(['.', '!', '?'])
            .filter(|segment| !segment.trim().is_empty())
            .count()
    }

    /// Recognize a teammate command by configured prefix, returning the
    /// remainder with the prefix stripped.
    pub fn match_command(&self, text: &str) -> Option<HumanCommand> {
        let trimmed = text.trim();
        let lowered = trimmed.to_ascii_lowercase();
        for prefix in &self.config.command_prefixes {
            if let Some(rest) = lowered.strip_prefix(prefix.as_str()) {
                if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
                    continue;
                }
                let remainder = trimmed[prefix.len()..].trim().to_string();
                return Some(HumanCommand { prefix: prefix.clone(), text: remainder });
            }
        }
        None
    }
}

fn normalize(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    for character in text.chars() {
        if character.is_alphanumeric() || character.is_whitespace() || character == '\'' {
            normalized.extend(character.to_lowercase());
        } else {
            normalized.push(' ');
        }
    }
    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn word_count(normalized: &str) -> usize {
    normalized.split_whitespace().count()
}

fn is_filler_word(word: &str) -> bool {
    matches!(word, "there" | "so" | "much" | "a" | "lot" | "all" | "that's" | "its" | "it's")
}

fn leads_word(normalized: &str, lead: &str) -> bool {
    let lead = lead.trim_end();
    normalized.len() == lead.len() || normalized[lead.len()..].starts_with(' ')
}
