//! Classification of server topic and subtopic names

use serde::Deserialize;

/// Markers that switch the interview between conversation and live coding.
///
/// Names are compared after [`normalize`], and a name matches when it
/// contains any marker.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TopicRules {
    /// Topics that open live-coding mode
    pub live_coding_topics: Vec<String>,

    /// Subtopics that close live-coding mode
    pub discussion_subtopics: Vec<String>,
}

impl Default for TopicRules {
    fn default() -> Self {
        Self {
            live_coding_topics: vec![
                "problem introduction".to_string(),
                "problem solving".to_string(),
            ],
            discussion_subtopics: vec!["task specific discussion".to_string()],
        }
    }
}

impl TopicRules {
    pub fn is_live_coding_topic(&self, topic: &str) -> bool {
        matches_any(topic, &self.live_coding_topics)
    }

    pub fn is_discussion_subtopic(&self, subtopic: &str) -> bool {
        matches_any(subtopic, &self.discussion_subtopics)
    }
}

/// Lowercase, treat `-`, `_` and `/` as spaces, collapse whitespace
pub fn normalize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '-' | '_' | '/' => ' ',
            other => other.to_ascii_lowercase(),
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn matches_any(name: &str, markers: &[String]) -> bool {
    let name = normalize(name);
    !name.is_empty()
        && markers
            .iter()
            .map(|m| normalize(m))
            .any(|marker| !marker.is_empty() && name.contains(&marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Problem_Introduction/Solving "), "problem introduction solving");
        assert_eq!(normalize("Task-Specific   Discussion"), "task specific discussion");
    }

    #[test]
    fn test_default_rules() {
        let rules = TopicRules::default();
        assert!(rules.is_live_coding_topic("Problem Introduction"));
        assert!(rules.is_live_coding_topic("problem_solving"));
        assert!(!rules.is_live_coding_topic("Introductions"));
        assert!(rules.is_discussion_subtopic("Task-specific discussion"));
        assert!(!rules.is_discussion_subtopic(""));
    }
}
