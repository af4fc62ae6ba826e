use skynet_core::{Intent, IntentTokens, ThinkingLevel, ToolSchema};

/// Tool schemas actually registered for this process. Injected rather than
/// hard-coded — tool implementations themselves are out of scope (§1) — so
/// the classifier can resolve a bucket name to whatever tools are present
/// without knowing how they're implemented.
pub trait ToolRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<ToolSchema>;
}

const CODE_BUCKET: &[&str] = &["filesystem", "shell", "diff", "python_eval", "code_analysis"];
const SEARCH_BUCKET: &[&str] = &["web_search", "fetch"];

/// Trigger keyword → extra tool names injected on top of the intent-derived
/// set, independent of language.
const KEYWORD_TOOLS: &[(&[&str], &[&str])] = &[
    (&["weather", "forecast", "날씨"], &["weather"]),
    (&["remind me", "reminder", "알림"], &["reminders"]),
    (&["calendar", "schedule", "일정"], &["calendar"]),
];

const DETAIL_PHRASES: &[&str] = &["in detail", "in-depth", "go deeper", "자세히 설명", "자세히"];

const CODE_KEYWORDS: &[&str] = &["code", "function", "bug", "compile", "stack trace", "refactor"];
const SEARCH_KEYWORDS: &[&str] = &["search", "look up", "find out", "news", "latest"];
const CREATIVE_KEYWORDS: &[&str] = &["poem", "story", "write me", "brainstorm", "imagine"];
const MEMORY_KEYWORDS: &[&str] = &["remember", "recall", "what did i say", "earlier i told you"];
const ANALYSIS_KEYWORDS: &[&str] = &["analyze", "compare", "pros and cons", "evaluate"];
const MEDIA_KEYWORDS: &[&str] = &["image", "photo", "picture", "draw", "generate an image"];

#[derive(Debug, Clone)]
pub struct Classification {
    pub intent: Intent,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
    pub thinking_level: ThinkingLevel,
}

pub struct IntentClassifier<'a> {
    registry: &'a dyn ToolRegistry,
    budgets: IntentTokens,
}

impl<'a> IntentClassifier<'a> {
    pub fn new(registry: &'a dyn ToolRegistry, budgets: IntentTokens) -> Self {
        Self { registry, budgets }
    }

    pub fn classify(&self, user_text: &str, _context_depth: usize) -> Classification {
        let lower = user_text.to_lowercase();
        let intent = classify_intent(&lower);
        let bucket_names: &[&str] = match intent {
            Intent::Code => CODE_BUCKET,
            Intent::Search => SEARCH_BUCKET,
            _ => &[],
        };

        let mut tools = self.resolve_bucket(bucket_names, bucket_cap(intent));

        for (keywords, tool_names) in KEYWORD_TOOLS {
            if keywords.iter().any(|kw| lower.contains(kw)) {
                for extra in self.resolve_bucket(tool_names, usize::MAX) {
                    if !tools.iter().any(|t| t.name == extra.name) {
                        tools.push(extra);
                    }
                }
            }
        }

        let detail_requested = DETAIL_PHRASES.iter().any(|phrase| lower.contains(phrase));

        let mut max_tokens = base_tokens(intent, &self.budgets);
        if detail_requested {
            max_tokens *= 4;
        }

        let mut thinking_level = base_thinking_level(intent);
        if detail_requested {
            thinking_level = thinking_level.step_up();
        }

        Classification { intent, tools, max_tokens, thinking_level }
    }

    /// A bucket naming a tool the registry doesn't have is skipped rather
    /// than treated as an error.
    fn resolve_bucket(&self, names: &[&str], cap: usize) -> Vec<ToolSchema> {
        names.iter().filter_map(|name| self.registry.get(name)).take(cap).collect()
    }
}

fn bucket_cap(intent: Intent) -> usize {
    match intent {
        Intent::Code => 15,
        Intent::Search => 10,
        _ => usize::MAX,
    }
}

/// Reasoning-shaped intents (code, analysis) get a baseline thinking depth;
/// conversational ones stay off so latency/cost aren't spent where the
/// model rarely needs to deliberate (§4.9/§4.10). `step_up()` on top of
/// this moves a turn to the next tier when a detail phrase is present.
fn base_thinking_level(intent: Intent) -> ThinkingLevel {
    match intent {
        Intent::Code | Intent::Analysis => ThinkingLevel::Low,
        Intent::Chat | Intent::Memory | Intent::Creative | Intent::Search | Intent::Media => ThinkingLevel::Off,
    }
}

fn base_tokens(intent: Intent, budgets: &IntentTokens) -> u32 {
    match intent {
        Intent::Chat => budgets.chat,
        Intent::Memory => budgets.memory,
        Intent::Creative => budgets.creative,
        Intent::Code => budgets.code,
        Intent::Search => budgets.search,
        Intent::Analysis => budgets.analysis,
        Intent::Media => budgets.media,
    }
}

fn classify_intent(lower: &str) -> Intent {
    if CODE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Intent::Code
    } else if SEARCH_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Intent::Search
    } else if MEDIA_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Intent::Media
    } else if ANALYSIS_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Intent::Analysis
    } else if CREATIVE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Intent::Creative
    } else if MEMORY_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Intent::Memory
    } else {
        Intent::Chat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapRegistry(HashMap<&'static str, ToolSchema>);
    impl ToolRegistry for MapRegistry {
        fn get(&self, name: &str) -> Option<ToolSchema> {
            self.0.get(name).cloned()
        }
    }

    fn schema(name: &'static str) -> ToolSchema {
        ToolSchema {
            name: name.to_string(),
            description: String::new(),
            parameters: serde_json::json!({}),
        }
    }

    fn registry() -> MapRegistry {
        let mut m = HashMap::new();
        for name in CODE_BUCKET.iter().chain(SEARCH_BUCKET.iter()).chain(["weather"].iter()) {
            m.insert(*name, schema(name));
        }
        MapRegistry(m)
    }

    #[test]
    fn chat_turn_carries_no_tools() {
        let reg = registry();
        let classifier = IntentClassifier::new(&reg, IntentTokens::default());
        let result = classifier.classify("hello, how are you?", 0);
        assert_eq!(result.intent, Intent::Chat);
        assert!(result.tools.is_empty());
        assert_eq!(result.max_tokens, 1024);
    }

    #[test]
    fn code_turn_resolves_code_bucket_from_registry() {
        let reg = registry();
        let classifier = IntentClassifier::new(&reg, IntentTokens::default());
        let result = classifier.classify("there's a bug in my function", 0);
        assert_eq!(result.intent, Intent::Code);
        assert_eq!(result.tools.len(), CODE_BUCKET.len());
    }

    #[test]
    fn unknown_tool_in_bucket_is_skipped_not_errored() {
        let reg = MapRegistry(HashMap::new());
        let classifier = IntentClassifier::new(&reg, IntentTokens::default());
        let result = classifier.classify("please refactor this code", 0);
        assert!(result.tools.is_empty());
    }

    #[test]
    fn keyword_injects_extra_tool_on_top_of_chat_intent() {
        let reg = registry();
        let classifier = IntentClassifier::new(&reg, IntentTokens::default());
        let result = classifier.classify("what's the weather like today?", 0);
        assert!(result.tools.iter().any(|t| t.name == "weather"));
    }

    #[test]
    fn detail_phrase_multiplies_token_budget() {
        let reg = registry();
        let classifier = IntentClassifier::new(&reg, IntentTokens::default());
        let result = classifier.classify("explain this in detail please", 0);
        assert_eq!(result.max_tokens, 1024 * 4);
    }

    #[test]
    fn chat_turn_carries_no_thinking() {
        let reg = registry();
        let classifier = IntentClassifier::new(&reg, IntentTokens::default());
        let result = classifier.classify("hello, how are you?", 0);
        assert_eq!(result.thinking_level, ThinkingLevel::Off);
    }

    #[test]
    fn code_turn_gets_a_baseline_thinking_level() {
        let reg = registry();
        let classifier = IntentClassifier::new(&reg, IntentTokens::default());
        let result = classifier.classify("there's a bug in my function", 0);
        assert_eq!(result.thinking_level, ThinkingLevel::Low);
    }

    #[test]
    fn detail_phrase_steps_up_thinking_level() {
        let reg = registry();
        let classifier = IntentClassifier::new(&reg, IntentTokens::default());
        let result = classifier.classify("there's a bug, explain it in detail", 0);
        assert_eq!(result.thinking_level, ThinkingLevel::Medium);
    }
}
