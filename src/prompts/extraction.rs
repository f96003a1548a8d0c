//! Prompt for the structural analysis of legacy source.

use crate::llm::Prompt;
use crate::pipeline::{SourceLanguage, StageId};

const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are a senior engineer analyzing legacy {language} code before it is ported.

Identify the program's structure and report it as a single JSON object:

{
  "classes": [{"name": "...", "methods": ["..."], "fields": ["..."], "is_singleton": false}],
  "functions": [{"name": "...", "params": ["..."], "return_type": "...", "loop_count": 0, "performs_io": false}],
  "flow_description": "Two or three sentences describing what the code does, step by step.",
  "notes": ["Ownership or lifetime concerns worth preserving."]
}

Rules:
- Report only symbols that appear in the code you were given.
- Mark performs_io for functions that read or write files, sockets or the console.
- Respond with the JSON object only."#;

/// Builds the extraction prompt for one view of the source.
///
/// `part` is `(index, total)` when the source arrives in windows.
pub fn build_extraction_prompt(
    language: SourceLanguage,
    file_name: &str,
    view: &str,
    part: Option<(usize, usize)>,
) -> Prompt {
    let system = EXTRACTION_SYSTEM_PROMPT.replace("{language}", language.as_str());

    let scope = match part {
        Some((index, total)) => format!(
            "This is window {} of {} from `{}`. Windows overlap slightly; report what this window declares.",
            index + 1,
            total,
            file_name
        ),
        None => format!("Analyze `{}`.", file_name),
    };

    let user = format!(
        "{}\n\n```{}\n{}\n```",
        scope,
        language.as_str(),
        view.trim_end()
    );

    Prompt::new(StageId::Extractor, system, user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_file_prompt() {
        let prompt = build_extraction_prompt(SourceLanguage::Java, "Cache.java", "class Cache {}", None);
        assert_eq!(prompt.stage, StageId::Extractor);
        assert!(prompt.system.contains("legacy java code"));
        assert!(prompt.user.contains("Analyze `Cache.java`"));
        assert!(prompt.user.contains("```java\nclass Cache {}\n```"));
    }

    #[test]
    fn test_windowed_prompt_names_part() {
        let prompt = build_extraction_prompt(SourceLanguage::Cpp, "big.cpp", "int x;", Some((2, 7)));
        assert!(prompt.user.starts_with("This is window 3 of 7"));
    }
}
