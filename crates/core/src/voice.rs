//! Deterministic post-processor for human-facing step phrases.
//!
//! Planner output may leave `voice_action` empty or slip into technical
//! English. The standardizer rewrites any violating phrase from a verb-keyed
//! table so every announcement reaches the voice channel in the target
//! language.

use crate::plan::PlanStep;

/// (action verb prefixes, spoken phrase); first match wins.
const VERB_PHRASES: &[(&[&str], &str)] = &[
    (&["open", "launch", "start", "відкрий", "запусти"], "Відкриваю застосунок"),
    (&["create", "write", "створи", "напиши"], "Створюю файл"),
    (&["install", "встанови"], "Встановлюю програму"),
    (&["delete", "remove", "видали"], "Видаляю файл"),
    (&["search", "find", "locate", "знайди", "пошукай"], "Шукаю інформацію"),
    (&["read", "прочитай", "перевір"], "Перевіряю дані"),
    (&["download", "завантаж"], "Завантажую дані"),
    (&["copy", "move", "скопіюй", "перемісти"], "Переміщую файли"),
    (&["send", "надішли"], "Надсилаю повідомлення"),
    (&["type", "enter", "введи", "надрукуй"], "Вводжу текст"),
    (&["click", "press", "натисни"], "Натискаю елемент"),
    (&["build", "compile", "збери"], "Збираю проєкт"),
    (&["test", "run", "запусти тест"], "Запускаю перевірку"),
    (&["configure", "setup", "налаштуй"], "Налаштовую систему"),
];

const FALLBACK_PHRASE: &str = "Виконую крок";

pub fn contains_latin(text: &str) -> bool {
    text.chars().any(|c| c.is_ascii_alphabetic())
}

/// Pick a spoken phrase for a technical action.
pub fn default_phrase_for_action(action: &str) -> &'static str {
    let lower = action.to_lowercase();
    for (verbs, phrase) in VERB_PHRASES {
        if verbs
            .iter()
            .any(|v| lower.starts_with(v) || lower.contains(&format!(" {v}")))
        {
            return phrase;
        }
    }
    FALLBACK_PHRASE
}

/// Rewrite missing or mixed-language voice actions in place.
/// Returns how many steps were rewritten. Applied after plan creation and
/// again after any plan fix.
pub fn standardize_voice_actions(steps: &mut [PlanStep], non_latin_script: bool) -> usize {
    let mut rewritten = 0;
    for step in steps.iter_mut() {
        let violates = step.voice_action.trim().is_empty()
            || (non_latin_script && contains_latin(&step.voice_action));
        if violates {
            step.voice_action = default_phrase_for_action(&step.action).to_string();
            rewritten += 1;
        }
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(action: &str, voice: &str) -> PlanStep {
        PlanStep {
            id: 1,
            action: action.to_string(),
            voice_action: voice.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_contains_latin() {
        assert!(contains_latin("Opening the app"));
        assert!(contains_latin("Відкриваю TextEdit"));
        assert!(!contains_latin("Відкриваю застосунок"));
    }

    #[test]
    fn test_rewrites_empty_and_english() {
        let mut steps = vec![
            step("open TextEdit", ""),
            step("create file report.txt", "Creating the file"),
            step("search the web for rust", "Шукаю інформацію"),
        ];
        let rewritten = standardize_voice_actions(&mut steps, true);
        assert_eq!(rewritten, 2);
        assert_eq!(steps[0].voice_action, "Відкриваю застосунок");
        assert_eq!(steps[1].voice_action, "Створюю файл");
        assert_eq!(steps[2].voice_action, "Шукаю інформацію");
    }

    #[test]
    fn test_no_latin_after_standardization() {
        let mut steps = vec![
            step("install homebrew", "install it"),
            step("unrecognized verb entirely", "mixed текст"),
        ];
        standardize_voice_actions(&mut steps, true);
        for s in &steps {
            assert!(!contains_latin(&s.voice_action), "{}", s.voice_action);
        }
    }

    #[test]
    fn test_latin_allowed_for_latin_script_targets() {
        let mut steps = vec![step("open TextEdit", "Opening TextEdit")];
        let rewritten = standardize_voice_actions(&mut steps, false);
        assert_eq!(rewritten, 0);
        assert_eq!(steps[0].voice_action, "Opening TextEdit");
    }
}
