use once_cell::sync::Lazy;
use regex::{NoExpand, Regex, RegexBuilder};
use serde::Deserialize;

use crate::errors::{AppError, AppResult};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NormalizationRules {
    #[serde(default)]
    pub abbreviations: Vec<Replacement>,
    #[serde(default)]
    pub typos: Vec<Replacement>,
    #[serde(default)]
    pub cleanup: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Replacement {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct RuleProvider {
    country_code: String,
    abbreviations: Vec<(Regex, String)>,
    typos: Vec<(Regex, String)>,
    cleanup: Vec<Regex>,
}

impl RuleProvider {
    pub fn compile(country_code: &str, rules: &NormalizationRules) -> AppResult<Self> {
        let replacements = |list: &[Replacement]| -> AppResult<Vec<(Regex, String)>> {
            list.iter()
                .filter(|entry| !entry.from.trim().is_empty())
                .map(|entry| {
                    literal_word(country_code, &entry.from).map(|regex| (regex, entry.to.clone()))
                })
                .collect()
        };

        let cleanup = rules
            .cleanup
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|err| {
                        AppError::Config(format!(
                            "{country_code}: invalid cleanup pattern {pattern:?}: {err}"
                        ))
                    })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self {
            country_code: country_code.to_string(),
            abbreviations: replacements(&rules.abbreviations)?,
            typos: replacements(&rules.typos)?,
            cleanup,
        })
    }

    pub fn empty(country_code: &str) -> Self {
        Self {
            country_code: country_code.to_string(),
            abbreviations: Vec::new(),
            typos: Vec::new(),
            cleanup: Vec::new(),
        }
    }

    pub fn country_code(&self) -> &str {
        &self.country_code
    }

    pub fn is_empty(&self) -> bool {
        self.abbreviations.is_empty() && self.typos.is_empty() && self.cleanup.is_empty()
    }
}

pub fn normalize(text: &str, rules: &RuleProvider) -> String {
    if text.is_empty() || rules.is_empty() {
        return text.to_string();
    }

    let mut value = text.to_string();
    for (pattern, replacement) in rules.abbreviations.iter().chain(&rules.typos) {
        value = pattern
            .replace_all(&value, NoExpand(replacement))
            .into_owned();
    }
    for pattern in &rules.cleanup {
        value = pattern.replace_all(&value, " ").into_owned();
    }

    WHITESPACE
        .replace_all(&value, " ")
        .trim_matches(|c: char| c.is_whitespace() || c == ',')
        .to_string()
}

// Matches `word` case-insensitively, but only as a whole token. Word
// boundaries are only asserted next to word characters so entries such as
// "str." still match before a space.
fn literal_word(country_code: &str, word: &str) -> AppResult<Regex> {
    let word = word.trim();
    let leading = if word.starts_with(|c: char| c.is_alphanumeric()) {
        r"\b"
    } else {
        ""
    };
    let trailing = if word.ends_with(|c: char| c.is_alphanumeric()) {
        r"\b"
    } else {
        ""
    };
    let pattern = format!("{leading}{}{trailing}", regex::escape(word));
    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map_err(|err| AppError::Config(format!("{country_code}: invalid rule {word:?}: {err}")))
}
