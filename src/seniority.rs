//! Keyword-based seniority labels for result rows.

use serde::Serialize;

use crate::catalog::CatalogItem;

/// Position level shown next to each match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SeniorityLevel {
    /// Trainee or no-experience roles.
    Intern,
    /// Entry level.
    Junior,
    /// Mid level; also the default.
    Middle,
    /// Senior individual contributor.
    Senior,
    /// Principal or staff level.
    Expert,
    /// Management and leadership roles.
    Lead,
}

// Checked in order; the first group with a hit wins.
const RULES: &[(SeniorityLevel, &[&str])] = &[
    (
        SeniorityLevel::Intern,
        &["intern", "trainee", "стажер", "стажёр", "без опыта", "no experience"],
    ),
    (
        SeniorityLevel::Lead,
        &[
            "head of", "director", "chief", "cfo", "ceo", "team lead", "lead ", "руководитель",
            "директор",
        ],
    ),
    (
        SeniorityLevel::Expert,
        &["expert", "principal", "staff ", "эксперт"],
    ),
    (
        SeniorityLevel::Senior,
        &["senior", "старший", "ведущий", "3+ years", "5+ years", "от 3", "от 5"],
    ),
    (
        SeniorityLevel::Middle,
        &["middle", "mid-level", "1+ year", "2+ years", "от 1", "от 2"],
    ),
    (
        SeniorityLevel::Junior,
        &["junior", "entry level", "entry-level", "младший", "начинающий"],
    ),
];

/// Classifies a catalog record by title, description, experience and skills.
pub fn seniority_level(item: &CatalogItem) -> SeniorityLevel {
    let text = format!(
        "{} {} {} {} ",
        item.title, item.description, item.experience, item.skills
    )
    .to_lowercase();
    RULES
        .iter()
        .find(|(_, words)| words.iter().any(|word| text.contains(word)))
        .map(|(level, _)| *level)
        .unwrap_or(SeniorityLevel::Middle)
}
