/// Marker that introduces a recurrence token in a task line
pub const RECURRENCE_MARKER: &str = "🔁";

/// Words a recurrence rule may start with
const RULE_LEADS: &[&str] = &[
    "every", "every!", "ev", "ev!", "daily", "weekly", "monthly", "yearly", "annually", "weekdays",
];

/// Parse a natural-language recurrence rule (`every day`, `every 2 weeks`,
/// `every! monday`). The rule is kept verbatim apart from whitespace
/// normalisation; anything that doesn't read as a rule is None.
pub fn parse_recurrence(token: &str) -> Option<String> {
    let words: Vec<&str> = token.split_whitespace().collect();
    let first = words.first()?.to_lowercase();
    if !RULE_LEADS.contains(&first.as_str()) {
        return None;
    }
    // A bare `every` says nothing about the interval
    if words.len() == 1 && first.starts_with("ev") {
        return None;
    }
    Some(words.join(" "))
}

pub fn format_recurrence(rule: &str) -> String {
    rule.split_whitespace().collect::<Vec<_>>().join(" ")
}
