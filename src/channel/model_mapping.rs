//! Pattern-ordered model name rewriting.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuleType {
    Exact,
    Wildcard,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMappingRule {
    pub pattern: String,
    pub target: String,
    pub rule_type: RuleType,
}

/// Rewrites model names through an ordered rule list. Rules are kept sorted
/// by precedence (Exact > Wildcard > All); the first match wins.
#[derive(Debug, Clone, Default)]
pub struct ModelMapper {
    rules: Vec<ModelMappingRule>,
}

impl ModelMapper {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, pattern: &str, target: &str) {
        let rule = ModelMappingRule {
            pattern: pattern.to_string(),
            target: target.to_string(),
            rule_type: rule_type_of(pattern),
        };
        let position = self
            .rules
            .iter()
            .position(|existing| rule.rule_type < existing.rule_type)
            .unwrap_or(self.rules.len());
        self.rules.insert(position, rule);
    }

    pub fn map_model(&self, model: &str) -> String {
        for rule in &self.rules {
            if matches_rule(rule, model) {
                return rule.target.clone();
            }
        }
        model.to_string()
    }

    pub fn rules(&self) -> &[ModelMappingRule] {
        &self.rules
    }
}

fn rule_type_of(pattern: &str) -> RuleType {
    if pattern == "*" {
        RuleType::All
    } else if pattern.contains('*') {
        RuleType::Wildcard
    } else {
        RuleType::Exact
    }
}

fn matches_rule(rule: &ModelMappingRule, model: &str) -> bool {
    match rule.rule_type {
        RuleType::Exact => model == rule.pattern,
        RuleType::Wildcard => wildcard_match(&rule.pattern, model),
        RuleType::All => true,
    }
}

/// `*` matches any run of characters; it may appear at the start, end or
/// interior of the pattern, and consecutive `*` collapse into one. The
/// non-`*` prefix and suffix anchor both ends.
fn wildcard_match(pattern: &str, model: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == model;
    }

    let parts: Vec<&str> = pattern.split('*').collect();

    let first = parts.first().copied().unwrap_or("");
    if !first.is_empty() && !model.starts_with(first) {
        return false;
    }
    let last = parts.last().copied().unwrap_or("");
    if !last.is_empty() && !model.ends_with(last) {
        return false;
    }

    let mut cursor = first.len();
    for part in &parts[1..parts.len().saturating_sub(1)] {
        if part.is_empty() {
            continue;
        }
        match model[cursor..].find(part) {
            Some(found) => cursor += found + part.len(),
            None => return false,
        }
    }

    true
}
