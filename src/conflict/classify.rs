use regex::Regex;
use std::collections::BTreeMap;

use super::types::{ConflictError, ResourceClass};

/// Classes are tried in this order; the first match wins
const MATCH_ORDER: [ResourceClass; 4] = [
    ResourceClass::Test,
    ResourceClass::Documentation,
    ResourceClass::Configuration,
    ResourceClass::Code,
];

pub fn default_resource_classes() -> BTreeMap<ResourceClass, Vec<String>> {
    let mut classes = BTreeMap::new();
    classes.insert(
        ResourceClass::Test,
        vec![
            r"(^|/)tests?/".to_string(),
            r"_test\.[A-Za-z0-9]+$".to_string(),
            r"(^|/)test_[^/]*$".to_string(),
            r"\.spec\.[A-Za-z0-9]+$".to_string(),
        ],
    );
    classes.insert(
        ResourceClass::Documentation,
        vec![
            r"\.(md|rst|txt|adoc)$".to_string(),
            r"(^|/)docs?/".to_string(),
            r"(^|/)(README|CHANGELOG|LICENSE)[^/]*$".to_string(),
        ],
    );
    classes.insert(
        ResourceClass::Configuration,
        vec![r"\.(json|ya?ml|toml|ini|cfg|conf|env)$".to_string()],
    );
    classes.insert(
        ResourceClass::Code,
        vec![
            r"\.(rs|py|js|jsx|ts|tsx|go|java|kt|c|cc|cpp|h|hpp|rb|php|cs|swift|scala|sh)$"
                .to_string(),
        ],
    );
    classes
}

/// Maps resource paths to classes using regex pattern sets compiled once
#[derive(Debug, Clone)]
pub struct ResourceClassifier {
    patterns: Vec<(ResourceClass, Vec<Regex>)>,
}

impl ResourceClassifier {
    pub fn new(classes: &BTreeMap<ResourceClass, Vec<String>>) -> Result<Self, ConflictError> {
        let mut patterns = Vec::new();
        for class in MATCH_ORDER {
            let Some(sources) = classes.get(&class) else {
                continue;
            };
            let compiled = sources
                .iter()
                .map(|pattern| {
                    Regex::new(pattern).map_err(|source| ConflictError::InvalidPattern {
                        pattern: pattern.clone(),
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            patterns.push((class, compiled));
        }
        Ok(Self { patterns })
    }

    /// `None` when no class matches
    pub fn classify(&self, path: &str) -> Option<ResourceClass> {
        self.patterns
            .iter()
            .find(|(_, regexes)| regexes.iter().any(|re| re.is_match(path)))
            .map(|(class, _)| *class)
    }
}

impl Default for ResourceClassifier {
    fn default() -> Self {
        // The built-in patterns are known to compile
        Self::new(&default_resource_classes()).unwrap_or(Self {
            patterns: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classification() {
        let classifier = ResourceClassifier::default();
        assert_eq!(classifier.classify("README.md"), Some(ResourceClass::Documentation));
        assert_eq!(classifier.classify("docs/guide/intro.rst"), Some(ResourceClass::Documentation));
        assert_eq!(classifier.classify("config/app.yaml"), Some(ResourceClass::Configuration));
        assert_eq!(classifier.classify("Cargo.toml"), Some(ResourceClass::Configuration));
        assert_eq!(classifier.classify("src/lib.rs"), Some(ResourceClass::Code));
        assert_eq!(classifier.classify("tests/queue_test.rs"), Some(ResourceClass::Test));
        assert_eq!(classifier.classify("pkg/handler_test.go"), Some(ResourceClass::Test));
        assert_eq!(classifier.classify("assets/logo.png"), None);
    }

    #[test]
    fn test_custom_patterns_replace_defaults() {
        let mut classes = BTreeMap::new();
        classes.insert(ResourceClass::Documentation, vec![r"\.adoc$".to_string()]);
        let classifier = ResourceClassifier::new(&classes).unwrap();

        assert_eq!(classifier.classify("guide.adoc"), Some(ResourceClass::Documentation));
        assert_eq!(classifier.classify("README.md"), None);
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let mut classes = BTreeMap::new();
        classes.insert(ResourceClass::Code, vec!["(unclosed".to_string()]);
        assert!(matches!(
            ResourceClassifier::new(&classes),
            Err(ConflictError::InvalidPattern { .. })
        ));
    }
}
