//! Mechanical resolution of conflict-marker blocks
//!
//! A block is `<<<<<<<` current `=======` incoming `>>>>>>>`, optionally with a
//! diff3 `|||||||` base section which is always dropped.

use tracing::debug;

use super::types::{ConflictError, ConflictedResource, ResolutionStrategy, ResolvedResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Outside,
    Current,
    Base,
    Incoming,
}

/// Resolve every resource with one strategy. All-or-nothing: the first
/// unresolvable resource fails the whole set.
pub fn resolve_conflicts(
    resources: &[ConflictedResource],
    strategy: ResolutionStrategy,
) -> Result<Vec<ResolvedResource>, ConflictError> {
    if strategy.is_manual() {
        return Err(ConflictError::UnresolvableConflict {
            resource: resources
                .first()
                .map(|r| r.path.clone())
                .unwrap_or_else(|| "<none>".to_string()),
            reason: "require_manual is never attempted automatically".to_string(),
        });
    }

    resources
        .iter()
        .map(|resource| {
            let content = resolve_content(&resource.path, &resource.content, strategy)?;
            Ok(ResolvedResource {
                path: resource.path.clone(),
                content,
            })
        })
        .collect()
}

fn resolve_content(
    path: &str,
    content: &str,
    strategy: ResolutionStrategy,
) -> Result<String, ConflictError> {
    let mut output = String::with_capacity(content.len());
    let mut current = String::new();
    let mut incoming = String::new();
    let mut section = Section::Outside;
    let mut blocks = 0usize;

    for line in content.split_inclusive('\n') {
        match section {
            Section::Outside if line.starts_with("<<<<<<<") => {
                section = Section::Current;
                current.clear();
                incoming.clear();
                blocks += 1;
            }
            Section::Outside => output.push_str(line),
            Section::Current if line.starts_with("|||||||") => section = Section::Base,
            Section::Current | Section::Base if line.starts_with("=======") => {
                section = Section::Incoming
            }
            Section::Current => current.push_str(line),
            Section::Base => {}
            Section::Incoming if line.starts_with(">>>>>>>") => {
                output.push_str(&choose(strategy, &current, &incoming));
                section = Section::Outside;
            }
            Section::Incoming => incoming.push_str(line),
        }
    }

    if section != Section::Outside {
        return Err(ConflictError::UnresolvableConflict {
            resource: path.to_string(),
            reason: "unterminated conflict block".to_string(),
        });
    }
    if blocks == 0 {
        return Err(ConflictError::UnresolvableConflict {
            resource: path.to_string(),
            reason: "reported as conflicting but has no conflict markers".to_string(),
        });
    }

    debug!(resource = %path, blocks, strategy = %strategy, "Resolved conflict blocks");
    Ok(output)
}

fn choose(strategy: ResolutionStrategy, current: &str, incoming: &str) -> String {
    match strategy {
        ResolutionStrategy::PreferCurrent => current.to_string(),
        ResolutionStrategy::MergeBoth => {
            let mut both = current.to_string();
            if !both.is_empty() && !both.ends_with('\n') {
                both.push('\n');
            }
            both.push_str(incoming);
            both
        }
        ResolutionStrategy::LongestSide => {
            if current.trim().is_empty() {
                incoming.to_string()
            } else if incoming.trim().is_empty() || current.len() >= incoming.len() {
                current.to_string()
            } else {
                incoming.to_string()
            }
        }
        // Incoming is the newer side
        ResolutionStrategy::PreferIncoming
        | ResolutionStrategy::AutoMerge
        | ResolutionStrategy::PrioritizeIncoming
        | ResolutionStrategy::PreferMostRecent
        | ResolutionStrategy::RequireManual => incoming.to_string(),
    }
}
