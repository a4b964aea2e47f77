use std::collections::HashSet;

use crate::db::models::StageRecord;
use crate::error::{AppError, AppResult};

/// Ordered view over one project's stages. Pure queries, no side effects;
/// callers load the stage rows and hand them in.
pub struct StageGraph<'a> {
    sorted: Vec<&'a StageRecord>,
}

impl<'a> StageGraph<'a> {
    pub fn new(stages: &'a [StageRecord]) -> Self {
        let mut sorted: Vec<&StageRecord> = stages.iter().collect();
        sorted.sort_by_key(|stage| stage.position);
        Self { sorted }
    }

    pub fn get(&self, stage_id: &str) -> Option<&'a StageRecord> {
        self.sorted.iter().copied().find(|stage| stage.id == stage_id)
    }

    pub fn sorted_by_position(&self) -> &[&'a StageRecord] {
        &self.sorted
    }

    /// The terminal stage: highest position. Tasks landing here get the
    /// "Completed" tag.
    pub fn last_stage(&self) -> Option<&'a StageRecord> {
        self.sorted.last().copied()
    }

    /// First stage strictly after the given one, by position.
    pub fn next_stage_after(&self, stage: &StageRecord) -> Option<&'a StageRecord> {
        self.sorted
            .iter()
            .copied()
            .find(|candidate| candidate.position > stage.position)
    }

    pub fn is_last(&self, stage_id: &str) -> bool {
        self.last_stage().is_some_and(|stage| stage.id == stage_id)
    }
}

/// Checks a project's stage set against the structural invariants: at least
/// one stage, titles unique case-insensitively, review stages point at a
/// resolvable approval target in the same set, and review links resolve to
/// stages actually flagged as review stages.
pub fn validate_stage_set(stages: &[StageRecord]) -> AppResult<()> {
    if stages.is_empty() {
        return Err(AppError::BadRequest(
            "a project requires at least one stage".to_string(),
        ));
    }

    let mut titles = HashSet::new();
    for stage in stages {
        if !titles.insert(stage.title.trim().to_lowercase()) {
            return Err(AppError::BadRequest(format!(
                "duplicate stage title '{}'",
                stage.title
            )));
        }
    }

    for stage in stages {
        if stage.is_review() {
            let target = stage.approved_target_stage_id.as_deref().ok_or_else(|| {
                AppError::BadRequest(format!(
                    "review stage '{}' has no approval target stage",
                    stage.title
                ))
            })?;

            if !stages.iter().any(|candidate| candidate.id == target) {
                return Err(AppError::BadRequest(format!(
                    "review stage '{}' points at an unknown approval target stage",
                    stage.title
                )));
            }
        } else if let Some(linked) = stage.linked_review_stage_id.as_deref() {
            let resolved = stages.iter().find(|candidate| candidate.id == linked);
            match resolved {
                Some(candidate) if candidate.is_review() => {}
                Some(candidate) => {
                    return Err(AppError::BadRequest(format!(
                        "stage '{}' links to '{}', which is not a review stage",
                        stage.title, candidate.title
                    )));
                }
                None => {
                    return Err(AppError::BadRequest(format!(
                        "stage '{}' links to an unknown review stage",
                        stage.title
                    )));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::test_support::stage;

    #[test]
    fn sorts_and_finds_last_and_next() {
        let stages = vec![
            stage("dev", "Development", 3),
            stage("plan", "Planning", 0),
            stage("design", "Design", 1),
            stage("review", "Review", 2),
        ];
        let graph = StageGraph::new(&stages);

        let order: Vec<&str> = graph
            .sorted_by_position()
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(order, ["plan", "design", "review", "dev"]);

        assert_eq!(graph.last_stage().unwrap().id, "dev");
        assert!(graph.is_last("dev"));
        assert!(!graph.is_last("plan"));

        let design = graph.get("design").unwrap();
        assert_eq!(graph.next_stage_after(design).unwrap().id, "review");
        let dev = graph.get("dev").unwrap();
        assert!(graph.next_stage_after(dev).is_none());
    }

    #[test]
    fn validate_rejects_duplicate_titles_case_insensitively() {
        let stages = vec![stage("a", "Design", 0), stage("b", " design ", 1)];
        assert!(validate_stage_set(&stages).is_err());
    }

    #[test]
    fn validate_rejects_empty_stage_set() {
        assert!(validate_stage_set(&[]).is_err());
    }

    #[test]
    fn validate_requires_resolvable_approval_target() {
        let mut review = stage("review", "Review", 1);
        review.is_review_stage = 1;
        let stages = vec![stage("design", "Design", 0), review.clone()];
        assert!(validate_stage_set(&stages).is_err());

        review.approved_target_stage_id = Some("design".to_string());
        let stages = vec![stage("design", "Design", 0), review.clone()];
        assert!(validate_stage_set(&stages).is_ok());

        review.approved_target_stage_id = Some("ghost".to_string());
        let stages = vec![stage("design", "Design", 0), review];
        assert!(validate_stage_set(&stages).is_err());
    }

    #[test]
    fn validate_requires_linked_stage_to_be_review() {
        let mut review = stage("review", "Review", 2);
        review.is_review_stage = 1;
        review.approved_target_stage_id = Some("design".to_string());

        let mut design = stage("design", "Design", 0);
        design.linked_review_stage_id = Some("review".to_string());
        assert!(validate_stage_set(&[design.clone(), review]).is_ok());

        design.linked_review_stage_id = Some("plain".to_string());
        let plain = stage("plain", "Plain", 1);
        assert!(validate_stage_set(&[design, plain]).is_err());
    }
}
