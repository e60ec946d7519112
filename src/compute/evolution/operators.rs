//! Meta-evolution of the mutation operators that steer patch proposals.
//!
//! The population is an arena of [`MutationPrompt`] records keyed by id.
//! Every update returns a new population, leaving the input untouched.

use rand::Rng;

use crate::schema::{MutationPrompt, OperatorKind, OperatorPopulation};

/// Fitness and success rate assigned to new operators.
pub const NEUTRAL_FITNESS: f64 = 0.5;

/// How many recent uses are remembered for exclusion.
const RECENT_CAPACITY: usize = 16;

const SEED_OPERATORS: [(&str, OperatorKind, &str); 5] = [
    (
        "example-guided",
        OperatorKind::ExampleGuided,
        "Use the best output in the pairs as a model. Write guidance that would make every \
         output look like it, naming the concrete qualities it has that the weaker one lacks.",
    ),
    (
        "statistical-pattern",
        OperatorKind::StatisticalPattern,
        "Look across all pairs for the defect that recurs most often. Write guidance that \
         removes that recurring pattern rather than any single failure.",
    ),
    (
        "failure-focused",
        OperatorKind::FailureFocused,
        "Pick the most severe failure among the weaker outputs and write one precise rule \
         that prevents it.",
    ),
    (
        "simplification",
        OperatorKind::Simplification,
        "Tighten the current guidance: merge overlapping rules, drop rules the pairs do not \
         support, and keep the remaining guidance short.",
    ),
    (
        "hypermutation",
        OperatorKind::Hypermutation,
        "Rewrite the given mutation instruction so that it produces more effective prompt \
         patches. Keep its intent, sharpen its focus, and return only the new instruction.",
    ),
];

fn seed_operator(id: &str, kind: OperatorKind, text: &str) -> MutationPrompt {
    MutationPrompt {
        id: id.to_string(),
        text: text.to_string(),
        kind,
        fitness: NEUTRAL_FITNESS,
        success_rate: NEUTRAL_FITNESS,
        usage_count: 0,
        generation: 0,
        parent_id: None,
    }
}

impl OperatorPopulation {
    /// The initial operator set, one per category.
    pub fn seeded() -> Self {
        Self {
            operators: SEED_OPERATORS
                .iter()
                .map(|(id, kind, text)| (id.to_string(), seed_operator(id, *kind, text)))
                .collect(),
            ..Default::default()
        }
    }

    pub fn get(&self, id: &str) -> Option<&MutationPrompt> {
        self.operators.get(id)
    }

    /// Operators that mutate prompts (everything but hypermutation).
    pub fn regular(&self) -> impl Iterator<Item = &MutationPrompt> {
        self.operators
            .values()
            .filter(|op| op.kind != OperatorKind::Hypermutation)
    }

    /// Fitness-proportional choice among regular operators, skipping the
    /// last `exclusion_window` used. Falls back to all regular operators if
    /// the exclusion would leave none.
    pub fn select<R: Rng>(&self, exclusion_window: usize, rng: &mut R) -> Option<String> {
        let excluded: Vec<&String> = self.recent.iter().rev().take(exclusion_window).collect();
        let mut pool: Vec<&MutationPrompt> = self
            .regular()
            .filter(|op| !excluded.contains(&&op.id))
            .collect();
        if pool.is_empty() {
            pool = self.regular().collect();
        }
        if pool.is_empty() {
            return None;
        }

        let total: f64 = pool.iter().map(|op| op.fitness.max(0.0)).sum();
        if total <= 0.0 {
            return Some(pool[rng.gen_range(0..pool.len())].id.clone());
        }
        let target = rng.gen_range(0.0..total);
        let mut cumulative = 0.0;
        for op in &pool {
            cumulative += op.fitness.max(0.0);
            if target < cumulative {
                return Some(op.id.clone());
            }
        }
        pool.last().map(|op| op.id.clone())
    }

    /// Record one use of `id`.
    pub fn with_usage(&self, id: &str) -> Self {
        let mut next = self.clone();
        if let Some(op) = next.operators.get_mut(id) {
            op.usage_count += 1;
            next.recent.push(id.to_string());
            if next.recent.len() > RECENT_CAPACITY {
                let overflow = next.recent.len() - RECENT_CAPACITY;
                next.recent.drain(..overflow);
            }
        }
        next
    }

    /// EMA update of `id`'s success rate; fitness mirrors it.
    pub fn with_outcome(&self, id: &str, beat_champion: bool, alpha: f64) -> Self {
        let mut next = self.clone();
        if let Some(op) = next.operators.get_mut(id) {
            let hit = if beat_champion { 1.0 } else { 0.0 };
            op.success_rate = (alpha * hit + (1.0 - alpha) * op.success_rate).clamp(0.0, 1.0);
            op.fitness = op.success_rate;
        }
        next
    }

    /// `(hypermutation operator, lowest-fitness regular operator)`, if both
    /// exist.
    pub fn hypermutation_target(&self) -> Option<(&MutationPrompt, &MutationPrompt)> {
        let hyper = self
            .operators
            .values()
            .filter(|op| op.kind == OperatorKind::Hypermutation)
            .max_by(|a, b| a.fitness.total_cmp(&b.fitness))?;
        let target = self
            .regular()
            .min_by(|a, b| a.fitness.total_cmp(&b.fitness))?;
        Some((hyper, target))
    }

    /// Replace `target_id` with an evolved operator carrying `text`.
    ///
    /// Returns the new population and the evolved operator's id, or `None`
    /// if `target_id` is unknown.
    pub fn with_evolved(&self, target_id: &str, text: impl Into<String>) -> Option<(Self, String)> {
        let target = self.operators.get(target_id)?;

        let mut next = self.clone();
        let generation = target.generation + 1;
        let id = format!("{}-g{}-{}", kind_slug(target.kind), generation, next.next_serial);
        next.next_serial += 1;

        let evolved = MutationPrompt {
            id: id.clone(),
            text: text.into(),
            kind: target.kind,
            fitness: NEUTRAL_FITNESS,
            success_rate: NEUTRAL_FITNESS,
            usage_count: 0,
            generation,
            parent_id: Some(target_id.to_string()),
        };

        if let Some(retired) = next.operators.remove(target_id) {
            next.retired.insert(target_id.to_string(), retired);
        }
        next.recent.retain(|r| r != target_id);
        next.operators.insert(id.clone(), evolved);
        Some((next, id))
    }

    /// Ancestor chain of `id`, starting with `id` itself.
    pub fn lineage(&self, id: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = Some(id.to_string());
        while let Some(cur) = current {
            let Some(op) = self.operators.get(&cur).or_else(|| self.retired.get(&cur)) else {
                break;
            };
            if chain.contains(&cur) {
                break;
            }
            current = op.parent_id.clone();
            chain.push(cur);
        }
        chain
    }
}

fn kind_slug(kind: OperatorKind) -> &'static str {
    match kind {
        OperatorKind::ExampleGuided => "example-guided",
        OperatorKind::StatisticalPattern => "statistical-pattern",
        OperatorKind::FailureFocused => "failure-focused",
        OperatorKind::Simplification => "simplification",
        OperatorKind::Hypermutation => "hypermutation",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_seeded_population_covers_categories() {
        let population = OperatorPopulation::seeded();
        assert_eq!(population.operators.len(), 5);
        assert_eq!(population.regular().count(), 4);
        assert!(population.operators.values().all(|op| op.fitness == 0.5));
    }

    #[test]
    fn test_select_excludes_recent() {
        let population = OperatorPopulation::seeded()
            .with_usage("example-guided")
            .with_usage("statistical-pattern");
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let id = population.select(2, &mut rng).unwrap();
            assert!(id == "failure-focused" || id == "simplification");
        }
    }

    #[test]
    fn test_select_never_picks_hypermutation() {
        let mut rng = StdRng::seed_from_u64(1);
        let population = OperatorPopulation::seeded();
        for _ in 0..50 {
            assert_ne!(population.select(0, &mut rng).unwrap(), "hypermutation");
        }
    }

    #[test]
    fn test_select_is_fitness_proportional() {
        let mut population = OperatorPopulation::seeded();
        for op in population.operators.values_mut() {
            op.fitness = 0.0;
        }
        if let Some(op) = population.operators.get_mut("simplification") {
            op.fitness = 1.0;
        }
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            assert_eq!(population.select(0, &mut rng).unwrap(), "simplification");
        }
    }

    #[test]
    fn test_outcome_is_ema_and_pure() {
        let population = OperatorPopulation::seeded();
        let updated = population.with_outcome("failure-focused", true, 0.3);

        let op = updated.get("failure-focused").unwrap();
        assert!((op.success_rate - 0.65).abs() < 1e-12);
        assert_eq!(op.fitness, op.success_rate);
        assert_eq!(population.get("failure-focused").unwrap().success_rate, 0.5);

        let lowered = updated.with_outcome("failure-focused", false, 0.3);
        assert!((lowered.get("failure-focused").unwrap().success_rate - 0.455).abs() < 1e-12);
    }

    #[test]
    fn test_hypermutation_replaces_weakest_with_lineage() {
        let population = OperatorPopulation::seeded()
            .with_outcome("simplification", false, 0.3)
            .with_usage("simplification");
        let (hyper, target) = population.hypermutation_target().unwrap();
        assert_eq!(hyper.id, "hypermutation");
        assert_eq!(target.id, "simplification");

        let (evolved, new_id) = population
            .with_evolved("simplification", "Cut every rule the pairs do not justify.")
            .unwrap();
        assert!(evolved.get("simplification").is_none());
        assert!(!evolved.recent.contains(&"simplification".to_string()));

        let op = evolved.get(&new_id).unwrap();
        assert_eq!(op.parent_id.as_deref(), Some("simplification"));
        assert_eq!(op.generation, 1);
        assert_eq!(op.fitness, NEUTRAL_FITNESS);
        assert_eq!(op.kind, OperatorKind::Simplification);
        assert_eq!(
            evolved.lineage(&new_id),
            vec![new_id.clone(), "simplification".to_string()]
        );
    }

    #[test]
    fn test_evolving_unknown_operator_is_none() {
        assert!(OperatorPopulation::seeded().with_evolved("nope", "x").is_none());
    }
}
