//! Property tests for mining, selection and the robust objective.

use proptest::prelude::*;

use prompt_evolve::compute::evolution::should_promote;
use prompt_evolve::compute::pairs::{
    candidate_pairs, classify_tier, mine_contrastive_pairs, mine_tiered_pairs, tier_quotas,
};
use prompt_evolve::compute::stats::robust_objective;
use prompt_evolve::compute::tournament::{dominates, select_nqd};
use prompt_evolve::schema::{
    Candidate, GenerationRun, MinerConfig, QualityTier, TournamentConfig,
};

const WORDS: [&str; 8] = [
    "checkout", "payment", "refund", "report", "account", "search", "invoice", "shipping",
];

fn text(words: &[usize]) -> String {
    words
        .iter()
        .map(|&w| WORDS[w % WORDS.len()])
        .collect::<Vec<_>>()
        .join(" ")
}

fn run(task: usize, seed: u64, score: f64, words: &[usize]) -> GenerationRun {
    GenerationRun {
        task_id: format!("E{}", task),
        seed,
        score,
        pass: score >= 0.5,
        output: serde_json::Value::Null,
        raw_text: text(words),
        subscores: None,
        gate_decision: None,
        failure: None,
    }
}

fn runs_strategy() -> impl Strategy<Value = Vec<GenerationRun>> {
    prop::collection::vec(
        (
            0usize..3,
            0.0f64..=1.0,
            prop::collection::vec(0usize..WORDS.len(), 1..5),
        ),
        2..24,
    )
    .prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (task, score, words))| run(task, 1000 + i as u64, score, &words))
            .collect()
    })
}

fn candidates_strategy() -> impl Strategy<Value = Vec<Candidate>> {
    prop::collection::vec(
        (
            -0.5f64..1.0,
            0.0f64..=1.0,
            any::<bool>(),
            prop::collection::vec(0usize..WORDS.len(), 1..5),
        ),
        0..10,
    )
    .prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (objective, pass_rate, schema_valid, words))| {
                let mut c = Candidate::new(format!("c{}", i), text(&words));
                c.objective = objective;
                c.pass_rate = pass_rate;
                c.schema_valid = schema_valid;
                c
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_mined_pairs_meet_thresholds(
        runs in runs_strategy(),
        min_sim in 0.0f64..1.0,
        min_delta in 0.0f64..0.5,
    ) {
        let config = MinerConfig { min_sim, min_delta, ..MinerConfig::default() };
        let pairs = mine_contrastive_pairs(&runs, &config);

        prop_assert!(pairs.len() <= config.max_pairs);
        for pair in &pairs {
            prop_assert!(pair.sim >= config.min_sim);
            prop_assert!(pair.delta >= config.min_delta);
            prop_assert!(pair.good.score >= pair.bad.score);
            prop_assert_eq!(&pair.good.task_id, &pair.bad.task_id);
        }
        for w in pairs.windows(2) {
            prop_assert!(w[0].delta >= w[1].delta);
        }
    }

    #[test]
    fn prop_tiered_mining_respects_tiers_and_quotas(runs in runs_strategy()) {
        let config = MinerConfig { min_sim: 0.0, min_delta: 0.05, tiered: true, ..MinerConfig::default() };
        let pairs = mine_tiered_pairs(&runs, &config);

        prop_assert!(pairs.len() <= config.max_pairs);
        for pair in &pairs {
            prop_assert!(pair.good.score >= pair.bad.score);
            if pair.tier == Some(QualityTier::High) {
                prop_assert!(pair.good.score >= config.tiers.high);
            }
        }

        let available = candidate_pairs(&runs, &config);
        let available_in = |tier| {
            available
                .iter()
                .filter(|p| classify_tier(p.good.score, &config.tiers) == tier)
                .count()
        };
        let quotas = tier_quotas(config.max_pairs, &config);
        if quotas.iter().all(|&(tier, quota)| available_in(tier) >= quota) {
            for (tier, quota) in quotas {
                let selected = pairs.iter().filter(|p| p.tier == Some(tier)).count();
                prop_assert_eq!(selected, quota);
            }
        }
    }

    #[test]
    fn prop_pareto_front_is_mutually_non_dominated(
        candidates in candidates_strategy(),
        baseline in 0.0f64..0.8,
    ) {
        let outcome = select_nqd(&candidates, baseline, &TournamentConfig::default());
        let archive = outcome.archive.expect("NQD outcome carries an archive");
        let front = &archive.pareto_front;

        for a in &front.front {
            for b in &front.front {
                prop_assert!(!dominates(
                    (a.reliability, a.use_value),
                    (b.reliability, b.use_value)
                ));
            }
        }
        for c in &front.ineligible {
            prop_assert!(!c.constraint_fit && c.use_value < 0.0);
        }
        prop_assert_eq!(
            front.front.len() + front.dominated.len() + front.ineligible.len(),
            candidates.len()
        );

        match &outcome.winner {
            Some(winner) => {
                prop_assert!(front.front.iter().any(|c| c.id() == winner.id));
            }
            None => prop_assert!(front.front.is_empty()),
        }
    }

    #[test]
    fn prop_objective_is_monotone(
        mean_of_means in 0.0f64..=1.0,
        mean_std in 0.0f64..=0.5,
        pass_rate in 0.0f64..=1.0,
        bump in 0.001f64..0.5,
    ) {
        let base = robust_objective(mean_of_means, mean_std, pass_rate, 0.25, 0.4);

        prop_assert!(robust_objective(mean_of_means + bump, mean_std, pass_rate, 0.25, 0.4) > base);
        prop_assert!(robust_objective(mean_of_means, mean_std + bump, pass_rate, 0.25, 0.4) < base);
        prop_assert!(robust_objective(mean_of_means, mean_std, pass_rate - bump, 0.25, 0.4) < base);
    }

    #[test]
    fn prop_promotion_requires_strict_improvement(
        champion in 0.0f64..1.0,
        threshold in 0.0f64..0.1,
        gain in 0.0f64..0.2,
    ) {
        prop_assert!(!should_promote(champion + threshold, champion, threshold));
        if gain > threshold + 1e-6 {
            prop_assert!(should_promote(champion + gain, champion, threshold));
        }
        if gain < threshold {
            prop_assert!(!should_promote(champion + gain, champion, threshold));
        }
    }
}
