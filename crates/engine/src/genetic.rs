//! Genetic search over a parameter space
//!
//! One search optimizes one in-sample window. Each generation is ranked,
//! the top `elitism` individuals are copied forward unchanged and the rest
//! of the population is bred by selection, crossover and mutation. All
//! randomness flows through the caller's RNG in a fixed order, so a seeded
//! search is reproducible even when evaluation runs on the rayon pool.

use rand::rngs::StdRng;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::OptimizerError;
use crate::fitness::{try_score, FitnessFunction, WORST_FITNESS};
use crate::params::{ParamDomain, ParameterSpace, ParameterVector};
use crate::types::Kline;

// ============================================================================
// Configuration
// ============================================================================

/// Upper bound for `mutation_scale` and the BLX `alpha`, in domain widths
pub const MAX_VARIATION_SCALE: f64 = 10.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    /// Best of `tournament_size` random picks
    #[default]
    Tournament,
    /// Fitness-proportional
    Roulette,
}

impl std::str::FromStr for SelectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tournament" => Ok(SelectionMethod::Tournament),
            "roulette" | "proportional" => Ok(SelectionMethod::Roulette),
            other => Err(format!("unknown selection method '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossoverMethod {
    /// Each parameter taken from either parent with equal odds
    #[default]
    Uniform,
    /// BLX-alpha: uniform draw from the parents' range widened by `alpha` on each side
    Blend { alpha: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneticConfig {
    pub population_size: usize,
    /// Generation count, including the initial random one
    pub generations: usize,
    /// Per-parameter mutation probability
    pub mutation_rate: f64,
    pub crossover_rate: f64,
    /// Individuals copied unchanged into the next generation
    pub elitism: usize,
    pub tournament_size: usize,
    /// Mutation step as a fraction of the domain width
    pub mutation_scale: f64,
    /// Stop after this many generations without improvement
    pub stagnation_limit: Option<usize>,
    pub selection: SelectionMethod,
    pub crossover: CrossoverMethod,
}

impl Default for GeneticConfig {
    fn default() -> Self {
        Self {
            population_size: 40,
            generations: 30,
            mutation_rate: 0.2,
            crossover_rate: 0.8,
            elitism: 2,
            tournament_size: 3,
            mutation_scale: 0.15,
            stagnation_limit: Some(10),
            selection: SelectionMethod::Tournament,
            crossover: CrossoverMethod::Uniform,
        }
    }
}

impl GeneticConfig {
    pub fn validate(&self) -> Result<(), OptimizerError> {
        let invalid = |msg: String| Err(OptimizerError::InvalidConfig(msg));

        if self.population_size == 0 {
            return invalid("population_size must be at least 1".to_string());
        }
        if self.generations == 0 {
            return invalid("generations must be at least 1".to_string());
        }
        for (name, rate) in [
            ("mutation_rate", self.mutation_rate),
            ("crossover_rate", self.crossover_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return invalid(format!("{name} must be within [0, 1], got {rate}"));
            }
        }
        if self.elitism > self.population_size {
            return invalid(format!(
                "elitism {} exceeds population_size {}",
                self.elitism, self.population_size
            ));
        }
        if self.tournament_size == 0 {
            return invalid("tournament_size must be at least 1".to_string());
        }
        if self.mutation_scale.is_nan()
            || self.mutation_scale <= 0.0
            || self.mutation_scale > MAX_VARIATION_SCALE
        {
            return invalid(format!(
                "mutation_scale must be within (0, {MAX_VARIATION_SCALE}], got {}",
                self.mutation_scale
            ));
        }
        if self.stagnation_limit == Some(0) {
            return invalid("stagnation_limit must be at least 1 when set".to_string());
        }
        if let CrossoverMethod::Blend { alpha } = self.crossover {
            if !(0.0..=MAX_VARIATION_SCALE).contains(&alpha) {
                return invalid(format!(
                    "blend alpha must be within [0, {MAX_VARIATION_SCALE}], got {alpha}"
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Search state
// ============================================================================

/// A scored parameter vector. Failed evaluations carry `WORST_FITNESS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Individual {
    params: ParameterVector,
    fitness: f64,
}

impl Individual {
    pub(crate) fn new(params: ParameterVector, fitness: f64) -> Self {
        Self { params, fitness }
    }

    pub fn params(&self) -> &ParameterVector {
        &self.params
    }

    pub fn fitness(&self) -> f64 {
        self.fitness
    }

    pub fn is_scored(&self) -> bool {
        self.fitness > WORST_FITNESS
    }

    pub fn into_params(self) -> ParameterVector {
        self.params
    }
}

/// One population snapshot
#[derive(Debug, Clone)]
pub struct Generation {
    pub index: usize,
    pub individuals: Vec<Individual>,
}

impl Generation {
    /// Highest fitness; the earliest individual wins ties
    pub fn best(&self) -> Option<&Individual> {
        self.individuals
            .iter()
            .reduce(|best, ind| if ind.fitness > best.fitness { ind } else { best })
    }

    /// Individual indices from fittest to least fit. Stable, so ties keep
    /// population order.
    fn ranking(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.individuals.len()).collect();
        order.sort_by(|&a, &b| {
            self.individuals[b]
                .fitness
                .total_cmp(&self.individuals[a].fitness)
        });
        order
    }

    fn stats(&self, best_seen: f64) -> GenerationStats {
        let scored: Vec<f64> = self
            .individuals
            .iter()
            .filter(|i| i.is_scored())
            .map(|i| i.fitness)
            .collect();
        let mean = if scored.is_empty() {
            WORST_FITNESS
        } else {
            scored.iter().sum::<f64>() / scored.len() as f64
        };
        GenerationStats {
            index: self.index,
            best: self.best().map(|i| i.fitness).unwrap_or(WORST_FITNESS),
            mean,
            best_seen,
            failed: self.individuals.len() - scored.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub index: usize,
    /// Best fitness in this generation
    pub best: f64,
    /// Mean over successfully scored individuals
    pub mean: f64,
    /// Best fitness seen so far in the search
    pub best_seen: f64,
    /// Evaluations that failed or were non-finite
    pub failed: usize,
}

/// Why a search stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Ran every configured generation
    Completed,
    /// No improvement for `stagnation_limit` generations
    Stagnated,
    /// Wall-clock deadline reached
    BudgetExhausted,
    Cancelled,
}

impl Termination {
    /// Search stopped before it was done for reasons outside the search itself
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Termination::BudgetExhausted | Termination::Cancelled)
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Completed => write!(f, "completed"),
            Termination::Stagnated => write!(f, "stagnated"),
            Termination::BudgetExhausted => write!(f, "budget_exhausted"),
            Termination::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best: Individual,
    pub generations_run: usize,
    pub history: Vec<GenerationStats>,
    pub termination: Termination,
}

// ============================================================================
// Engine
// ============================================================================

pub struct GeneticSearch<'a> {
    config: &'a GeneticConfig,
    space: &'a ParameterSpace,
    parallel: bool,
    deadline: Option<Instant>,
    cancelled: Option<&'a AtomicBool>,
    observer: Option<&'a (dyn Fn(&GenerationStats) + Sync)>,
}

impl<'a> GeneticSearch<'a> {
    pub fn new(config: &'a GeneticConfig, space: &'a ParameterSpace) -> Result<Self, OptimizerError> {
        config.validate()?;
        Ok(Self {
            config,
            space,
            parallel: false,
            deadline: None,
            cancelled: None,
            observer: None,
        })
    }

    /// Evaluate each generation on the rayon pool
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_cancel_flag(mut self, cancelled: &'a AtomicBool) -> Self {
        self.cancelled = Some(cancelled);
        self
    }

    /// Called once per finished generation
    pub fn with_observer(mut self, observer: &'a (dyn Fn(&GenerationStats) + Sync)) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Evolve against `window` and return the best individual seen.
    ///
    /// The initial generation is always evaluated, so there is a best-so-far
    /// even when the deadline has already passed.
    pub fn run(&self, fitness: &dyn FitnessFunction, window: &[Kline], rng: &mut StdRng) -> SearchOutcome {
        let initial: Vec<ParameterVector> = (0..self.config.population_size)
            .map(|_| self.space.sample(rng))
            .collect();
        let mut generation = Generation {
            index: 0,
            individuals: self.evaluate(fitness, window, initial),
        };

        let mut best = generation
            .best()
            .cloned()
            .unwrap_or_else(|| Individual::new(self.space.sample(rng), WORST_FITNESS));
        let mut history = Vec::with_capacity(self.config.generations);
        let mut stale = 0usize;
        self.record(&generation, best.fitness, &mut history);

        let mut termination = Termination::Completed;
        for index in 1..self.config.generations {
            if let Some(stop) = self.interrupted() {
                termination = stop;
                break;
            }
            if self.config.stagnation_limit.is_some_and(|limit| stale >= limit) {
                termination = Termination::Stagnated;
                break;
            }

            generation = if self.config.population_size == 1 {
                self.hill_climb(fitness, window, &generation, index, rng)
            } else {
                self.breed(fitness, window, &generation, index, rng)
            };

            match generation.best() {
                Some(candidate) if candidate.fitness > best.fitness => {
                    best = candidate.clone();
                    stale = 0;
                }
                _ => stale += 1,
            }
            self.record(&generation, best.fitness, &mut history);
        }

        if termination == Termination::BudgetExhausted {
            warn!(
                generations = history.len(),
                best = best.fitness,
                "Search budget exhausted, returning best so far"
            );
        }

        SearchOutcome {
            best,
            generations_run: history.len(),
            history,
            termination,
        }
    }

    fn interrupted(&self) -> Option<Termination> {
        if self.cancelled.is_some_and(|c| c.load(Ordering::Relaxed)) {
            return Some(Termination::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(Termination::BudgetExhausted);
        }
        None
    }

    fn record(&self, generation: &Generation, best_seen: f64, history: &mut Vec<GenerationStats>) {
        let stats = generation.stats(best_seen);
        debug!(
            generation = stats.index,
            best = stats.best,
            mean = stats.mean,
            best_seen = stats.best_seen,
            failed = stats.failed,
            "Generation evaluated"
        );
        if let Some(observer) = self.observer {
            observer(&stats);
        }
        history.push(stats);
    }

    /// Score a batch of vectors; results keep input order
    fn evaluate(
        &self,
        fitness: &dyn FitnessFunction,
        window: &[Kline],
        candidates: Vec<ParameterVector>,
    ) -> Vec<Individual> {
        let scores: Vec<Option<f64>> = if self.parallel {
            candidates
                .par_iter()
                .map(|params| try_score(fitness, params, window))
                .collect()
        } else {
            candidates
                .iter()
                .map(|params| try_score(fitness, params, window))
                .collect()
        };

        candidates
            .into_iter()
            .zip(scores)
            .map(|(params, score)| Individual::new(params, score.unwrap_or(WORST_FITNESS)))
            .collect()
    }

    fn breed(
        &self,
        fitness: &dyn FitnessFunction,
        window: &[Kline],
        parents: &Generation,
        index: usize,
        rng: &mut StdRng,
    ) -> Generation {
        let size = self.config.population_size;
        let ranking = parents.ranking();

        let mut individuals: Vec<Individual> = ranking
            .iter()
            .take(self.config.elitism)
            .map(|&i| parents.individuals[i].clone())
            .collect();

        let children: Vec<ParameterVector> = (individuals.len()..size)
            .map(|_| {
                let a = self.select(parents, rng);
                let b = self.select(parents, rng);
                let mut child = if rng.gen_bool(self.config.crossover_rate) {
                    self.crossover(a.params(), b.params(), rng)
                } else {
                    a.params().clone()
                };
                self.mutate(&mut child, rng, false);
                child
            })
            .collect();

        individuals.extend(self.evaluate(fitness, window, children));
        Generation { index, individuals }
    }

    /// Population of one: the mutated child replaces the parent only when strictly fitter
    fn hill_climb(
        &self,
        fitness: &dyn FitnessFunction,
        window: &[Kline],
        current: &Generation,
        index: usize,
        rng: &mut StdRng,
    ) -> Generation {
        let parent = &current.individuals[0];
        let mut child = parent.params().clone();
        self.mutate(&mut child, rng, true);

        let scored = self.evaluate(fitness, window, vec![child]);
        let survivor = match scored.into_iter().next() {
            Some(child) if child.fitness > parent.fitness => child,
            _ => parent.clone(),
        };
        Generation {
            index,
            individuals: vec![survivor],
        }
    }

    fn select<'g>(&self, generation: &'g Generation, rng: &mut StdRng) -> &'g Individual {
        let individuals = &generation.individuals;
        match self.config.selection {
            SelectionMethod::Tournament => {
                let mut winner = rng.gen_range(0..individuals.len());
                for _ in 1..self.config.tournament_size {
                    let challenger = rng.gen_range(0..individuals.len());
                    let (w, c) = (&individuals[winner], &individuals[challenger]);
                    if c.fitness > w.fitness || (c.fitness == w.fitness && challenger < winner) {
                        winner = challenger;
                    }
                }
                &individuals[winner]
            }
            SelectionMethod::Roulette => {
                // Shift so the weakest scored individual still has a sliver of weight
                let floor = individuals
                    .iter()
                    .filter(|i| i.is_scored())
                    .map(|i| i.fitness)
                    .fold(f64::INFINITY, f64::min);
                let weights: Vec<f64> = individuals
                    .iter()
                    .map(|i| {
                        if i.is_scored() {
                            i.fitness - floor + 1e-9
                        } else {
                            0.0
                        }
                    })
                    .collect();
                let total: f64 = weights.iter().sum();
                if !total.is_finite() || total <= 0.0 {
                    return &individuals[rng.gen_range(0..individuals.len())];
                }

                let mut target = rng.gen_range(0.0..total);
                for (i, w) in weights.iter().enumerate() {
                    if target < *w {
                        return &individuals[i];
                    }
                    target -= w;
                }
                // Rounding can leave the target just past the last weight
                let last = weights.iter().rposition(|w| *w > 0.0).unwrap_or(0);
                &individuals[last]
            }
        }
    }

    fn crossover(&self, a: &ParameterVector, b: &ParameterVector, rng: &mut StdRng) -> ParameterVector {
        self.space
            .domains()
            .iter()
            .map(|d| {
                let x = a.get(&d.name).unwrap_or(d.min);
                let y = b.get(&d.name).unwrap_or(d.min);
                let value = match self.config.crossover {
                    CrossoverMethod::Uniform => {
                        if rng.gen_bool(0.5) {
                            x
                        } else {
                            y
                        }
                    }
                    CrossoverMethod::Blend { alpha } => {
                        let (lo, hi) = (x.min(y), x.max(y));
                        if hi > lo {
                            // Position relative to the parents; may overshoot, clamped below
                            let t = rng.gen_range(-alpha..=1.0 + alpha);
                            lo + t * (hi - lo)
                        } else {
                            lo
                        }
                    }
                };
                (d.name.clone(), bounded(d, value))
            })
            .collect()
    }

    /// Perturb parameters by up to `mutation_scale` of their domain width.
    /// `force` guarantees at least one parameter is touched.
    fn mutate(&self, params: &mut ParameterVector, rng: &mut StdRng, force: bool) {
        let domains = self.space.domains();
        let forced = force.then(|| rng.gen_range(0..domains.len()));

        for (i, d) in domains.iter().enumerate() {
            if !rng.gen_bool(self.config.mutation_rate) && forced != Some(i) {
                continue;
            }
            let current = params.get(&d.name).unwrap_or(d.min);
            let step = (d.width() * self.config.mutation_scale).min(f64::MAX);
            let delta = if step > 0.0 {
                rng.gen_range(-1.0..=1.0) * step
            } else {
                0.0
            };
            params.set(d.name.clone(), bounded(d, current + delta));
        }
    }
}

fn bounded(domain: &ParamDomain, value: f64) -> f64 {
    let value = domain.clamp(value);
    debug_assert!(domain.contains(value), "{} out of domain: {value}", domain.name);
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvaluationError;
    use crate::test_support::trending_klines;
    use rand::SeedableRng;

    fn space() -> ParameterSpace {
        ParameterSpace::new(vec![
            ParamDomain::continuous("x", -5.0, 5.0),
            ParamDomain::integer("n", 1, 20),
        ])
        .unwrap()
    }

    /// Peak at x = 1.5, n = 7
    fn peak(p: &ParameterVector, _: &[Kline]) -> Result<f64, EvaluationError> {
        let x = p.require("x")?;
        let n = p.require("n")?;
        Ok(-(x - 1.5).powi(2) - (n - 7.0).powi(2))
    }

    fn search(config: &GeneticConfig, seed: u64) -> SearchOutcome {
        let space = space();
        let bars = trending_klines(10, 100.0, 1.0);
        let mut rng = StdRng::seed_from_u64(seed);
        GeneticSearch::new(config, &space)
            .unwrap()
            .run(&peak, &bars, &mut rng)
    }

    #[test]
    fn test_finds_the_peak() {
        let config = GeneticConfig {
            population_size: 30,
            generations: 40,
            stagnation_limit: None,
            ..Default::default()
        };
        let outcome = search(&config, 7);
        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.generations_run, 40);
        assert!(outcome.best.fitness() > -1.0, "best {}", outcome.best.fitness());
    }

    #[test]
    fn test_best_seen_is_monotonic() {
        for selection in [SelectionMethod::Tournament, SelectionMethod::Roulette] {
            let config = GeneticConfig {
                selection,
                elitism: 0,
                stagnation_limit: None,
                ..Default::default()
            };
            let outcome = search(&config, 3);
            for pair in outcome.history.windows(2) {
                assert!(pair[1].best_seen >= pair[0].best_seen);
            }
            assert_eq!(outcome.history.last().unwrap().best_seen, outcome.best.fitness());
        }
    }

    #[test]
    fn test_elitism_keeps_generation_best_from_dropping() {
        let config = GeneticConfig {
            elitism: 3,
            stagnation_limit: None,
            ..Default::default()
        };
        let outcome = search(&config, 11);
        for pair in outcome.history.windows(2) {
            assert!(pair[1].best >= pair[0].best);
        }
    }

    #[test]
    fn test_elites_survive_unchanged() {
        let space = space();
        let config = GeneticConfig {
            population_size: 6,
            elitism: 3,
            mutation_rate: 1.0,
            ..Default::default()
        };
        // Fitness stored on the parents differs from what `peak` would give,
        // so a re-evaluated elite would show up
        let parents = Generation {
            index: 4,
            individuals: [
                (-4.0, 3.0, 1.0),
                (2.0, 9.0, 50.0),
                (0.5, 5.0, 7.0),
                (-1.0, 12.0, 50.0),
                (3.0, 1.0, -2.0),
                (4.5, 20.0, 9.0),
            ]
            .into_iter()
            .map(|(x, n, fitness)| {
                Individual::new(ParameterVector::new().with("x", x).with("n", n), fitness)
            })
            .collect(),
        };

        let search = GeneticSearch::new(&config, &space).unwrap();
        let mut rng = StdRng::seed_from_u64(8);
        let next = search.breed(&peak, &[], &parents, 5, &mut rng);

        assert_eq!(next.index, 5);
        assert_eq!(next.individuals.len(), 6);
        // Top three by fitness; the tie at 50 keeps population order
        assert_eq!(next.individuals[0], parents.individuals[1]);
        assert_eq!(next.individuals[1], parents.individuals[3]);
        assert_eq!(next.individuals[2], parents.individuals[5]);
        for child in &next.individuals[3..] {
            assert!(space.contains(child.params()));
            assert_eq!(child.fitness(), peak(child.params(), &[]).unwrap());
        }
    }

    #[test]
    fn test_extreme_variation_stays_in_wide_domain() {
        let space = ParameterSpace::new(vec![
            ParamDomain::continuous("x", -0.4e308, 0.4e308),
            ParamDomain::integer("n", -9_000_000_000_000_000, 9_000_000_000_000_000),
        ])
        .unwrap();
        let flat = |p: &ParameterVector, _: &[Kline]| -> Result<f64, EvaluationError> {
            Ok(p.require("x")? / 1e300)
        };
        for crossover in [
            CrossoverMethod::Uniform,
            CrossoverMethod::Blend {
                alpha: MAX_VARIATION_SCALE,
            },
        ] {
            let config = GeneticConfig {
                population_size: 10,
                generations: 10,
                mutation_rate: 1.0,
                mutation_scale: MAX_VARIATION_SCALE,
                crossover,
                ..Default::default()
            };
            let mut rng = StdRng::seed_from_u64(13);
            let outcome = GeneticSearch::new(&config, &space)
                .unwrap()
                .run(&flat, &[], &mut rng);
            assert!(space.contains(outcome.best.params()));
        }
    }

    #[test]
    fn test_every_candidate_stays_in_domain() {
        let space = space();
        let seen = std::sync::Mutex::new(Vec::new());
        let recorder = |p: &ParameterVector, _: &[Kline]| -> Result<f64, EvaluationError> {
            seen.lock().unwrap().push(p.clone());
            Ok(p.require("x")? * 1000.0)
        };
        let config = GeneticConfig {
            mutation_rate: 1.0,
            mutation_scale: 3.0,
            crossover: CrossoverMethod::Blend { alpha: 2.0 },
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        GeneticSearch::new(&config, &space)
            .unwrap()
            .run(&recorder, &[], &mut rng);

        let seen = seen.into_inner().unwrap();
        assert!(!seen.is_empty());
        for p in &seen {
            assert!(space.contains(p), "out of domain: {p}");
        }
    }

    #[test]
    fn test_same_seed_same_outcome() {
        let config = GeneticConfig::default();
        let a = search(&config, 42);
        let b = search(&config, 42);
        assert_eq!(a.best, b.best);
        assert_eq!(a.history, b.history);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let space = space();
        let bars = trending_klines(10, 100.0, 1.0);
        let config = GeneticConfig::default();
        let run = |parallel: bool| {
            let mut rng = StdRng::seed_from_u64(9);
            GeneticSearch::new(&config, &space)
                .unwrap()
                .parallel(parallel)
                .run(&peak, &bars, &mut rng)
        };
        let (seq, par) = (run(false), run(true));
        assert_eq!(seq.best, par.best);
        assert_eq!(seq.history, par.history);
    }

    #[test]
    fn test_constant_zero_fitness() {
        let space = space();
        let zero = |_: &ParameterVector, _: &[Kline]| -> Result<f64, EvaluationError> { Ok(0.0) };
        let config = GeneticConfig {
            generations: 12,
            stagnation_limit: None,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let outcome = GeneticSearch::new(&config, &space)
            .unwrap()
            .run(&zero, &[], &mut rng);
        assert_eq!(outcome.generations_run, 12);
        assert_eq!(outcome.best.fitness(), 0.0);
        assert!(space.contains(outcome.best.params()));
    }

    #[test]
    fn test_stagnation_stops_early() {
        let space = space();
        let zero = |_: &ParameterVector, _: &[Kline]| -> Result<f64, EvaluationError> { Ok(0.0) };
        let config = GeneticConfig {
            generations: 50,
            stagnation_limit: Some(4),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let outcome = GeneticSearch::new(&config, &space)
            .unwrap()
            .run(&zero, &[], &mut rng);
        assert_eq!(outcome.termination, Termination::Stagnated);
        assert_eq!(outcome.generations_run, 5);
    }

    #[test]
    fn test_population_of_one_hill_climbs() {
        let config = GeneticConfig {
            population_size: 1,
            elitism: 0,
            generations: 200,
            mutation_rate: 0.5,
            stagnation_limit: None,
            ..Default::default()
        };
        let outcome = search(&config, 21);
        assert_eq!(outcome.generations_run, 200);
        // The single individual never gets worse
        for pair in outcome.history.windows(2) {
            assert!(pair[1].best >= pair[0].best);
        }
        assert_eq!(outcome.best.fitness(), outcome.history.last().unwrap().best);
    }

    #[test]
    fn test_failing_evaluations_get_worst_fitness() {
        let space = space();
        let picky = |p: &ParameterVector, _: &[Kline]| -> Result<f64, EvaluationError> {
            let x = p.require("x")?;
            if x < 0.0 {
                Err(EvaluationError::Failed("negative".to_string()))
            } else {
                Ok(x)
            }
        };
        let config = GeneticConfig {
            generations: 5,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(2);
        let outcome = GeneticSearch::new(&config, &space)
            .unwrap()
            .run(&picky, &[], &mut rng);
        assert!(outcome.history[0].failed > 0);
        assert!(outcome.best.is_scored());
        assert!(outcome.best.params().get("x").unwrap() >= 0.0);
    }

    #[test]
    fn test_all_failures_still_return_an_individual() {
        let space = space();
        let broken = |_: &ParameterVector, _: &[Kline]| -> Result<f64, EvaluationError> {
            Err(EvaluationError::Failed("always".to_string()))
        };
        let config = GeneticConfig {
            generations: 3,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(2);
        let outcome = GeneticSearch::new(&config, &space)
            .unwrap()
            .run(&broken, &[], &mut rng);
        assert_eq!(outcome.best.fitness(), WORST_FITNESS);
        assert!(space.contains(outcome.best.params()));
        assert_eq!(outcome.history[0].failed, config.population_size);
    }

    #[test]
    fn test_expired_deadline_returns_initial_best() {
        let space = space();
        let bars = trending_klines(10, 100.0, 1.0);
        let config = GeneticConfig::default();
        let mut rng = StdRng::seed_from_u64(4);
        let outcome = GeneticSearch::new(&config, &space)
            .unwrap()
            .with_deadline(Some(Instant::now()))
            .run(&peak, &bars, &mut rng);
        assert_eq!(outcome.termination, Termination::BudgetExhausted);
        assert_eq!(outcome.generations_run, 1);
        assert!(outcome.best.is_scored());
    }

    #[test]
    fn test_cancel_flag_stops_search() {
        let space = space();
        let cancelled = AtomicBool::new(true);
        let config = GeneticConfig::default();
        let mut rng = StdRng::seed_from_u64(4);
        let outcome = GeneticSearch::new(&config, &space)
            .unwrap()
            .with_cancel_flag(&cancelled)
            .run(&peak, &[], &mut rng);
        assert_eq!(outcome.termination, Termination::Cancelled);
    }

    #[test]
    fn test_selection_method_from_str() {
        assert_eq!("Tournament".parse(), Ok(SelectionMethod::Tournament));
        assert_eq!("roulette".parse(), Ok(SelectionMethod::Roulette));
        assert!("rank".parse::<SelectionMethod>().is_err());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let bad = [
            GeneticConfig {
                population_size: 0,
                ..Default::default()
            },
            GeneticConfig {
                mutation_rate: 1.5,
                ..Default::default()
            },
            GeneticConfig {
                elitism: 100,
                ..Default::default()
            },
            GeneticConfig {
                stagnation_limit: Some(0),
                ..Default::default()
            },
            GeneticConfig {
                crossover: CrossoverMethod::Blend { alpha: -1.0 },
                ..Default::default()
            },
            GeneticConfig {
                crossover: CrossoverMethod::Blend { alpha: 1e308 },
                ..Default::default()
            },
            GeneticConfig {
                mutation_scale: 1e308,
                ..Default::default()
            },
            GeneticConfig {
                mutation_scale: f64::NAN,
                ..Default::default()
            },
        ];
        for config in &bad {
            assert!(config.validate().is_err(), "{config:?}");
        }
        assert!(GeneticConfig::default().validate().is_ok());
    }
}
