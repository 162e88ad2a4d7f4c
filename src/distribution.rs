use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

use anyhow::Result;
use rand::distributions::Distribution as RandDistribution;
use rand::{Rng, SeedableRng};
use rand_distr::{Exp, Uniform, Zipf};
use rand_pcg::Pcg64Mcg;

pub type RngGen = Pcg64Mcg;

/// Mutable sampling state handed to a `Distribution`.
///
/// Distributions themselves are immutable and shared; every consumer owns
/// a context with its own seeded generator, so runs are reproducible and
/// generators never contend with each other.
pub struct DistributionContext {
    seq: u64,
    gen: RngGen,
}

impl DistributionContext {
    pub fn new(seq: u64, gen: RngGen) -> Self {
        DistributionContext { seq, gen }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(0, RngGen::seed_from_u64(seed))
    }

    pub fn get_seq(&self) -> u64 {
        self.seq
    }

    pub fn advance(&mut self) {
        self.seq += 1;
    }

    pub fn get_gen_mut(&mut self) -> &mut RngGen {
        &mut self.gen
    }

    // Uniform draw from (0, 1], safe to feed into ln() and negative powers.
    fn next_open_unit(&mut self) -> f64 {
        1.0 - self.gen.gen::<f64>()
    }
}

pub trait Distribution: Send + Sync {
    fn get_i64(&self, ctx: &mut DistributionContext) -> i64;
    fn get_f64(&self, ctx: &mut DistributionContext) -> f64 {
        self.get_i64(ctx) as f64
    }

    /// Expected value of the samples, if it has a closed form.
    fn mean(&self) -> Option<f64>;
}

pub struct FixedDistribution(pub i64);

impl Distribution for FixedDistribution {
    fn get_i64(&self, _ctx: &mut DistributionContext) -> i64 {
        self.0
    }

    fn mean(&self) -> Option<f64> {
        Some(self.0 as f64)
    }
}

/// Gaussian samples via the Box-Muller transform.
///
/// Negative results are not rejected; callers that need a positive value
/// have to clamp.
pub struct NormalDistribution {
    mean: f64,
    stddev: f64,
}

impl NormalDistribution {
    pub fn new(mean: f64, stddev: f64) -> Self {
        Self { mean, stddev }
    }
}

impl Distribution for NormalDistribution {
    fn get_i64(&self, ctx: &mut DistributionContext) -> i64 {
        self.get_f64(ctx).round() as i64
    }

    fn get_f64(&self, ctx: &mut DistributionContext) -> f64 {
        let r = (-2.0 * ctx.next_open_unit().ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * ctx.get_gen_mut().gen::<f64>();
        self.mean + self.stddev * r * theta.cos()
    }

    fn mean(&self) -> Option<f64> {
        Some(self.mean)
    }
}

/// Zeta-distributed ranks over `base..base + items`, rank 0 being the hottest.
pub struct ZipfianDistribution {
    base: i64,
    items: u64,
    skew: f64,
    zipf: Zipf<f64>,
}

impl ZipfianDistribution {
    pub fn new(range: RangeInclusive<i64>, skew: f64) -> Result<Self> {
        anyhow::ensure!(
            range.start() <= range.end(),
            "Empty zipfian range {}..{}",
            range.start(),
            range.end()
        );
        let items = (range.end() - range.start()) as u64 + 1;
        let zipf = Zipf::new(items, skew)
            .map_err(|err| anyhow::anyhow!("Invalid zipfian parameters: {:?}", err))?;
        Ok(Self {
            base: *range.start(),
            items,
            skew,
            zipf,
        })
    }
}

impl Distribution for ZipfianDistribution {
    fn get_i64(&self, ctx: &mut DistributionContext) -> i64 {
        let rank = self.zipf.sample(ctx.get_gen_mut()) as i64;
        self.base + rank - 1
    }

    fn mean(&self) -> Option<f64> {
        let mut weighted = 0.0;
        let mut total = 0.0;
        for rank in 1..=self.items {
            let weight = (rank as f64).powf(-self.skew);
            weighted += weight * (rank - 1) as f64;
            total += weight;
        }
        Some(self.base as f64 + weighted / total)
    }
}

pub struct UniformDistribution {
    range: RangeInclusive<i64>,
    dist: Uniform<i64>,
}

impl UniformDistribution {
    pub fn new(range: RangeInclusive<i64>) -> Result<Self> {
        anyhow::ensure!(
            range.start() <= range.end(),
            "Empty uniform range {}..{}",
            range.start(),
            range.end()
        );
        let dist = Uniform::new_inclusive(range.start(), range.end());
        Ok(Self { range, dist })
    }
}

impl Distribution for UniformDistribution {
    fn get_i64(&self, ctx: &mut DistributionContext) -> i64 {
        self.dist.sample(ctx.get_gen_mut())
    }

    fn mean(&self) -> Option<f64> {
        Some((*self.range.start() as f64 + *self.range.end() as f64) / 2.0)
    }
}

// Generalized Pareto parameters and the empirical probabilities of 1..=14
// byte values, from "Workload Analysis of a Large-Scale Key-Value Store".
const PARETO_MU: f64 = 0.0;
const PARETO_SIGMA: f64 = 214.476;
const PARETO_XI: f64 = 0.348238;
const SMALL_VALUE_TABLE: [f64; 14] = [
    0.00583, 0.17820, 0.09239, 0.00018, 0.02740, 0.00065, 0.00606, 0.00023, 0.00837, 0.00837,
    0.08989, 0.00092, 0.00326, 0.01980,
];
const SMALL_VALUE_MAX: i64 = SMALL_VALUE_TABLE.len() as i64;

/// Heavy-tailed value sizes observed in production caching workloads.
///
/// Sizes 1..=14 come only from the empirical table, larger sizes only from
/// the generalized Pareto tail.
pub struct ParetoValueSizeDistribution {
    small_cdf: [f64; 14],
    small_probability: f64,
}

impl ParetoValueSizeDistribution {
    pub fn new() -> Self {
        let small_probability: f64 = SMALL_VALUE_TABLE.iter().sum();
        let mut small_cdf = [0.0; 14];
        let mut acc = 0.0;
        for (slot, p) in small_cdf.iter_mut().zip(SMALL_VALUE_TABLE.iter()) {
            acc += p / small_probability;
            *slot = acc;
        }
        Self {
            small_cdf,
            small_probability,
        }
    }

    fn pareto_sample(ctx: &mut DistributionContext) -> f64 {
        let u = ctx.next_open_unit();
        PARETO_MU + PARETO_SIGMA * (u.powf(-PARETO_XI) - 1.0) / PARETO_XI
    }

    fn sample_tail(&self, ctx: &mut DistributionContext) -> i64 {
        loop {
            let size = Self::pareto_sample(ctx) as i64;
            if size > SMALL_VALUE_MAX {
                return size;
            }
        }
    }

    fn sample_table(&self, ctx: &mut DistributionContext) -> i64 {
        let choice = ctx.get_gen_mut().gen::<f64>();
        self.small_cdf
            .iter()
            .position(|&f| choice <= f)
            .map(|idx| idx as i64 + 1)
            .unwrap_or(SMALL_VALUE_MAX)
    }
}

impl Default for ParetoValueSizeDistribution {
    fn default() -> Self {
        Self::new()
    }
}

impl Distribution for ParetoValueSizeDistribution {
    fn get_i64(&self, ctx: &mut DistributionContext) -> i64 {
        let choice = ctx.get_gen_mut().gen::<f64>();
        if choice > self.small_probability {
            self.sample_tail(ctx)
        } else {
            self.sample_table(ctx)
        }
    }

    fn mean(&self) -> Option<f64> {
        None
    }
}

// Above this lambda the multiplication method underflows; fall back to the
// normal approximation.
const POISSON_EXACT_LIMIT: f64 = 30.0;

pub struct PoissonDistribution {
    lambda: f64,
}

impl PoissonDistribution {
    pub fn new(lambda: f64) -> Result<Self> {
        anyhow::ensure!(
            lambda.is_finite() && lambda > 0.0,
            "Poisson lambda must be positive, got {}",
            lambda
        );
        Ok(Self { lambda })
    }
}

impl Distribution for PoissonDistribution {
    fn get_i64(&self, ctx: &mut DistributionContext) -> i64 {
        if self.lambda > POISSON_EXACT_LIMIT {
            let approx = NormalDistribution::new(self.lambda, self.lambda.sqrt());
            return approx.get_i64(ctx).max(0);
        }

        let limit = (-self.lambda).exp();
        let mut p = 1.0;
        let mut k = 0;
        loop {
            k += 1;
            p *= ctx.get_gen_mut().gen::<f64>();
            if p <= limit {
                return k - 1;
            }
        }
    }

    fn mean(&self) -> Option<f64> {
        Some(self.lambda)
    }
}

/// Exponentially distributed gaps, i.e. the inter-arrival times of a
/// Poisson process with the given mean gap.
pub struct ExponentialDistribution {
    mean: f64,
    exp: Exp<f64>,
}

impl ExponentialDistribution {
    pub fn new(mean: f64) -> Result<Self> {
        anyhow::ensure!(
            mean.is_finite() && mean > 0.0,
            "Exponential mean must be positive, got {}",
            mean
        );
        let exp = Exp::new(1.0 / mean)
            .map_err(|err| anyhow::anyhow!("Invalid exponential parameters: {:?}", err))?;
        Ok(Self { mean, exp })
    }
}

impl Distribution for ExponentialDistribution {
    fn get_i64(&self, ctx: &mut DistributionContext) -> i64 {
        self.get_f64(ctx).round() as i64
    }

    fn get_f64(&self, ctx: &mut DistributionContext) -> f64 {
        self.exp.sample(ctx.get_gen_mut())
    }

    fn mean(&self) -> Option<f64> {
        Some(self.mean)
    }
}

/// Walks `base..=end` in order, driven by the context's sequence number.
pub struct SequentialDistribution {
    base: i64,
    width: u64,
}

impl SequentialDistribution {
    fn new(range: RangeInclusive<i64>) -> Self {
        let width = (range.end() - range.start()) as u64;
        Self {
            base: *range.start(),
            width: width.wrapping_add(1),
        }
    }
}

impl Distribution for SequentialDistribution {
    fn get_i64(&self, ctx: &mut DistributionContext) -> i64 {
        let mut idx = ctx.get_seq();
        if self.width > 0 {
            idx %= self.width;
        }
        self.base + idx as i64
    }

    fn mean(&self) -> Option<f64> {
        Some(self.base as f64 + (self.width.saturating_sub(1)) as f64 / 2.0)
    }
}

/// Configuration-time description of a distribution.
#[derive(Clone, Debug, PartialEq)]
pub enum DistributionSpec {
    Constant(i64),
    Normal { mean: f64, stddev: f64 },
    Zipfian { range: RangeInclusive<i64>, skew: f64 },
    Uniform(RangeInclusive<i64>),
    ParetoValueSize,
    Poisson(f64),
    Exponential(f64),
    Sequential(RangeInclusive<i64>),
}

impl DistributionSpec {
    pub fn zipfian_items(items: u64, skew: f64) -> Self {
        DistributionSpec::Zipfian {
            range: 0..=(items as i64).saturating_sub(1),
            skew,
        }
    }

    pub fn build(&self) -> Result<Arc<dyn Distribution>> {
        Ok(match self {
            DistributionSpec::Constant(v) => Arc::new(FixedDistribution(*v)),
            DistributionSpec::Normal { mean, stddev } => {
                anyhow::ensure!(*stddev >= 0.0, "Normal stddev must not be negative");
                Arc::new(NormalDistribution::new(*mean, *stddev))
            }
            DistributionSpec::Zipfian { range, skew } => {
                Arc::new(ZipfianDistribution::new(range.clone(), *skew)?)
            }
            DistributionSpec::Uniform(range) => Arc::new(UniformDistribution::new(range.clone())?),
            DistributionSpec::ParetoValueSize => Arc::new(ParetoValueSizeDistribution::new()),
            DistributionSpec::Poisson(lambda) => Arc::new(PoissonDistribution::new(*lambda)?),
            DistributionSpec::Exponential(mean) => Arc::new(ExponentialDistribution::new(*mean)?),
            DistributionSpec::Sequential(range) => {
                Arc::new(SequentialDistribution::new(range.clone()))
            }
        })
    }
}

impl fmt::Display for DistributionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistributionSpec::Constant(v) => write!(f, "constant:{}", v),
            DistributionSpec::Normal { mean, stddev } => write!(f, "normal:{},{}", mean, stddev),
            DistributionSpec::Zipfian { range, skew } => {
                write!(f, "zipfian:{}..{},{}", range.start(), range.end(), skew)
            }
            DistributionSpec::Uniform(range) => {
                write!(f, "uniform:{}..{}", range.start(), range.end())
            }
            DistributionSpec::ParetoValueSize => write!(f, "pareto"),
            DistributionSpec::Poisson(lambda) => write!(f, "poisson:{}", lambda),
            DistributionSpec::Exponential(mean) => write!(f, "exp:{}", mean),
            DistributionSpec::Sequential(range) => {
                write!(f, "seq:{}..{}", range.start(), range.end())
            }
        }
    }
}

/// Tells whether `s` carries its own parameter list, e.g. `constant:5`
/// as opposed to the bare name `constant`.
pub fn has_parameter_list(s: &str) -> bool {
    s.contains('(') || s.contains(':')
}

// Parse distribution description in c-s or s-b style
pub fn parse_distribution(s: &str) -> Result<DistributionSpec> {
    // Locate the argument list and the distribution name
    let (dist_s, args_s) = if let Some(left_paren) = s.find('(') {
        anyhow::ensure!(
            s.ends_with(')'),
            "Missing closing parenthesis ')' for the distribution parameter list"
        );
        (&s[..left_paren], &s[left_paren + 1..s.len() - 1])
    } else if let Some(colon) = s.find(':') {
        (&s[..colon], &s[colon + 1..])
    } else {
        (s, "")
    };

    let args: Vec<_> = if args_s.trim().is_empty() {
        Vec::new()
    } else {
        args_s.split(',').map(str::trim).collect()
    };
    let dist_name = dist_s.trim().to_lowercase();

    let ensure_exact_arg_count = |count: usize| {
        anyhow::ensure!(
            args.len() == count,
            "Expected exactly {} parameters for the {} distribution, got {}",
            count,
            dist_name,
            args.len()
        );
        Ok(())
    };

    match dist_name.as_str() {
        "fixed" | "constant" => {
            ensure_exact_arg_count(1)?;
            Ok(DistributionSpec::Constant(parse_number(args[0])?))
        }
        "normal" | "gaussian" => {
            ensure_exact_arg_count(2)?;
            Ok(DistributionSpec::Normal {
                mean: parse_real(args[0])?,
                stddev: parse_real(args[1])?,
            })
        }
        "zipf" | "zipfian" => {
            ensure_exact_arg_count(2)?;
            let skew = parse_real(args[1])?;
            if args[0].contains("..") {
                Ok(DistributionSpec::Zipfian {
                    range: parse_range(args[0])?,
                    skew,
                })
            } else {
                let items = parse_number(args[0])?;
                anyhow::ensure!(items > 0, "Zipfian item count must be positive");
                Ok(DistributionSpec::zipfian_items(items as u64, skew))
            }
        }
        "uniform" => {
            ensure_exact_arg_count(1)?;
            Ok(DistributionSpec::Uniform(parse_range(args[0])?))
        }
        "pareto" | "fbpareto" => {
            ensure_exact_arg_count(0)?;
            Ok(DistributionSpec::ParetoValueSize)
        }
        "poisson" => {
            ensure_exact_arg_count(1)?;
            Ok(DistributionSpec::Poisson(parse_real(args[0])?))
        }
        "exp" | "exponential" => {
            ensure_exact_arg_count(1)?;
            Ok(DistributionSpec::Exponential(parse_real(args[0])?))
        }
        "seq" => {
            ensure_exact_arg_count(1)?;
            Ok(DistributionSpec::Sequential(parse_range(args[0])?))
        }
        other => Err(anyhow::anyhow!("Unknown distribution: {:?}", other)),
    }
}

fn parse_range(s: &str) -> Result<RangeInclusive<i64>> {
    match s.split_once("..") {
        Some((left, right)) => {
            let left = parse_number(left)?;
            let right = parse_number(right)?;
            anyhow::ensure!(left <= right, "Invalid range {}..{}", left, right);
            Ok(left..=right)
        }
        None => Err(anyhow::anyhow!(
            "The distribution parameter is missing the '..' separator"
        )),
    }
}

pub fn parse_number(s: &str) -> Result<i64> {
    let s = s.trim();
    let last_char = s.chars().rev().next().map(|c| c.to_ascii_lowercase());

    let mult = match last_char {
        Some('b') => Some(1_000_000_000),
        Some('m') => Some(1_000_000),
        Some('k') => Some(1_000),
        _ => None,
    };
    match mult {
        Some(mult) => {
            let num: i64 = s[..s.len() - 1].parse()?;
            num.checked_mul(mult)
                .ok_or_else(|| anyhow::anyhow!("Number {:?} is out of range", s))
        }
        None => Ok(s.parse()?),
    }
}

fn parse_real(s: &str) -> Result<f64> {
    let value: f64 = s
        .trim()
        .parse()
        .map_err(|err| anyhow::anyhow!("Invalid number {:?}: {}", s, err))?;
    anyhow::ensure!(value.is_finite(), "Invalid number {:?}", s);
    Ok(value)
}
