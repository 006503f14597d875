use rand::Rng;

/// Probability distributions used to shape synthetic traffic: inter-packet
/// delays in microseconds and extra payload bytes.
///
/// The sample formulas reproduce the historical generator bit-for-bit in
/// shape, including the non-textbook Weibull multiplicative chain. Changing
/// them changes the observable traffic and invalidates comparisons against
/// prior captures.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Distribution {
    Uniform { scale: f64, offset: f64 },
    Exponential { mean: f64 },
    Weibull { shape: f64, scale_inv: f64 },
}

impl Distribution {
    pub fn name(&self) -> &'static str {
        match *self {
            Distribution::Uniform { .. } => "uniform",
            Distribution::Exponential { .. } => "exp",
            Distribution::Weibull { .. } => "weibull",
        }
    }

    /// Draw one variate. Uniform draws live in [0,1), so the exponential
    /// logarithm never sees zero; the result may still be non-finite for
    /// degenerate parameters and is clamped at table-generation time.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        match *self {
            Distribution::Uniform { scale, offset } => scale * rng.gen::<f64>() + offset,
            Distribution::Exponential { mean } => -mean * (1.0 - rng.gen::<f64>()).ln(),
            Distribution::Weibull { shape, scale_inv } => {
                // Multiplicative chain of uniform draws, chain length derived
                // from the shape parameter. Historical formula, kept verbatim.
                let mut x = rng.gen::<f64>();
                let mut i = shape - 1.0;
                while i >= 1.0 {
                    x *= rng.gen::<f64>();
                    i -= 1.0;
                }
                -(1.0 / scale_inv) * x.ln()
            }
        }
    }

    /// Presample `count` variates into a table consumed strictly in order by
    /// the send loop, so sampling cost is paid before the timed run. The
    /// `as` cast saturates: negative samples clamp to 0, unbounded ones to
    /// `u32::MAX`.
    pub fn generate_table<R: Rng>(&self, count: usize, rng: &mut R) -> Vec<u32> {
        (0..count).map(|_| self.sample(rng).max(0.0) as u32).collect()
    }

    /// Parse the `name key=value,key=value` notation, e.g.
    /// `uniform n=0,k=100`, `exp y=250`, `weibull a=33,b=55`.
    pub fn create(name: &str, params: &str) -> Result<Self, String> {
        match name {
            "uniform" => Ok(Distribution::Uniform {
                scale: param(params, "n")?,
                offset: param(params, "k")?,
            }),
            "exp" => Ok(Distribution::Exponential {
                mean: param(params, "y")?,
            }),
            "weibull" => Ok(Distribution::Weibull {
                shape: param(params, "a")?,
                scale_inv: param(params, "b")?,
            }),
            _ => Err(format!("unknown distribution: {}", name)),
        }
    }
}

fn param(params: &str, key: &str) -> Result<f64, String> {
    for tok in params.split(',') {
        if let Some((k, v)) = tok.split_once('=') {
            if k.trim() == key {
                return v
                    .trim()
                    .parse()
                    .map_err(|_| format!("bad value for {}: {}", key, v));
            }
        }
    }
    Err(format!("missing parameter {} in {:?}", key, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_mt::Mt64;

    #[test]
    fn parses_all_distribution_kinds() {
        assert_eq!(
            Distribution::create("uniform", "n=10,k=3").unwrap(),
            Distribution::Uniform {
                scale: 10.0,
                offset: 3.0
            }
        );
        assert_eq!(
            Distribution::create("exp", "y=250").unwrap(),
            Distribution::Exponential { mean: 250.0 }
        );
        assert_eq!(
            Distribution::create("weibull", "a=33,b=55").unwrap(),
            Distribution::Weibull {
                shape: 33.0,
                scale_inv: 55.0
            }
        );
    }

    #[test]
    fn rejects_unknown_kind_and_missing_params() {
        assert!(Distribution::create("normal", "m=0,s=1").is_err());
        assert!(Distribution::create("uniform", "n=10").is_err());
        assert!(Distribution::create("exp", "y=abc").is_err());
    }

    #[test]
    fn table_has_exactly_count_entries() {
        let mut rng = Mt64::new(7);
        let dist = Distribution::Exponential { mean: 100.0 };
        assert!(dist.generate_table(0, &mut rng).is_empty());
        assert_eq!(dist.generate_table(1000, &mut rng).len(), 1000);
    }

    #[test]
    fn degenerate_uniform_is_all_zero() {
        let mut rng = Mt64::new(7);
        let dist = Distribution::Uniform {
            scale: 0.0,
            offset: 0.0,
        };
        assert!(dist.generate_table(500, &mut rng).iter().all(|&v| v == 0));
    }

    #[test]
    fn weibull_chain_samples_are_finite_for_sane_params() {
        let mut rng = Mt64::new(42);
        let dist = Distribution::Weibull {
            shape: 3.0,
            scale_inv: 55.0,
        };
        for _ in 0..1000 {
            let v = dist.sample(&mut rng);
            assert!(v.is_finite());
            assert!(v >= 0.0);
        }
    }

    #[test]
    fn same_seed_same_table() {
        let dist = Distribution::Exponential { mean: 1000.0 };
        let a = dist.generate_table(100, &mut Mt64::new(9));
        let b = dist.generate_table(100, &mut Mt64::new(9));
        assert_eq!(a, b);
    }
}
