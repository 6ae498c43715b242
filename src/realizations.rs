use crate::error::{DisaggError, Result};

/// Read-only realization weight table, indexed by realization number.
#[derive(Debug, Clone, PartialEq)]
pub struct RealizationWeights {
    weights: Vec<f64>,
}

impl RealizationWeights {
    pub fn new(weights: Vec<f64>) -> Result<Self> {
        if weights.is_empty() {
            return Err(DisaggError::config("at least one realization is required"));
        }
        if let Some((r, w)) = weights
            .iter()
            .enumerate()
            .find(|(_, w)| !(w.is_finite() && **w >= 0.0))
        {
            return Err(DisaggError::config(format!(
                "realization #{r} has invalid weight {w}"
            )));
        }
        if !(weights.iter().sum::<f64>() > 0.0) {
            return Err(DisaggError::config("realization weights sum to zero"));
        }
        Ok(Self { weights })
    }

    pub fn uniform(n: usize) -> Result<Self> {
        Self::new(vec![1.0 / n.max(1) as f64; n])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    #[inline]
    pub fn weight(&self, rlz: usize) -> f64 {
        self.weights[rlz]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_are_validated() {
        assert!(RealizationWeights::new(vec![]).is_err());
        assert!(RealizationWeights::new(vec![0.5, -0.1]).is_err());
        assert!(RealizationWeights::new(vec![0.0, 0.0]).is_err());
        assert!(RealizationWeights::new(vec![f64::NAN]).is_err());
        let w = RealizationWeights::uniform(4).unwrap();
        assert_eq!(w.len(), 4);
        assert_eq!(w.weight(3), 0.25);
    }
}
