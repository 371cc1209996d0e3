use anyhow::Result;
use image::RgbImage;

use super::ProbabilityModel;
use crate::config::check_ensemble_weights;
use crate::error::ConfigurationError;

/// Weighted average of member probabilities. Weights are rescaled to sum
/// to exactly 1 so the combined scores stay a distribution.
pub struct EnsembleModel {
    members: Vec<(Box<dyn ProbabilityModel>, f64)>,
    name: String,
}

impl EnsembleModel {
    pub fn new(members: Vec<(Box<dyn ProbabilityModel>, f64)>) -> Result<Self, ConfigurationError> {
        if members.len() < 2 {
            return Err(ConfigurationError::invalid(
                "classification",
                "an ensemble needs at least two members",
            ));
        }
        let weights: Vec<f64> = members.iter().map(|(_, w)| *w).collect();
        check_ensemble_weights(&weights)
            .map_err(|message| ConfigurationError::invalid("classification", message))?;

        let first = members[0].0.class_names();
        if let Some((other, _)) = members.iter().find(|(m, _)| m.class_names() != first) {
            return Err(ConfigurationError::invalid(
                "classification",
                format!("ensemble member `{}` has a different class list", other.name()),
            ));
        }

        let name = format!(
            "ensemble({})",
            members
                .iter()
                .map(|(m, w)| format!("{}:{:.2}", m.name(), w))
                .collect::<Vec<_>>()
                .join("+")
        );
        let total: f64 = weights.iter().sum();
        let members = members.into_iter().map(|(m, w)| (m, w / total)).collect();
        Ok(Self { members, name })
    }
}

impl ProbabilityModel for EnsembleModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_names(&self) -> &[String] {
        self.members[0].0.class_names()
    }

    fn input_size(&self) -> u32 {
        self.members.iter().map(|(m, _)| m.input_size()).max().unwrap_or(0)
    }

    fn predict(&self, crop: &RgbImage) -> Result<Vec<f64>> {
        let mut combined = vec![0.0; self.class_names().len()];
        for (model, weight) in &self.members {
            let probabilities = model.predict(crop)?;
            anyhow::ensure!(
                probabilities.len() == combined.len(),
                "ensemble member `{}` returned {} scores",
                model.name(),
                probabilities.len()
            );
            for (acc, p) in combined.iter_mut().zip(probabilities) {
                *acc += weight * p;
            }
        }
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::classification::HeuristicModel;
    use image::Rgb;

    fn heuristic() -> Box<dyn ProbabilityModel> {
        Box::new(HeuristicModel::new(vec!["A".into(), "B".into(), "C".into()], 8))
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        assert!(EnsembleModel::new(vec![(heuristic(), 0.6), (heuristic(), 0.6)]).is_err());
        assert!(EnsembleModel::new(vec![(heuristic(), 0.6), (heuristic(), 0.405)]).is_ok());
    }

    #[test]
    fn test_tolerated_weight_sum_stays_a_distribution() -> Result<()> {
        let single = || -> Box<dyn ProbabilityModel> { Box::new(HeuristicModel::new(vec!["Only".into()], 8)) };
        let ensemble = EnsembleModel::new(vec![(single(), 0.6), (single(), 0.405)])?;
        let crop = RgbImage::from_pixel(10, 10, Rgb([20, 20, 20]));
        let scores = ensemble.predict(&crop)?;
        assert_eq!(scores.len(), 1);
        assert!((scores[0] - 1.0).abs() < 1e-12 && scores[0] <= 1.0, "score {}", scores[0]);

        let wide = EnsembleModel::new(vec![(heuristic(), 0.6), (heuristic(), 0.405)])?;
        let sum: f64 = wide.predict(&crop)?.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_identical_members_average_to_member() -> Result<()> {
        let ensemble = EnsembleModel::new(vec![(heuristic(), 0.3), (heuristic(), 0.7)])?;
        let crop = RgbImage::from_pixel(10, 10, Rgb([20, 20, 20]));
        let single = heuristic().predict(&crop)?;
        let combined = ensemble.predict(&crop)?;
        for (a, b) in single.iter().zip(&combined) {
            assert!((a - b).abs() < 1e-12);
        }
        Ok(())
    }
}
