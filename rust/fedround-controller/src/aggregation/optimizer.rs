//! Server side optimizers.
//!
//! A [`ServerOptimizer`] treats the difference between the previous and the aggregated global
//! parameters of a round as a pseudo-gradient and applies it to the previous global parameters.
//! Plain [`Sgd`] with a learning rate of `1` keeps the aggregated parameters as they are, which is
//! the default.
//!
//! The stateful optimizers keep their moments in the optimizer value itself. Like the aggregator,
//! a step returns the successor optimizer, which the controller commits when the round completes.

use fedround_core::model::{Parameters, ShapeError};

use crate::{
    aggregation::{AggregationError, PreconditionError},
    settings::{OptimizerKind, OptimizerSettings},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// Stochastic gradient descent on the pseudo-gradient.
pub struct Sgd {
    pub learning_rate: f64,
}

impl Sgd {
    pub const NAME: &'static str = "Sgd";

    #[allow(clippy::float_cmp)]
    fn step(&self, previous: &Parameters, aggregated: &Parameters) -> Result<Parameters, ShapeError> {
        if self.learning_rate == 1. {
            previous.check_shape(aggregated)?;
            return Ok(aggregated.clone());
        }
        let lr = self.learning_rate;
        previous.zip_with(aggregated, |p, a| p - lr * (p - a))
    }
}

impl Default for Sgd {
    fn default() -> Self {
        Self { learning_rate: 1. }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Gradient descent with heavy ball momentum.
pub struct Momentum {
    pub learning_rate: f64,
    pub beta: f64,
    /// The accumulated pseudo-gradients, missing before the first step.
    #[serde(default)]
    pub velocity: Option<Parameters>,
}

impl Momentum {
    pub const NAME: &'static str = "Momentum";

    pub fn new(learning_rate: f64, beta: f64) -> Self {
        Self {
            learning_rate,
            beta,
            velocity: None,
        }
    }

    fn step(&self, previous: &Parameters, gradient: &Parameters) -> Result<(Parameters, Self), ShapeError> {
        let beta = self.beta;
        let velocity = match &self.velocity {
            Some(velocity) => velocity.zip_with(gradient, |v, g| beta * v + g)?,
            None => gradient.clone(),
        };
        let lr = self.learning_rate;
        let global = previous.zip_with(&velocity, |p, v| p - lr * v)?;
        Ok((
            global,
            Self {
                velocity: Some(velocity),
                ..self.clone()
            },
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The state of the adaptive optimizers, Adam and Yogi.
pub struct Adaptive {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    /// The number of steps taken so far.
    #[serde(default)]
    pub step: u64,
    #[serde(default)]
    pub first_moment: Option<Parameters>,
    #[serde(default)]
    pub second_moment: Option<Parameters>,
}

impl Adaptive {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            step: 0,
            first_moment: None,
            second_moment: None,
        }
    }

    fn step(
        &self,
        previous: &Parameters,
        gradient: &Parameters,
        yogi: bool,
    ) -> Result<(Parameters, Self), ShapeError> {
        let Self {
            learning_rate: lr,
            beta1,
            beta2,
            epsilon,
            ..
        } = *self;
        let step = self.step.saturating_add(1);

        let first_moment = match &self.first_moment {
            Some(m) => m.zip_with(gradient, |m, g| beta1 * m + (1. - beta1) * g)?,
            None => gradient.map(|g| (1. - beta1) * g),
        };
        let squared = gradient.map(|g| g * g);
        let second_moment = match &self.second_moment {
            Some(v) if yogi => v.zip_with(&squared, |v, g2| v - (1. - beta2) * g2 * sign(v - g2))?,
            Some(v) => v.zip_with(&squared, |v, g2| beta2 * v + (1. - beta2) * g2)?,
            None => squared.map(|g2| (1. - beta2) * g2),
        };

        let correction1 = 1. - beta1.powf(step as f64);
        let correction2 = 1. - beta2.powf(step as f64);
        let update = first_moment.zip_with(&second_moment, |m, v| {
            lr * (m / correction1) / ((v / correction2).sqrt() + epsilon)
        })?;
        let global = previous.zip_with(&update, |p, u| p - u)?;
        Ok((
            global,
            Self {
                step,
                first_moment: Some(first_moment),
                second_moment: Some(second_moment),
                ..*self
            },
        ))
    }
}

fn sign(x: f64) -> f64 {
    if x > 0. {
        1.
    } else if x < 0. {
        -1.
    } else {
        0.
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The server optimizers.
pub enum ServerOptimizer {
    Sgd(Sgd),
    Momentum(Momentum),
    Adam(Adaptive),
    Yogi(Adaptive),
}

impl Default for ServerOptimizer {
    fn default() -> Self {
        ServerOptimizer::Sgd(Sgd::default())
    }
}

impl From<&OptimizerSettings> for ServerOptimizer {
    fn from(settings: &OptimizerSettings) -> Self {
        let adaptive = || {
            Adaptive::new(
                settings.learning_rate,
                settings.beta1,
                settings.beta2,
                settings.epsilon,
            )
        };
        match settings.kind {
            OptimizerKind::Sgd => ServerOptimizer::Sgd(Sgd {
                learning_rate: settings.learning_rate,
            }),
            OptimizerKind::Momentum => {
                ServerOptimizer::Momentum(Momentum::new(settings.learning_rate, settings.beta))
            }
            OptimizerKind::Adam => ServerOptimizer::Adam(adaptive()),
            OptimizerKind::Yogi => ServerOptimizer::Yogi(adaptive()),
        }
    }
}

impl ServerOptimizer {
    /// Gets the name of the optimizer.
    pub fn name(&self) -> &'static str {
        match self {
            ServerOptimizer::Sgd(_) => Sgd::NAME,
            ServerOptimizer::Momentum(_) => Momentum::NAME,
            ServerOptimizer::Adam(_) => "Adam",
            ServerOptimizer::Yogi(_) => "Yogi",
        }
    }

    /// Gets the parameter shaped state of the optimizer.
    pub fn state(&self) -> Vec<&Parameters> {
        match self {
            ServerOptimizer::Sgd(_) => Vec::new(),
            ServerOptimizer::Momentum(momentum) => momentum.velocity.iter().collect(),
            ServerOptimizer::Adam(adaptive) | ServerOptimizer::Yogi(adaptive) => adaptive
                .first_moment
                .iter()
                .chain(adaptive.second_moment.iter())
                .collect(),
        }
    }

    /// Checks the hyperparameters: a positive learning rate, decay rates in `[0, 1)` and a
    /// positive epsilon.
    pub fn check_preconditions(&self) -> Result<(), PreconditionError> {
        let unit = |beta: f64| (0. ..1.).contains(&beta);
        let positive = |x: f64| x.is_finite() && x > 0.;
        let valid = match self {
            ServerOptimizer::Sgd(sgd) => positive(sgd.learning_rate),
            ServerOptimizer::Momentum(momentum) => {
                positive(momentum.learning_rate) && unit(momentum.beta)
            }
            ServerOptimizer::Adam(adaptive) | ServerOptimizer::Yogi(adaptive) => {
                positive(adaptive.learning_rate)
                    && unit(adaptive.beta1)
                    && unit(adaptive.beta2)
                    && positive(adaptive.epsilon)
            }
        };
        if valid {
            Ok(())
        } else {
            Err(PreconditionError::Optimizer(self.name()))
        }
    }

    /// Applies the aggregated parameters of a round to the previous global parameters.
    ///
    /// Returns the new global parameters and the successor of the optimizer.
    ///
    /// # Errors
    /// Fails if the layouts or the optimizer state don't fit the previous parameters, or if the
    /// new global parameters are not finite.
    pub fn step(
        &self,
        previous: &Parameters,
        aggregated: &Parameters,
    ) -> Result<(Parameters, ServerOptimizer), AggregationError> {
        let (global, successor) = match self {
            ServerOptimizer::Sgd(sgd) => (
                sgd.step(previous, aggregated)
                    .map_err(AggregationError::OptimizerState)?,
                self.clone(),
            ),
            ServerOptimizer::Momentum(momentum) => {
                let (global, momentum) = momentum
                    .step(previous, &pseudo_gradient(previous, aggregated)?)
                    .map_err(AggregationError::OptimizerState)?;
                (global, ServerOptimizer::Momentum(momentum))
            }
            ServerOptimizer::Adam(adaptive) => {
                let (global, adaptive) = adaptive
                    .step(previous, &pseudo_gradient(previous, aggregated)?, false)
                    .map_err(AggregationError::OptimizerState)?;
                (global, ServerOptimizer::Adam(adaptive))
            }
            ServerOptimizer::Yogi(adaptive) => {
                let (global, adaptive) = adaptive
                    .step(previous, &pseudo_gradient(previous, aggregated)?, true)
                    .map_err(AggregationError::OptimizerState)?;
                (global, ServerOptimizer::Yogi(adaptive))
            }
        };
        if !global.is_finite() {
            return Err(AggregationError::NonFinite);
        }
        Ok((global, successor))
    }
}

fn pseudo_gradient(previous: &Parameters, aggregated: &Parameters) -> Result<Parameters, AggregationError> {
    previous
        .zip_with(aggregated, |p, a| p - a)
        .map_err(AggregationError::OptimizerState)
}

#[cfg(test)]
mod tests {
    use fedround_core::testutils::parameters;

    use super::*;

    fn assert_close(actual: &Parameters, expected: f64) {
        for value in actual.flatten() {
            assert!((value - expected).abs() < 1e-9, "{} != {}", value, expected);
        }
    }

    #[test]
    fn test_default_keeps_the_aggregated_parameters() {
        let (global, successor) = ServerOptimizer::default()
            .step(&parameters(0.3), &parameters(-1.7))
            .unwrap();
        assert_eq!(global, parameters(-1.7));
        assert_eq!(successor, ServerOptimizer::default());
    }

    #[test]
    fn test_sgd_scales_the_step() {
        let optimizer = ServerOptimizer::Sgd(Sgd { learning_rate: 0.5 });
        let (global, _) = optimizer.step(&parameters(1.), &parameters(3.)).unwrap();
        assert_close(&global, 2.);
    }

    #[test]
    fn test_momentum_accumulates() {
        let optimizer = ServerOptimizer::Momentum(Momentum::new(1., 0.5));

        // the pseudo-gradient is -1 in both rounds
        let (global, optimizer) = optimizer.step(&parameters(0.), &parameters(1.)).unwrap();
        assert_close(&global, 1.);
        let (global, optimizer) = optimizer.step(&global, &parameters(2.)).unwrap();
        assert_close(&global, 2.5);
        match optimizer {
            ServerOptimizer::Momentum(momentum) => {
                assert_close(momentum.velocity.as_ref().unwrap(), -1.5)
            }
            _ => panic!("expected the momentum optimizer"),
        }
    }

    #[test]
    fn test_adam_first_step_is_the_signed_learning_rate() {
        let optimizer = ServerOptimizer::Adam(Adaptive::new(0.1, 0.9, 0.99, 1e-12));
        let (global, optimizer) = optimizer.step(&parameters(1.), &parameters(3.)).unwrap();

        // the bias corrected moments reduce the first step to `lr * sign(gradient)`
        assert_close(&global, 1.1);
        match optimizer {
            ServerOptimizer::Adam(adaptive) => assert_eq!(adaptive.step, 1),
            _ => panic!("expected the Adam optimizer"),
        }
    }

    #[test]
    fn test_yogi_differs_from_adam_after_the_first_step() {
        let adam = ServerOptimizer::Adam(Adaptive::new(0.1, 0.9, 0.99, 1e-3));
        let yogi = ServerOptimizer::Yogi(Adaptive::new(0.1, 0.9, 0.99, 1e-3));

        let (adam_global, adam) = adam.step(&parameters(0.), &parameters(1.)).unwrap();
        let (yogi_global, yogi) = yogi.step(&parameters(0.), &parameters(1.)).unwrap();
        assert_eq!(adam_global, yogi_global);

        let (adam_global, _) = adam.step(&adam_global, &parameters(5.)).unwrap();
        let (yogi_global, _) = yogi.step(&yogi_global, &parameters(5.)).unwrap();
        assert_ne!(adam_global, yogi_global);
    }

    #[test]
    fn test_state_of_another_layout() {
        let optimizer = ServerOptimizer::Momentum(Momentum {
            learning_rate: 1.,
            beta: 0.9,
            velocity: Some(Parameters::from_layers(vec![("other", vec![0.])])),
        });
        assert!(matches!(
            optimizer.step(&parameters(0.), &parameters(1.)),
            Err(AggregationError::OptimizerState(_))
        ));
    }

    #[test]
    fn test_check_preconditions() {
        assert!(ServerOptimizer::default().check_preconditions().is_ok());
        assert!(ServerOptimizer::Adam(Adaptive::new(0.01, 0.9, 0.99, 1e-3))
            .check_preconditions()
            .is_ok());
        assert_eq!(
            ServerOptimizer::Sgd(Sgd { learning_rate: 0. }).check_preconditions(),
            Err(PreconditionError::Optimizer("Sgd"))
        );
        assert_eq!(
            ServerOptimizer::Momentum(Momentum::new(1., 1.)).check_preconditions(),
            Err(PreconditionError::Optimizer("Momentum"))
        );
        assert_eq!(
            ServerOptimizer::Yogi(Adaptive::new(0.01, 0.9, 0.99, 0.)).check_preconditions(),
            Err(PreconditionError::Optimizer("Yogi"))
        );
    }

    #[test]
    fn test_optimizer_state_survives_serialization() {
        let (_, optimizer) = ServerOptimizer::Adam(Adaptive::new(0.1, 0.9, 0.99, 1e-3))
            .step(&parameters(0.), &parameters(1.))
            .unwrap();
        let json = serde_json::to_string(&optimizer).unwrap();
        assert_eq!(serde_json::from_str::<ServerOptimizer>(&json).unwrap(), optimizer);
    }
}
