use crate::aggregation::{
    carry_over,
    check_shapes,
    weights,
    Aggregated,
    AggregationError,
    AggregationInput,
    Aggregator,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
/// The sample count weighted average of the parameters of the participants.
pub struct FedAverage;

impl FedAverage {
    pub const NAME: &'static str = "FedAverage";

    pub(in crate::aggregation) fn aggregate(
        &self,
        input: &AggregationInput<'_>,
    ) -> Result<Aggregated, AggregationError> {
        let weights = weights(input.results)?;
        check_shapes(input.results, input.previous)?;

        let mut global = input.previous.zeros_like();
        for (node_id, update) in input.results.iter() {
            // the weights are computed from the very same results
            let weight = weights.get(node_id).copied().unwrap_or_default();
            global
                .add_scaled(weight, &update.params)
                .map_err(|error| AggregationError::ShapeMismatch(node_id.clone(), error))?;
        }

        Ok(Aggregated {
            global,
            node_states: carry_over(input.results.keys().cloned(), input.node_states),
            aggregator: Aggregator::FedAverage(*self),
        })
    }
}
