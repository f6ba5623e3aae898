use hs_types::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("HyperSearch basic usage example");

    let manifest = serde_json::json!({
        "meta": {"name": "mnist-random", "namespace": "demo"},
        "spec": {
            "parameters": [
                {"name": "lr", "parameterType": "double", "feasibleSpace": {"min": "0.01", "max": "0.1"}},
                {"name": "optimizer", "parameterType": "categorical", "feasibleSpace": {"list": ["sgd", "adam"]}}
            ],
            "objective": {"type": "maximize", "goal": 0.95, "objectiveMetricName": "accuracy"},
            "algorithm": {"algorithmName": "random"},
            "parallelTrialCount": 2,
            "maxTrialCount": 8
        }
    });

    let mut experiment: Experiment = serde_json::from_value(manifest)?;
    println!(
        "Loaded experiment {} with {} parameters",
        experiment.key(),
        experiment.spec.parameters.len()
    );

    experiment.mark_created(EXPERIMENT_CREATED_REASON, "Experiment is created");
    experiment.mark_running(EXPERIMENT_RUNNING_REASON, "Experiment is running");
    for condition in experiment.status.conditions.iter() {
        println!(
            "  {:?}={} ({})",
            condition.condition_type, condition.status, condition.reason
        );
    }

    let objective = &experiment.spec.objective;
    println!(
        "Objective metric '{}' uses the {:?} strategy",
        objective.objective_metric_name,
        objective.strategy_for(&objective.objective_metric_name)
    );

    let config = ControllerConfig::default();
    println!(
        "Default parallelism {} with {} configured algorithms",
        config.runtime.default_parallel_trial_count,
        config.suggestion.len()
    );

    Ok(())
}
