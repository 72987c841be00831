use serial_test::serial;

use super::*;

#[test]
#[serial]
fn test_settings_new() {
    assert!(Settings::new("../../configs/config.toml").is_ok());
    assert!(Settings::new("").is_err());
}

#[test]
#[serial]
fn test_load_settings() {
    let settings = Settings::new("../../configs/config.toml").unwrap();
    assert_eq!(settings.experiment.researcher_id, "researcher-0");
    assert_eq!(settings.experiment.experiment_id.as_deref(), Some("mnist-fedavg"));
    assert_eq!(settings.experiment.round_limit, 10);
    assert_eq!(settings.experiment.tags, vec!["mnist", "train"]);
    assert!(settings.experiment.nodes.is_empty());
    assert_eq!(settings.round.timeout(), Duration::from_secs(600));
    assert_eq!(settings.aggregator.kind, AggregatorKind::FedAverage);
    assert_eq!(settings.training.num_updates, Some(100));
    assert!(!settings.secagg.enable);
    assert_eq!(settings.secagg.mask_config(), MaskConfig::default());
    assert!(settings.checkpoint.enable);
    assert_eq!(settings.checkpoint.path, PathBuf::from("./checkpoints"));
    assert_eq!(settings.optimizer.kind, OptimizerKind::Sgd);
    assert_eq!(
        ServerOptimizer::from(&settings.optimizer),
        ServerOptimizer::default()
    );
}

#[test]
#[serial]
fn test_optimizer_from_environment() {
    std::env::set_var("FEDROUND_OPTIMIZER__KIND", "Adam");
    std::env::set_var("FEDROUND_OPTIMIZER__LEARNING_RATE", "0.01");
    let settings = Settings::new("../../configs/config.toml");
    std::env::remove_var("FEDROUND_OPTIMIZER__KIND");
    std::env::remove_var("FEDROUND_OPTIMIZER__LEARNING_RATE");

    let settings = settings.unwrap();
    assert_eq!(settings.optimizer.kind, OptimizerKind::Adam);
    assert_eq!(ServerOptimizer::from(&settings.optimizer).name(), "Adam");
}

#[test]
#[serial]
fn test_invalid_optimizer() {
    std::env::set_var("FEDROUND_OPTIMIZER__KIND", "Momentum");
    std::env::set_var("FEDROUND_OPTIMIZER__BETA", "1.5");
    let settings = Settings::new("../../configs/config.toml");
    std::env::remove_var("FEDROUND_OPTIMIZER__KIND");
    std::env::remove_var("FEDROUND_OPTIMIZER__BETA");

    assert!(matches!(settings, Err(SettingsError::Validation(_))));
}

#[test]
fn test_validate_optimizer() {
    let settings = OptimizerSettings::default();
    assert!(settings.validate_optimizer().is_ok());
    assert!(OptimizerSettings {
        kind: OptimizerKind::Yogi,
        epsilon: 0.,
        ..settings
    }
    .validate_optimizer()
    .is_err());
    assert!(OptimizerSettings {
        learning_rate: f64::INFINITY,
        ..settings
    }
    .validate_optimizer()
    .is_err());
}

#[test]
#[serial]
fn test_environment_overrides() {
    std::env::set_var("FEDROUND_ROUND__TIMEOUT", "30");
    std::env::set_var("FEDROUND_AGGREGATOR__KIND", "Scaffold");
    let settings = Settings::new("../../configs/config.toml");
    std::env::remove_var("FEDROUND_ROUND__TIMEOUT");
    std::env::remove_var("FEDROUND_AGGREGATOR__KIND");

    let settings = settings.unwrap();
    assert_eq!(settings.round.timeout(), Duration::from_secs(30));
    assert_eq!(settings.aggregator.kind, AggregatorKind::Scaffold);
}

#[test]
#[serial]
fn test_scaffold_preconditions() {
    std::env::set_var("FEDROUND_AGGREGATOR__KIND", "Scaffold");
    std::env::set_var("FEDROUND_SECAGG__ENABLE", "true");
    let with_secagg = Settings::new("../../configs/config.toml");
    std::env::remove_var("FEDROUND_AGGREGATOR__KIND");
    std::env::remove_var("FEDROUND_SECAGG__ENABLE");

    assert!(matches!(with_secagg, Err(SettingsError::Validation(_))));
}

#[test]
fn test_validate_aggregator() {
    let settings = AggregatorSettings {
        kind: AggregatorKind::Scaffold,
        server_lr: 1.0,
    };
    assert!(settings.validate_aggregator().is_ok());
    assert!(AggregatorSettings {
        server_lr: 0.,
        ..settings
    }
    .validate_aggregator()
    .is_err());
    assert!(AggregatorSettings {
        server_lr: f64::NAN,
        ..settings
    }
    .validate_aggregator()
    .is_err());
}

#[test]
fn test_validate_secagg() {
    assert!(SecaggSettings::default().validate_secagg().is_ok());
    assert!(SecaggSettings {
        clipping_range: 0.,
        ..SecaggSettings::default()
    }
    .validate_secagg()
    .is_err());
    assert!(SecaggSettings {
        fixed_point_bits: 0,
        ..SecaggSettings::default()
    }
    .validate_secagg()
    .is_err());
    assert!(SecaggSettings {
        timeout: 0,
        ..SecaggSettings::default()
    }
    .validate_secagg()
    .is_err());
}

#[test]
fn test_training_args() {
    let settings = TrainingSettings {
        num_updates: Some(10),
        epochs: None,
        learning_rate: Some(0.5),
        batch_size: Some(8),
    };
    let args = TrainingArgs::from(&settings);
    assert_eq!(args.num_updates, Some(10));
    assert_eq!(args.learning_rate, Some(0.5));
    assert_eq!(args.batch_size, Some(8));
    assert_eq!(args.epochs, None);
}
