//! Integration tests that build every rule in the example watcher config
//! (`config/watcher.yaml`) through the default registry.

use std::collections::HashSet;

use vigil_core::WatcherConfig;
use vigil_eisenbahn::{DeliveryMode, SourceKey};
use vigil_rules::{Rule, RuleError, RuleRegistry};

/// Integration tests run from the crate directory, so we go up two levels.
fn example_config() -> WatcherConfig {
    let manifest = std::path::Path::new(env!("CARGO_MANIFEST_DIR"));
    let path = manifest.join("../../config/watcher.yaml");
    WatcherConfig::from_file(&path)
        .unwrap_or_else(|e| panic!("Failed to load {}: {}", path.display(), e))
}

fn build_all(config: &WatcherConfig) -> Vec<Box<dyn Rule>> {
    let registry = RuleRegistry::default();
    config
        .rules
        .iter()
        .flat_map(|set| set.configs.iter().map(move |c| (set.classname.as_str(), c)))
        .map(|(class, c)| {
            registry
                .build(class, c)
                .unwrap_or_else(|e| panic!("Failed to build {class}: {e}"))
        })
        .collect()
}

#[test]
fn every_example_rule_builds() {
    let config = example_config();
    let rules = build_all(&config);

    let names: Vec<&str> = rules.iter().map(|r| r.name()).collect();
    assert_eq!(
        names,
        vec![
            "Heartbeat.ATDome:0",
            "Heartbeat.MTMount:0",
            "Heartbeat.ESS:5",
            "Enabled.ATDome:0",
            "Enabled.MTMount:0",
            "Telemetry.MTMount:0",
            "Threshold.ESS:1.temperature.temperatureItem0.dome",
        ]
    );
    let unique: HashSet<_> = names.iter().collect();
    assert_eq!(unique.len(), names.len());
}

#[test]
fn disabled_source_makes_rule_unusable() {
    let config = example_config();
    let disabled: HashSet<SourceKey> = config
        .disabled_sources
        .iter()
        .map(|s| SourceKey::parse(s).unwrap())
        .collect();

    let unusable: Vec<String> = build_all(&config)
        .iter()
        .filter(|r| !r.is_usable(&disabled))
        .map(|r| r.name().to_string())
        .collect();
    assert_eq!(unusable, vec!["Heartbeat.ESS:5"]);
}

#[test]
fn threshold_rule_is_poll_driven() {
    let rules = build_all(&example_config());
    let threshold = rules
        .iter()
        .find(|r| r.name().starts_with("Threshold."))
        .unwrap();
    assert!(threshold
        .sources()
        .iter()
        .all(|d| matches!(d.mode, DeliveryMode::Poll { .. })));
}

#[test]
fn unknown_class_is_rejected() {
    let registry = RuleRegistry::default();
    let config = serde_yaml::from_str("name: ATDome").unwrap();
    assert!(matches!(
        registry.build("NoSuchRule", &config),
        Err(RuleError::UnknownClass(_))
    ));
}
