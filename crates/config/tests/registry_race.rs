#![forbid(unsafe_code)]

use std::sync::Arc;

use warden_config::{ConfigurationRegistry, ControllerConfiguration, ControllerIdentity, RegistryError};

#[test]
fn concurrent_register_admits_exactly_one_per_name() {
    let reg = Arc::new(ConfigurationRegistry::new());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let reg = Arc::clone(&reg);
            std::thread::spawn(move || {
                let cfg = ControllerConfiguration::builder(
                    ControllerIdentity::new(format!("op{}::Widget", i)).with_name("widget"),
                    "widgets.example.com",
                    "example.com/v1/Widget",
                )
                .build()
                .expect("valid");
                reg.register(cfg)
            })
        })
        .collect();

    let results: Vec<Result<(), RegistryError>> = handles.into_iter().map(|h| h.join().expect("thread")).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, RegistryError::NameCollision { name, .. } if name == "widget")));
    assert_eq!(reg.get_known_controller_names().into_iter().collect::<Vec<_>>(), vec!["widget".to_string()]);
}
