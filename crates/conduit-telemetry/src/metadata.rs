use conduit_config::TelemetryConfig;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource as semconv;

const SERVICE_INSTANCE_ID: &str = "service.instance.id";

/// Resource shared by traces and metrics
///
/// Several gateway processes report under one service name, so each gets a
/// `service.instance.id` unless configuration pins one.
pub fn build_resource(config: &TelemetryConfig) -> Resource {
    let mut attrs = vec![
        KeyValue::new(semconv::SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];

    if !config.resource_attributes.contains_key(SERVICE_INSTANCE_ID) {
        attrs.push(KeyValue::new(SERVICE_INSTANCE_ID, instance_id()));
    }
    attrs.extend(
        config
            .resource_attributes
            .iter()
            .map(|(key, value)| KeyValue::new(key.clone(), value.clone())),
    );

    Resource::builder().with_attributes(attrs).build()
}

fn instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());
    format!("{host}:{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use opentelemetry::Key;

    use super::*;

    #[test]
    fn configured_instance_id_wins() {
        let mut config = TelemetryConfig::default();
        let generated = build_resource(&config);
        assert!(generated.get(&Key::new(SERVICE_INSTANCE_ID)).is_some());
        assert_eq!(
            generated.get(&Key::new(semconv::SERVICE_NAME)).map(|v| v.to_string()),
            Some("conduit".to_owned())
        );

        config
            .resource_attributes
            .insert(SERVICE_INSTANCE_ID.to_owned(), "gw-1".to_owned());
        let pinned = build_resource(&config);
        assert_eq!(
            pinned.get(&Key::new(SERVICE_INSTANCE_ID)).map(|v| v.to_string()),
            Some("gw-1".to_owned())
        );
    }
}
